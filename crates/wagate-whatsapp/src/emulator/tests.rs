use super::*;
use std::time::Duration;
use tokio::time::timeout;
use wagate_core::jid::Jid;
use wagate_core::wa::{DeviceIdentity, GroupInfo, ParticipantAction, WaMessage};

fn fast_config() -> EmulatorConfig {
    EmulatorConfig {
        device_name: "test".into(),
        qr_first_ttl: Duration::from_millis(50),
        qr_rotation_ttl: Duration::from_millis(20),
        qr_rotations: 3,
        auto_pair_after: None,
        send_latency: Duration::from_millis(5),
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<WaEvent>) -> WaEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

async fn paired(emulator: &Emulator) -> (Arc<dyn WaClient>, mpsc::UnboundedReceiver<WaEvent>, SessionId) {
    let session_id = SessionId::new();
    let (client, mut rx) = emulator
        .new_client(ClientOptions {
            session_id,
            device: None,
            proxy: None,
        })
        .await
        .unwrap();
    client.connect().await.unwrap();
    assert!(matches!(next_event(&mut rx).await, WaEvent::Qr { .. }));
    emulator.client(session_id).unwrap().scan().unwrap();
    assert!(matches!(next_event(&mut rx).await, WaEvent::PairSuccess { .. }));
    assert_eq!(next_event(&mut rx).await, WaEvent::Connected);
    (client, rx, session_id)
}

#[tokio::test]
async fn test_qr_rotation_then_exhaustion() {
    let emulator = Emulator::new(fast_config());
    let session_id = SessionId::new();
    let (client, mut rx) = emulator
        .new_client(ClientOptions {
            session_id,
            device: None,
            proxy: None,
        })
        .await
        .unwrap();
    client.connect().await.unwrap();

    let mut codes = Vec::new();
    for _ in 0..3 {
        match next_event(&mut rx).await {
            WaEvent::Qr { code, .. } => {
                assert!(code.starts_with("2@"));
                assert_eq!(code.split(',').count(), 4);
                codes.push(code);
            }
            other => panic!("expected QR, got {other:?}"),
        }
    }
    codes.dedup();
    assert_eq!(codes.len(), 3, "each rotation issues a fresh code");
    assert_eq!(next_event(&mut rx).await, WaEvent::QrExhausted);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_scan_pairs_and_connects() {
    let emulator = Emulator::new(fast_config());
    let (client, _rx, session_id) = paired(&emulator).await;
    let jid = client.own_jid().unwrap();
    assert!(jid.device.is_some());
    assert!(client.is_connected());
    assert!(!emulator.client(session_id).unwrap().is_pairing());
}

#[tokio::test]
async fn test_stored_device_connects_without_qr() {
    let emulator = Emulator::new(fast_config());
    let device = DeviceIdentity {
        jid: Jid::user("5511999999999").with_device(3),
        blob: vec![9; 8],
    };
    let (client, mut rx) = emulator
        .new_client(ClientOptions {
            session_id: SessionId::new(),
            device: Some(device.clone()),
            proxy: None,
        })
        .await
        .unwrap();
    client.connect().await.unwrap();
    assert_eq!(next_event(&mut rx).await, WaEvent::Connected);
    assert_eq!(client.own_jid(), Some(device.jid));
}

#[tokio::test]
async fn test_auto_pair() {
    let emulator = Emulator::new(EmulatorConfig {
        auto_pair_after: Some(Duration::from_millis(10)),
        ..fast_config()
    });
    let (client, mut rx) = emulator
        .new_client(ClientOptions {
            session_id: SessionId::new(),
            device: None,
            proxy: None,
        })
        .await
        .unwrap();
    client.connect().await.unwrap();
    assert!(matches!(next_event(&mut rx).await, WaEvent::Qr { .. }));
    assert!(matches!(next_event(&mut rx).await, WaEvent::PairSuccess { .. }));
    assert_eq!(next_event(&mut rx).await, WaEvent::Connected);
}

#[tokio::test]
async fn test_pair_code_flow() {
    let emulator = Emulator::new(fast_config());
    let session_id = SessionId::new();
    let (client, mut rx) = emulator
        .new_client(ClientOptions {
            session_id,
            device: None,
            proxy: None,
        })
        .await
        .unwrap();

    assert_eq!(
        client.pair_phone("+55 11 98888-7777", "wagate").await,
        Err(WaError::NotConnected)
    );
    client.connect().await.unwrap();
    let code = client.pair_phone("+55 11 98888-7777", "wagate").await.unwrap();
    assert_eq!(code.len(), 9);
    assert_eq!(&code[4..5], "-");

    let jid = emulator.client(session_id).unwrap().confirm_pair_code().unwrap();
    assert_eq!(jid.user, "5511988887777");
    loop {
        if next_event(&mut rx).await == WaEvent::Connected {
            break;
        }
    }
}

#[tokio::test]
async fn test_send_returns_fresh_ids() {
    let emulator = Emulator::new(fast_config());
    let (client, _rx, session_id) = paired(&emulator).await;
    let to = Jid::user("5511988887777");
    let text = |body: &str| WaMessage::Text {
        body: body.into(),
        context: None,
    };

    let a = client.send(&to, text("one")).await.unwrap();
    let b = client.send(&to, text("two")).await.unwrap();
    assert!(a.id.starts_with("3EB0"));
    assert_eq!(a.id.len(), 20);
    assert_ne!(a.id, b.id);
    assert_eq!(a.sender, client.own_jid());

    let sent = emulator.client(session_id).unwrap().sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].to, to);
    assert_eq!(sent[1].message, text("two"));
}

#[tokio::test]
async fn test_send_requires_connection() {
    let emulator = Emulator::new(fast_config());
    let (client, _rx, _) = paired(&emulator).await;
    client.disconnect().await;
    let err = client
        .send(
            &Jid::user("5511988887777"),
            WaMessage::Text {
                body: "x".into(),
                context: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, WaError::NotConnected);
}

#[tokio::test]
async fn test_injected_send_failure() {
    let emulator = Emulator::new(fast_config());
    let (client, _rx, session_id) = paired(&emulator).await;
    let ctl = emulator.client(session_id).unwrap();
    ctl.fail_next_send(WaError::ConnectionLost("socket closed".into()));
    let msg = WaMessage::Text {
        body: "x".into(),
        context: None,
    };
    let err = client
        .send(&Jid::user("5511988887777"), msg)
        .await
        .unwrap_err();
    assert!(err.is_transport_loss());
    assert!(!client.is_connected());
    assert!(ctl.sent().is_empty());
}

#[tokio::test]
async fn test_connect_failures_are_consumed() {
    let emulator = Emulator::new(fast_config());
    let session_id = SessionId::new();
    emulator.fail_next_connects(session_id, 2);
    let (client, _rx) = emulator
        .new_client(ClientOptions {
            session_id,
            device: None,
            proxy: None,
        })
        .await
        .unwrap();
    assert!(client.connect().await.is_err());
    assert!(client.connect().await.is_err());
    assert!(client.connect().await.is_ok());
    assert_eq!(emulator.clients_created(), 1);
}

#[tokio::test]
async fn test_unpair_emits_logged_out() {
    let emulator = Emulator::new(fast_config());
    let (client, mut rx, session_id) = paired(&emulator).await;
    emulator.client(session_id).unwrap().unpair("device_removed");
    assert_eq!(
        next_event(&mut rx).await,
        WaEvent::LoggedOut {
            reason: "device_removed".into()
        }
    );
    assert!(client.own_jid().is_none());
}

#[tokio::test]
async fn test_group_lifecycle() {
    let emulator = Emulator::new(fast_config());
    let (client, _rx, _) = paired(&emulator).await;
    let alice = Jid::user("5511911111111");
    let bob = Jid::user("5511922222222");

    let GroupInfo { jid: group, .. } = client.create_group("Team", &[alice.clone()]).await.unwrap();
    assert!(group.is_group());

    let changes = client
        .update_group_participants(&group, &[alice.clone(), bob.clone()], ParticipantAction::Add)
        .await
        .unwrap();
    assert_eq!(changes[0].status, 409);
    assert_eq!(changes[1].status, 200);

    client.set_group_topic(&group, "weekly sync").await.unwrap();
    client.set_group_announce(&group, true).await.unwrap();
    let info = client.group_info(&group).await.unwrap();
    assert_eq!(info.participants.len(), 3);
    assert_eq!(info.topic.as_deref(), Some("weekly sync"));
    assert!(info.announce);

    let link = client.group_invite_link(&group, false).await.unwrap();
    assert_eq!(client.group_invite_link(&group, false).await.unwrap(), link);
    assert_ne!(client.group_invite_link(&group, true).await.unwrap(), link);

    assert!(client.set_group_photo(&group, b"not a jpeg").await.is_err());
    client.leave_group(&group).await.unwrap();
    assert!(matches!(
        client.group_info(&group).await,
        Err(WaError::NotFound(_))
    ));
}
