use super::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wagate_core::config::WebhookConfig;
use wagate_core::event::{EventEnvelope, EventType};
use wagate_core::session::{SessionId, SessionRecord};
use wagate_core::sink::RetryPolicy;
use wagate_store::Store;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_webhooks() -> WebhookConfig {
    WebhookConfig {
        timeout_secs: 2,
        max_attempts: 3,
        initial_delay_ms: 10,
        max_delay_ms: 20,
        ..Default::default()
    }
}

async fn setup(cfg: WebhookConfig) -> (Store, Dispatcher, SessionId) {
    let store = Store::in_memory().await.unwrap();
    let record = SessionRecord::new("alpha", None);
    store.create_session(&record).await.unwrap();
    let registry = Arc::new(SinkRegistry::load(store.clone(), &cfg).await.unwrap());
    let dispatcher = Dispatcher::new(registry, DispatcherConfig::from(&cfg));
    (store, dispatcher, record.id)
}

fn spec(url: String) -> SinkSpec {
    SinkSpec {
        url,
        events: Vec::new(),
        secret: None,
        retry_policy: None,
        enabled: None,
    }
}

/// Poll until `check` holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_sequence_is_per_session_and_increasing() {
    let (_store, dispatcher, a) = setup(fast_webhooks()).await;
    let b = SessionId::new();
    let seqs: Vec<u64> = (0..3)
        .map(|_| {
            dispatcher
                .emit(a, EventType::Message, json!({}))
                .monotonic_seq
        })
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(dispatcher.emit(b, EventType::Qr, json!({})).monotonic_seq, 1);
    assert_eq!(dispatcher.last_seq(a), 3);
}

#[tokio::test]
async fn test_delivers_in_order_with_headers_and_signature() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;

    let (_store, dispatcher, session_id) = setup(fast_webhooks()).await;
    let mut s = spec(format!("{}/hook", server.uri()));
    s.secret = Some("topsecret".into());
    dispatcher.registry().create(session_id, s).await.unwrap();

    for i in 0..3 {
        dispatcher.emit(session_id, EventType::Message, json!({ "n": i }));
    }
    eventually(|| dispatcher.counters().delivered == 3).await;

    let requests = server.received_requests().await.unwrap();
    let seqs: Vec<u64> = requests
        .iter()
        .map(|r| serde_json::from_slice::<EventEnvelope>(&r.body).unwrap().monotonic_seq)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    let first = &requests[0];
    assert_eq!(first.headers.get("x-event-type").unwrap(), "message");
    assert_eq!(
        first.headers.get("x-session-id").unwrap().to_str().unwrap(),
        session_id.to_string()
    );
    assert_eq!(first.headers.get("x-event-seq").unwrap(), "1");
    assert_eq!(
        first.headers.get("x-signature").unwrap().to_str().unwrap(),
        sign_body("topsecret", &first.body)
    );
}

#[tokio::test]
async fn test_filter_types_are_respected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (_store, dispatcher, session_id) = setup(fast_webhooks()).await;
    let mut s = spec(server.uri());
    s.events = vec![EventType::Receipt];
    dispatcher.registry().create(session_id, s).await.unwrap();

    dispatcher.emit(session_id, EventType::Message, json!({}));
    dispatcher.emit(session_id, EventType::Receipt, json!({}));
    eventually(|| dispatcher.counters().delivered == 1).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].headers.get("x-event-type").unwrap(), "receipt");
}

#[tokio::test]
async fn test_retries_server_errors_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (_store, dispatcher, session_id) = setup(fast_webhooks()).await;
    dispatcher
        .registry()
        .create(session_id, spec(server.uri()))
        .await
        .unwrap();
    dispatcher.emit(session_id, EventType::Call, json!({}));
    eventually(|| dispatcher.counters().delivered == 1).await;

    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    assert_eq!(dispatcher.counters().failed, 0);
}

#[tokio::test]
async fn test_client_errors_are_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422))
        .mount(&server)
        .await;

    let (_store, dispatcher, session_id) = setup(fast_webhooks()).await;
    dispatcher
        .registry()
        .create(session_id, spec(server.uri()))
        .await
        .unwrap();
    dispatcher.emit(session_id, EventType::Message, json!({}));
    eventually(|| dispatcher.counters().failed == 1).await;
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sink_disabled_after_consecutive_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let cfg = WebhookConfig {
        disable_after: 2,
        ..fast_webhooks()
    };
    let (store, dispatcher, session_id) = setup(cfg).await;
    let sink = dispatcher
        .registry()
        .create(session_id, spec(server.uri()))
        .await
        .unwrap();

    for _ in 0..5 {
        dispatcher.emit(session_id, EventType::Message, json!({}));
    }
    eventually(|| dispatcher.counters().failed == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stored = store.get_sink(sink.id).await.unwrap().unwrap();
    assert!(stored.disabled);
    assert_eq!(dispatcher.counters().failed, 3, "remaining events are not attempted");

    // Re-enabling brings it back.
    dispatcher.registry().enable(session_id, sink.id).await.unwrap();
    assert!(!store.get_sink(sink.id).await.unwrap().unwrap().disabled);
}

#[tokio::test]
async fn test_queue_overflow_drops_oldest() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let cfg = WebhookConfig {
        queue_capacity: 2,
        ..fast_webhooks()
    };
    let (_store, dispatcher, session_id) = setup(cfg).await;
    dispatcher
        .registry()
        .create(session_id, spec(server.uri()))
        .await
        .unwrap();

    // The current-thread test runtime does not run the worker until we yield.
    for _ in 0..5 {
        dispatcher.emit(session_id, EventType::Message, json!({}));
    }
    assert_eq!(dispatcher.counters().dropped, 3);
    eventually(|| dispatcher.counters().delivered == 2).await;

    let seqs: Vec<u64> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| serde_json::from_slice::<EventEnvelope>(&r.body).unwrap().monotonic_seq)
        .collect();
    assert_eq!(seqs, vec![4, 5]);
}

#[tokio::test]
async fn test_purge_stops_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let (_store, dispatcher, session_id) = setup(fast_webhooks()).await;
    dispatcher
        .registry()
        .create(session_id, spec(server.uri()))
        .await
        .unwrap();
    for _ in 0..4 {
        dispatcher.emit(session_id, EventType::Message, json!({}));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    dispatcher.purge_session(session_id).await;

    let seen = server.received_requests().await.unwrap().len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), seen);
    assert_eq!(dispatcher.counters().workers, 0);
    assert_eq!(dispatcher.last_seq(session_id), 0);
}

#[tokio::test]
async fn test_global_sink_receives_every_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let cfg = WebhookConfig {
        global_url: Some(server.uri()),
        ..fast_webhooks()
    };
    let (_store, dispatcher, a) = setup(cfg).await;
    let b = SessionId::new();
    dispatcher.emit(a, EventType::Connected, json!({}));
    dispatcher.emit(b, EventType::Qr, json!({}));
    eventually(|| dispatcher.counters().delivered == 2).await;
    assert!(dispatcher.registry().has_global());
}

#[tokio::test]
async fn test_registry_rejects_bad_urls_and_foreign_sinks() {
    let (store, dispatcher, session_id) = setup(fast_webhooks()).await;
    let registry = dispatcher.registry();
    assert!(registry.create(session_id, spec("ftp://x".into())).await.is_err());
    assert!(registry.create(session_id, spec("not a url".into())).await.is_err());

    let mut s = spec("https://hooks.example.com/a".into());
    s.retry_policy = Some(RetryPolicy {
        max_attempts: 99,
        initial_delay_ms: 500,
        max_delay_ms: 100,
    });
    let sink = registry.create(session_id, s).await.unwrap();
    assert_eq!(sink.retry_policy.max_attempts, 20);
    assert_eq!(sink.retry_policy.max_delay_ms, 500);

    let other = SessionRecord::new("beta", None);
    store.create_session(&other).await.unwrap();
    assert!(registry.get(other.id, sink.id).await.is_err());
    assert!(registry.delete(other.id, sink.id).await.is_err());
    assert_eq!(registry.remove_session(session_id).await.unwrap(), 1);
    assert!(registry.matching(session_id, EventType::Message).is_empty());
}

#[tokio::test]
async fn test_snapshot_follows_interleaved_changes() {
    let (store, dispatcher, session_id) = setup(fast_webhooks()).await;
    let registry = dispatcher.registry();
    let keep = registry
        .create(session_id, spec("https://hooks.example.com/keep".into()))
        .await
        .unwrap();

    for n in 0..20 {
        let doomed = registry
            .create(session_id, spec(format!("https://hooks.example.com/gone/{n}")))
            .await
            .unwrap();
        let (created, deleted, refreshed) = tokio::join!(
            registry.create(session_id, spec(format!("https://hooks.example.com/new/{n}"))),
            registry.delete(session_id, doomed.id),
            registry.refresh(),
        );
        created.unwrap();
        deleted.unwrap();
        refreshed.unwrap();
        assert!(registry.current(session_id, doomed.id).is_none());
    }

    let mut cached: Vec<Uuid> = registry
        .matching(session_id, EventType::Message)
        .into_iter()
        .map(|s| s.id)
        .collect();
    let mut stored: Vec<Uuid> = store
        .list_sinks(session_id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    cached.sort();
    stored.sort();
    assert_eq!(cached, stored);
    assert!(cached.contains(&keep.id));
    assert_eq!(cached.len(), 21);
}
