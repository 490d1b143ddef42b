use super::*;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;
use wagate_core::config::MediaConfig;
use wagate_core::error::GatewayError;
use wagate_core::session::SessionId;
use wagate_core::traits::{ClientFactory, ClientOptions};
use wagate_core::wa::{WaEvent, WaMessage};
use wagate_whatsapp::Emulator;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];

fn fetcher(max_bytes: u64) -> MediaFetcher {
    MediaFetcher::new(&MediaConfig {
        max_bytes,
        ..Default::default()
    })
}

fn ready(req: SendRequest) -> PreparedBody {
    match req.body {
        Pending::Ready(body) => body,
        Pending::Media(m) => panic!("unexpected media request {m:?}"),
    }
}

#[test]
fn test_text_request_normalizes_phone() {
    let req = parse_request(
        SendKind::Text,
        json!({ "phone": "+55 11 99999-9999", "text": "hello" }),
    )
    .unwrap();
    assert_eq!(req.to.to_string(), "5511999999999@s.whatsapp.net");
    assert_eq!(req.content, "hello");
    assert!(matches!(ready(req), PreparedBody::Text { context: None, .. }));
}

#[test]
fn test_text_validation() {
    let empty = parse_request(SendKind::Text, json!({ "phone": "5511999999999", "text": "  " }));
    assert!(matches!(empty, Err(GatewayError::Validation(_))));

    let long = "x".repeat(MAX_TEXT_CHARS + 1);
    let too_long = parse_request(SendKind::Text, json!({ "phone": "5511999999999", "text": long }));
    assert!(matches!(too_long, Err(GatewayError::Validation(_))));

    let bad_target = parse_request(SendKind::Text, json!({ "phone": "abc", "text": "hi" }));
    assert!(matches!(bad_target, Err(GatewayError::InvalidTarget(_))));

    let missing = parse_request(SendKind::Text, json!({ "text": "hi" }));
    assert!(matches!(missing, Err(GatewayError::Validation(_))));
}

#[test]
fn test_reply_participant_only_kept_in_groups() {
    let ctx = json!({ "stanzaId": "ABC", "participant": "5511888888888", "mentions": ["5511777777777"] });
    let direct = parse_request(
        SendKind::Text,
        json!({ "phone": "5511999999999", "text": "hi", "contextInfo": ctx }),
    )
    .unwrap();
    let PreparedBody::Text { context: Some(c), .. } = ready(direct) else {
        panic!("expected context");
    };
    assert_eq!(c.stanza_id.as_deref(), Some("ABC"));
    assert!(c.participant.is_none());
    assert_eq!(c.mentions.len(), 1);

    let group = parse_request(
        SendKind::Text,
        json!({ "phone": "120363025246125486@g.us", "text": "hi", "contextInfo": ctx }),
    )
    .unwrap();
    let PreparedBody::Text { context: Some(c), .. } = ready(group) else {
        panic!("expected context");
    };
    assert_eq!(
        c.participant.map(|j| j.to_string()).as_deref(),
        Some("5511888888888@s.whatsapp.net")
    );
}

#[test]
fn test_reaction_target_prefix_and_override() {
    assert_eq!(
        parse_reaction_target("me:3EB0ABC", None).unwrap(),
        ("3EB0ABC".to_string(), true)
    );
    assert_eq!(
        parse_reaction_target("3EB0ABC", None).unwrap(),
        ("3EB0ABC".to_string(), false)
    );
    assert_eq!(
        parse_reaction_target("me:3EB0ABC", Some(false)).unwrap(),
        ("3EB0ABC".to_string(), false)
    );
    assert!(parse_reaction_target("me:", None).is_err());
}

#[test]
fn test_group_reaction_to_others_needs_participant() {
    let body = json!({ "phone": "120363025246125486@g.us", "messageId": "ABC", "reaction": "👍" });
    assert!(parse_request(SendKind::Reaction, body).is_err());

    let body = json!({
        "phone": "120363025246125486@g.us",
        "messageId": "ABC",
        "reaction": "👍",
        "participant": "5511888888888"
    });
    let PreparedBody::Reaction { participant, from_me, .. } =
        ready(parse_request(SendKind::Reaction, body).unwrap())
    else {
        panic!("expected reaction");
    };
    assert!(!from_me);
    assert!(participant.is_some());
}

#[test]
fn test_poll_bounds() {
    let poll = |options: Vec<&str>, selectable: Option<u32>| {
        parse_request(
            SendKind::Poll,
            json!({ "phone": "5511999999999", "name": "Lunch?", "options": options, "selectableCount": selectable }),
        )
    };
    assert!(poll(vec!["a"], None).is_err());
    assert!(poll(vec!["a"; 13], None).is_err());
    assert!(poll(vec!["a", "a"], None).is_err(), "duplicates rejected");
    assert!(poll(vec!["a", "b"], Some(3)).is_err());
    assert!(poll(vec!["a", "b"], Some(0)).is_err());
    let PreparedBody::Poll { selectable, options, .. } = ready(poll(vec!["a", "b", "c"], None).unwrap())
    else {
        panic!("expected poll");
    };
    assert_eq!(selectable, 1);
    assert_eq!(options.len(), 3);
}

#[test]
fn test_buttons_and_list_bounds() {
    let buttons = |n: usize| {
        let items: Vec<_> = (0..n).map(|i| json!({ "text": format!("b{i}") })).collect();
        parse_request(
            SendKind::Buttons,
            json!({ "phone": "5511999999999", "text": "pick", "buttons": items }),
        )
    };
    assert!(buttons(0).is_err());
    assert!(buttons(4).is_err());
    let PreparedBody::Buttons { buttons, .. } = ready(buttons(3).unwrap()) else {
        panic!("expected buttons");
    };
    assert_eq!(buttons[2].id, "btn_3");

    let list = |sections: serde_json::Value| {
        parse_request(
            SendKind::List,
            json!({
                "phone": "5511999999999",
                "title": "Menu",
                "text": "choose",
                "buttonText": "Open",
                "sections": sections
            }),
        )
    };
    assert!(list(json!([])).is_err());
    assert!(list(json!([{ "title": "empty", "rows": [] }])).is_err());
    let PreparedBody::List { sections, .. } =
        ready(list(json!([{ "title": "s", "rows": [{ "title": "one" }, { "title": "two" }] }])).unwrap())
    else {
        panic!("expected list");
    };
    assert_eq!(sections[0].rows[1].id, "row_2");
}

#[test]
fn test_template_is_not_implemented() {
    let err = parse_request(SendKind::Template, json!({ "phone": "5511999999999" })).unwrap_err();
    assert!(matches!(err, GatewayError::NotImplemented(_)));
}

#[test]
fn test_view_once_restricted_to_visual_and_audio() {
    let doc = parse_request(
        SendKind::Document,
        json!({ "phone": "5511999999999", "media": "https://x.test/a.pdf", "viewOnce": true }),
    );
    assert!(matches!(doc, Err(GatewayError::Validation(_))));

    let missing_type = parse_request(
        SendKind::ViewOnce,
        json!({ "phone": "5511999999999", "media": "https://x.test/a.jpg" }),
    );
    assert!(missing_type.is_err());

    let req = parse_request(
        SendKind::ViewOnce,
        json!({ "phone": "5511999999999", "media": "https://x.test/a.jpg", "mediaType": "image" }),
    )
    .unwrap();
    let Pending::Media(m) = req.body else {
        panic!("expected media");
    };
    assert!(m.view_once);
}

#[test]
fn test_caption_limit() {
    let caption = "c".repeat(MAX_CAPTION_CHARS + 1);
    let req = parse_request(
        SendKind::Image,
        json!({ "phone": "5511999999999", "media": "https://x.test/a.jpg", "caption": caption }),
    );
    assert!(matches!(req, Err(GatewayError::Validation(_))));
}

#[test]
fn test_contact_builds_vcard() {
    let req = parse_request(
        SendKind::Contact,
        json!({ "phone": "5511999999999", "contactName": "Ana; Silva", "contactPhone": "+55 11 98888-7777" }),
    )
    .unwrap();
    let PreparedBody::Contact { card, .. } = ready(req) else {
        panic!("expected contact");
    };
    assert_eq!(card.display_name, "Ana; Silva");
    assert!(card.vcard.contains("FN:Ana\\; Silva"));
    assert!(card.vcard.contains("waid=5511988887777:+5511988887777"));
}

#[test]
fn test_revoke_participant_only_in_groups() {
    let req = parse_request(
        SendKind::Revoke,
        json!({ "phone": "5511999999999", "messageId": "X", "participant": "5511888888888" }),
    );
    assert!(req.is_err());
}

#[test]
fn test_sniff_mime() {
    assert_eq!(sniff_mime(JPEG), Some("image/jpeg"));
    assert_eq!(sniff_mime(b"%PDF-1.7"), Some("application/pdf"));
    assert_eq!(sniff_mime(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
    assert_eq!(sniff_mime(b"hello"), None);
}

#[tokio::test]
async fn test_data_url_is_decoded_and_sniffed() {
    let url = format!("data:;base64,{}", STANDARD.encode(JPEG));
    let media = fetcher(1024).resolve(&url, None).await.unwrap();
    assert_eq!(media.data, JPEG);
    assert_eq!(media.mimetype, "image/jpeg");

    let declared = fetcher(1024)
        .resolve(&url, Some("image/custom"))
        .await
        .unwrap();
    assert_eq!(declared.mimetype, "image/custom");
}

#[tokio::test]
async fn test_data_url_respects_size_cap() {
    let url = format!("data:image/jpeg;base64,{}", STANDARD.encode([0u8; 64]));
    let err = fetcher(16).resolve(&url, None).await.unwrap_err();
    assert!(matches!(err, GatewayError::MediaTooLarge { limit: 16, .. }));
}

#[tokio::test]
async fn test_url_fetch_and_size_cap() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pic.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(JPEG.to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let url = format!("{}/pic.jpg", server.uri());
    let media = fetcher(1024).resolve(&url, None).await.unwrap();
    assert_eq!(media.mimetype, "image/jpeg");
    assert_eq!(media.file_name.as_deref(), Some("pic.jpg"));

    let err = fetcher(4).resolve(&url, None).await.unwrap_err();
    assert!(matches!(err, GatewayError::MediaTooLarge { .. }));

    let err = fetcher(1024)
        .resolve(&format!("{}/missing", server.uri()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::MediaFetchFailed(_)));
}

#[tokio::test]
async fn test_local_paths_confined_to_root() {
    let root = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("doc.pdf"), b"%PDF-1.4 test").unwrap();
    std::fs::write(outside.path().join("secret.pdf"), b"%PDF-1.4 secret").unwrap();

    let fetcher = MediaFetcher::new(&MediaConfig {
        local_root: Some(root.path().to_string_lossy().into_owned()),
        ..Default::default()
    });
    let inside = root.path().join("doc.pdf");
    let media = fetcher.resolve(&inside.to_string_lossy(), None).await.unwrap();
    assert_eq!(media.mimetype, "application/pdf");
    assert_eq!(media.file_name.as_deref(), Some("doc.pdf"));

    let direct = outside.path().join("secret.pdf");
    let err = fetcher.resolve(&direct.to_string_lossy(), None).await.unwrap_err();
    assert!(matches!(err, GatewayError::Validation(_)));

    let outside_name = outside.path().file_name().unwrap();
    let traversal = root.path().join("..").join(outside_name).join("secret.pdf");
    let err = fetcher
        .resolve(&traversal.to_string_lossy(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Validation(_)));

    let disabled = MediaFetcher::new(&MediaConfig::default());
    assert!(disabled.resolve(&inside.to_string_lossy(), None).await.is_err());
}

#[tokio::test]
async fn test_sticker_must_be_webp() {
    let req = parse_request(
        SendKind::Sticker,
        json!({ "phone": "5511999999999", "media": format!("data:;base64,{}", STANDARD.encode(JPEG)) }),
    )
    .unwrap();
    let err = prepare(req, &fetcher(1024)).await.unwrap_err();
    assert!(matches!(err, GatewayError::Validation(_)));
}

#[tokio::test]
async fn test_build_message_uploads_media() {
    let emulator = Emulator::default();
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
    assert!(matches!(rx.recv().await, Some(WaEvent::Qr { .. })));
    emulator.client(session_id).unwrap().scan().unwrap();

    let req = parse_request(
        SendKind::Image,
        json!({
            "phone": "5511999999999",
            "media": format!("data:;base64,{}", STANDARD.encode(JPEG)),
            "caption": "look"
        }),
    )
    .unwrap();
    let prepared = prepare(req, &fetcher(1024)).await.unwrap();
    let msg = build_message(client.as_ref(), &prepared.to, prepared.body)
        .await
        .unwrap();
    let WaMessage::Image(media) = msg else {
        panic!("expected image");
    };
    assert_eq!(media.caption.as_deref(), Some("look"));
    assert_eq!(media.upload.file_length, JPEG.len() as u64);
}
