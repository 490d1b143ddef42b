use super::*;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use std::time::Duration;
use tower::ServiceExt;
use wagate_core::config::Config;
use wagate_core::jid::Jid;
use wagate_core::session::SessionId;
use wagate_core::wa::{InboundMessage, WaEvent, WaMessage};
use wagate_store::Store;
use wagate_whatsapp::{EmulatedClient, Emulator, EmulatorConfig};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::events::{Dispatcher, DispatcherConfig, SinkRegistry};

const KEY: &str = "test-key";

struct TestApp {
    router: Router,
    manager: Arc<SessionManager>,
    emulator: Emulator,
}

fn test_config(global_url: Option<String>) -> Config {
    let mut cfg = Config::default();
    cfg.server.api_key = KEY.into();
    cfg.session.create_qr_wait_ms = 2000;
    cfg.webhook.global_url = global_url;
    cfg.webhook.initial_delay_ms = 10;
    cfg.webhook.max_delay_ms = 20;
    cfg
}

fn emulator() -> Emulator {
    Emulator::new(EmulatorConfig {
        qr_first_ttl: Duration::from_secs(60),
        qr_rotation_ttl: Duration::from_secs(20),
        qr_rotations: 3,
        auto_pair_after: None,
        send_latency: Duration::from_millis(30),
        ..EmulatorConfig::default()
    })
}

async fn app_on(store: Store, emulator: Emulator, cfg: &Config) -> TestApp {
    let registry = Arc::new(SinkRegistry::load(store.clone(), &cfg.webhook).await.unwrap());
    let dispatcher = Dispatcher::new(registry, DispatcherConfig::from(&cfg.webhook));
    let manager = Arc::new(SessionManager::new(
        store,
        dispatcher,
        Arc::new(emulator.clone()),
        cfg,
    ));
    let state = AppState::new(manager.clone(), MediaFetcher::new(&cfg.media), KEY);
    TestApp {
        router: build_router(state, cfg.server.body_limit_bytes),
        manager,
        emulator,
    }
}

async fn test_app() -> TestApp {
    app_on(Store::in_memory().await.unwrap(), emulator(), &test_config(None)).await
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {KEY}"));
    match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Parse response body as JSON (`null` when empty).
async fn body_json(resp: axum::http::Response<Body>) -> Value {
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap_or(Value::Null)
}

impl TestApp {
    async fn call(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        (status, body_json(resp).await)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.call(request("GET", uri, None)).await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.call(request("POST", uri, Some(body))).await
    }

    fn client(&self, id: &Value) -> Arc<EmulatedClient> {
        let id: SessionId = id.as_str().unwrap().parse().unwrap();
        self.emulator.client(id).expect("client built")
    }

    async fn wait_status(&self, name: &str, status: &str) -> Value {
        for _ in 0..300 {
            let (code, info) = self.get(&format!("/sessions/{name}/info")).await;
            if code == StatusCode::OK && info["status"] == status {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {name} never reached {status}");
    }

    /// Create `name` with a QR, scan it and wait for `connected`.
    async fn paired(&self, name: &str) -> Arc<EmulatedClient> {
        let (code, created) = self
            .post("/sessions/create", json!({ "name": name, "qrCode": true }))
            .await;
        assert_eq!(code, StatusCode::CREATED, "{created}");
        let client = self.client(&created["id"]);
        client.scan().unwrap();
        self.wait_status(name, "connected").await;
        client
    }
}

#[tokio::test]
async fn test_root_and_health_are_public() {
    let app = test_app().await;
    let resp = app
        .router
        .clone()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["name"], "wagate");

    let resp = app
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["webhooks"]["delivered"], 0);
}

#[tokio::test]
async fn test_api_key_is_required() {
    let app = test_app().await;
    let resp = app
        .router
        .clone()
        .oneshot(Request::get("/sessions/list").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["error"], "unauthorized");

    let resp = app
        .router
        .clone()
        .oneshot(
            Request::get("/sessions/list")
                .header("Authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .router
        .clone()
        .oneshot(
            Request::get("/sessions/list")
                .header("X-API-Key", KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .router
        .clone()
        .oneshot(
            Request::get("/sessions/list")
                .header("Authorization", KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_first_time_pair() {
    let app = test_app().await;
    let (code, created) = app
        .post("/sessions/create", json!({ "name": "alpha", "qrCode": true }))
        .await;
    assert_eq!(code, StatusCode::CREATED);
    assert!(created["id"].is_string());
    assert_eq!(created["name"], "alpha");
    assert_eq!(created["status"], "qr_code");
    assert!(created["createdAt"].is_string());
    assert!(created["qrCodeBase64"]
        .as_str()
        .unwrap()
        .starts_with("data:image/png;base64,"));

    let (code, qr) = app.get("/sessions/alpha/qr").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(qr["qrCode"], created["qrCode"]);

    app.client(&created["id"]).scan().unwrap();
    let info = app.wait_status("alpha", "connected").await;
    assert!(!info["deviceJid"].as_str().unwrap().is_empty());
    assert!(info.get("qrCode").is_none());

    let (code, err) = app.get("/sessions/alpha/qr").await;
    assert_eq!(code, StatusCode::PRECONDITION_FAILED);
    assert_eq!(err["error"], "already_paired");
}

#[tokio::test]
async fn test_create_validation_and_conflict() {
    let app = test_app().await;
    let (code, err) = app
        .post("/sessions/create", json!({ "name": "no spaces allowed" }))
        .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "validation_error");

    let (code, _) = app.post("/sessions/create", json!({ "name": "alpha" })).await;
    assert_eq!(code, StatusCode::CREATED);
    let (code, err) = app.post("/sessions/create", json!({ "name": "alpha" })).await;
    assert_eq!(code, StatusCode::CONFLICT);
    assert_eq!(err["error"], "session_already_exists");

    let resp = app
        .router
        .clone()
        .oneshot(
            Request::post("/sessions/create")
                .header("Authorization", format!("Bearer {KEY}"))
                .header("Content-Type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_and_unknown_session() {
    let app = test_app().await;
    for name in ["alpha", "beta"] {
        app.post("/sessions/create", json!({ "name": name })).await;
    }
    let (code, list) = app.get("/sessions/list?limit=1").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(list["total"], 2);
    assert_eq!(list["sessions"].as_array().unwrap().len(), 1);

    let (code, err) = app.get("/sessions/nobody/info").await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "session_not_found");
}

#[tokio::test]
async fn test_send_text() {
    let app = test_app().await;
    let client = app.paired("alpha").await;
    let (code, body) = app
        .post(
            "/sessions/alpha/send/message/text",
            json!({ "phone": "5511999999999", "text": "hi" }),
        )
        .await;
    assert_eq!(code, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["to"], "5511999999999@s.whatsapp.net");
    assert_eq!(body["type"], "text");
    assert_eq!(body["content"], "hi");
    assert_eq!(body["status"], "sent");

    let sent = client.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(body["id"], sent[0].id);
    assert_eq!(body["timestamp"], sent[0].timestamp.timestamp());
}

#[tokio::test]
async fn test_reaction_with_me_prefix() {
    let app = test_app().await;
    let client = app.paired("alpha").await;
    let (code, body) = app
        .post(
            "/sessions/alpha/send/message/reaction",
            json!({ "phone": "5511999999999", "messageId": "me:3EB0C431", "reaction": "👍" }),
        )
        .await;
    assert_eq!(code, StatusCode::OK, "{body}");

    let sent = client.sent();
    let WaMessage::Reaction { key, emoji, .. } = &sent[0].message else {
        panic!("expected a reaction");
    };
    assert!(key.from_me);
    assert_eq!(key.id, "3EB0C431");
    assert_eq!(emoji, "👍");
}

#[tokio::test]
async fn test_concurrent_sends_serialize() {
    let app = test_app().await;
    let client = app.paired("alpha").await;
    let send = |text: &str| {
        app.post(
            "/sessions/alpha/send/message/text",
            json!({ "phone": "5511999999999", "text": text }),
        )
    };
    let ((code_a, a), (code_b, b)) = tokio::join!(send("one"), send("two"));
    assert_eq!(code_a, StatusCode::OK);
    assert_eq!(code_b, StatusCode::OK);
    assert_ne!(a["id"], b["id"]);
    assert_eq!(client.sent().len(), 2);
    assert_eq!(client.max_in_flight(), 1);
}

#[tokio::test]
async fn test_send_errors() {
    let app = test_app().await;
    app.post("/sessions/create", json!({ "name": "idle" })).await;

    let (code, err) = app
        .post(
            "/sessions/idle/send/message/text",
            json!({ "phone": "5511999999999", "text": "hi" }),
        )
        .await;
    assert_eq!(code, StatusCode::PRECONDITION_FAILED);
    assert_eq!(err["error"], "not_connected");

    let (code, err) = app
        .post("/sessions/idle/send/message/template", json!({}))
        .await;
    assert_eq!(code, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(err["error"], "not_implemented");

    let (code, err) = app
        .post("/sessions/idle/send/message/carrier-pigeon", json!({}))
        .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "validation_error");

    let (code, err) = app
        .post(
            "/sessions/idle/send/message/text",
            json!({ "phone": "abc", "text": "hi" }),
        )
        .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_target");

    let (code, _) = app
        .post(
            "/sessions/ghost/send/message/text",
            json!({ "phone": "5511999999999", "text": "hi" }),
        )
        .await;
    assert_eq!(code, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_restart_recovery() {
    let store = Store::in_memory().await.unwrap();
    let cfg = test_config(None);
    let first = app_on(store.clone(), emulator(), &cfg).await;
    first.paired("beta").await;
    let (_, before) = first.get("/sessions/beta/info").await;
    first.manager.shutdown_all().await;

    let second = app_on(store, emulator(), &cfg).await;
    second.manager.restore_all().await.unwrap();
    let (code, info) = second.get("/sessions/beta/info").await;
    assert_eq!(code, StatusCode::OK);
    assert_ne!(info["status"], "qr_code");

    let info = second.wait_status("beta", "connected").await;
    assert_eq!(info["deviceJid"], before["deviceJid"]);
}

#[tokio::test]
async fn test_delete_during_inbound() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let store = Store::in_memory().await.unwrap();
    let app = app_on(store, emulator(), &test_config(Some(server.uri()))).await;
    let client = app.paired("alpha").await;

    let feeder = tokio::spawn(async move {
        for n in 0..200 {
            client.inject(WaEvent::Message(InboundMessage {
                id: format!("IN{n}"),
                chat: Jid::user("5511999999999"),
                sender: Jid::user("5511999999999"),
                from_me: false,
                is_group: false,
                timestamp: chrono::Utc::now(),
                push_name: None,
                text: Some(format!("message {n}")),
                media: None,
                quoted_id: None,
            }));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(40)).await;

    let (code, body) = app
        .call(request("DELETE", "/sessions/alpha/delete", None))
        .await;
    assert_eq!(code, StatusCode::OK, "{body}");
    let delivered = server.received_requests().await.unwrap().len();

    feeder.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), delivered);

    let (code, err) = app.get("/sessions/alpha/info").await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "session_not_found");
}

#[tokio::test]
async fn test_webhook_crud_hides_secret() {
    let app = test_app().await;
    app.post("/sessions/create", json!({ "name": "alpha" })).await;

    let (code, sink) = app
        .post(
            "/sessions/alpha/webhooks",
            json!({ "url": "https://hooks.example.com/in", "events": ["message"], "secret": "s3cret" }),
        )
        .await;
    assert_eq!(code, StatusCode::CREATED, "{sink}");
    assert_eq!(sink["hasSecret"], true);
    assert!(sink.get("secret").is_none());
    assert_eq!(sink["enabled"], true);
    let id = sink["id"].as_str().unwrap().to_string();

    let (code, list) = app.get("/sessions/alpha/webhooks").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(list["webhooks"].as_array().unwrap().len(), 1);

    let (code, updated) = app
        .call(request(
            "PUT",
            &format!("/sessions/alpha/webhooks/{id}"),
            Some(json!({ "url": "https://hooks.example.com/v2", "enabled": false })),
        ))
        .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(updated["url"], "https://hooks.example.com/v2");
    assert_eq!(updated["enabled"], false);

    let (code, enabled) = app
        .post(&format!("/sessions/alpha/webhooks/{id}/enable"), json!({}))
        .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(enabled["enabled"], true);

    let (code, _) = app
        .call(request(
            "DELETE",
            &format!("/sessions/alpha/webhooks/{id}"),
            None,
        ))
        .await;
    assert_eq!(code, StatusCode::OK);
    let (code, err) = app.get(&format!("/sessions/alpha/webhooks/{id}")).await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "sink_not_found");

    let (code, _) = app
        .post(
            "/sessions/alpha/webhooks",
            json!({ "url": "ftp://nope" }),
        )
        .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_groups_and_contacts() {
    let app = test_app().await;
    app.paired("alpha").await;

    let (code, group) = app
        .post(
            "/sessions/alpha/groups/create",
            json!({ "name": "Team", "participants": ["5511999999999"] }),
        )
        .await;
    assert_eq!(code, StatusCode::OK, "{group}");
    let jid = group["jid"].as_str().unwrap().to_string();

    let (code, link) = app
        .get(&format!("/sessions/alpha/groups/{jid}/invite-link"))
        .await;
    assert_eq!(code, StatusCode::OK);
    assert!(link["inviteLink"]
        .as_str()
        .unwrap()
        .starts_with("https://chat.whatsapp.com/"));

    let (code, groups) = app.get("/sessions/alpha/groups/list").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(groups.as_array().unwrap().len(), 1);

    let (code, err) = app
        .call(request(
            "PUT",
            &format!("/sessions/alpha/groups/{jid}/settings"),
            Some(json!({})),
        ))
        .await;
    assert_eq!(code, StatusCode::BAD_REQUEST, "{err}");

    let (code, checked) = app
        .post(
            "/sessions/alpha/contacts/check",
            json!({ "phones": ["+55 11 99999-9999"] }),
        )
        .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(checked.as_array().unwrap().len(), 1);
}
