//! HTTP integration tests: a real server on a random port, driven with reqwest.
//!
//! The AI and messaging providers are stubs; storage is in-memory libSQL.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use autoreply::config::{DispatchConfig, ReplyConfig, ReplyMode};
use autoreply::error::{AiError, MessagingError};
use autoreply::pipeline::retry::RetryPolicy;
use autoreply::pipeline::{AutoReplyOrchestrator, OutboundDispatcher, TagRules, WebhookReceiver};
use autoreply::providers::{AiProvider, AiRequest, MessagingProvider};
use autoreply::routes::{AppState, app_routes};
use autoreply::store::{ConversationStore, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const TOKEN: &str = "operator-secret";
const UNREACHABLE: &str = "+19990000000";

// ── Stub providers ───────────────────────────────────────────────────

struct EchoAi;

#[async_trait]
impl AiProvider for EchoAi {
    fn name(&self) -> &str {
        "echo"
    }
    fn model_name(&self) -> &str {
        "echo"
    }
    async fn generate_reply(&self, request: &AiRequest) -> Result<String, AiError> {
        Ok(format!("{} message(s) received", request.transcript.len()))
    }
}

/// Accepts every send except to `UNREACHABLE`.
#[derive(Default)]
struct StubMessaging {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl MessagingProvider for StubMessaging {
    fn name(&self) -> &str {
        "stub"
    }
    async fn send_text(&self, to: &str, body: &str) -> Result<String, MessagingError> {
        if to == UNREACHABLE {
            return Err(MessagingError::InvalidAddress {
                provider: "stub".into(),
                address: to.into(),
                reason: "not a messaging number".into(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(body.to_string());
        Ok(format!("SM{}", sent.len()))
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct TestServer {
    base: String,
    http: reqwest::Client,
    messaging: Arc<StubMessaging>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn webhook(&self, path: &str, payload: Value) -> (u16, Value) {
        let resp = self
            .http
            .post(self.url(path))
            .json(&payload)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn operator_get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }
}

async fn start_server() -> TestServer {
    let store: Arc<dyn ConversationStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let messaging = Arc::new(StubMessaging::default());
    let dispatcher = Arc::new(OutboundDispatcher::new(
        messaging.clone(),
        Arc::clone(&store),
        &DispatchConfig {
            send_timeout: Duration::from_secs(2),
            retry: RetryPolicy::immediate(3),
        },
    ));
    let orchestrator = Arc::new(AutoReplyOrchestrator::new(
        Arc::clone(&store),
        Arc::new(EchoAi),
        Arc::clone(&dispatcher),
        Arc::new(TagRules::default_rules()),
        ReplyConfig {
            ai_retry: RetryPolicy::immediate(2),
            mode: ReplyMode::Inline,
            ..ReplyConfig::default()
        },
    ));
    let receiver = Arc::new(WebhookReceiver::new(
        Arc::clone(&store),
        messaging.clone(),
        orchestrator,
        Duration::from_secs(60),
        ReplyMode::Inline,
    ));

    let app = app_routes(AppState {
        receiver,
        store,
        dispatcher,
        default_organization: "default".into(),
        operator_token: Some(SecretString::from(TOKEN)),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://{addr}"),
        http: reqwest::Client::new(),
        messaging,
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_is_open() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let resp = server.http.get(server.url("/health")).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn form_webhook_is_accepted_and_answered() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let resp = server
            .http
            .post(server.url("/webhooks/messaging/acme"))
            .form(&[
                ("From", "+15551234"),
                ("Body", "What is the price?"),
                ("MessageSid", "SM-in-1"),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["reply"]["outcome"], "reply_sent");
        assert_eq!(body["reply"]["report"]["tags_added"], json!(["pricing-interest"]));

        let sent = server.messaging.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["1 message(s) received".to_string()]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn redelivered_webhook_is_acknowledged_once() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let payload = json!({"from": "+15551234", "body": "hello", "message_id": "wamid.9"});

        let (status, first) = server.webhook("/webhooks/messaging", payload.clone()).await;
        assert_eq!(status, 200);
        assert_eq!(first["status"], "accepted");

        let (status, second) = server.webhook("/webhooks/messaging", payload).await;
        assert_eq!(status, 200);
        assert_eq!(second["status"], "duplicate");
        assert_eq!(server.messaging.sent.lock().unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn invalid_webhook_is_rejected_with_reason() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (status, body) = server
            .webhook("/webhooks/messaging", json!({"from": "+15551234"}))
            .await;
        assert_eq!(status, 400);
        assert_eq!(body["status"], "rejected");
        assert_eq!(body["reason"], "missing_body");
        assert!(server.messaging.sent.lock().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn operator_api_requires_token() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let resp = server
            .http
            .get(server.url("/api/messages/failed"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 401);

        let resp = server
            .http
            .get(server.url("/api/messages/failed"))
            .bearer_auth("wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 401);

        let (status, body) = server.operator_get("/api/messages/failed").await;
        assert_eq!(status, 200);
        assert_eq!(body, json!([]));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn conversation_history_is_listed_newest_first() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let mut client_id = String::new();
        for (i, text) in ["first", "second"].iter().enumerate() {
            let (_, body) = server
                .webhook(
                    "/webhooks/messaging/acme",
                    json!({"from": "+15551234", "body": text, "message_id": format!("m{i}")}),
                )
                .await;
            client_id = body["client_id"].as_str().unwrap().to_string();
        }

        let (status, messages) = server
            .operator_get(&format!("/api/clients/{client_id}/messages"))
            .await;
        assert_eq!(status, 200);
        let seqs: Vec<i64> = messages
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![4, 3, 2, 1]);
        assert_eq!(messages[0]["direction"], "outbound");
        assert_eq!(messages[0]["body"], "3 message(s) received");
        assert_eq!(messages[1]["body"], "second");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn undeliverable_reply_shows_up_as_failed() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (status, body) = server
            .webhook(
                "/webhooks/messaging/acme",
                json!({"from": UNREACHABLE, "body": "hi"}),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["reply"]["outcome"], "reply_failed");
        assert_eq!(body["reply"]["report"]["delivery"]["status"], "failed");

        let (status, failed) = server.operator_get("/api/messages/failed").await;
        assert_eq!(status, 200);
        let failed = failed.as_array().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["delivery_status"], "failed");
        assert_eq!(failed[0]["client_id"], body["client_id"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn operator_can_send_a_manual_message() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (_, accepted) = server
            .webhook(
                "/webhooks/messaging/acme",
                json!({"from": "+15551234", "body": "hi", "message_id": "m1"}),
            )
            .await;
        let client_id = accepted["client_id"].as_str().unwrap();

        let resp = server
            .http
            .post(server.url(&format!("/api/clients/{client_id}/messages")))
            .bearer_auth(TOKEN)
            .json(&json!({"body": "An advisor will call you today."}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["message"]["automated"], false);
        assert_eq!(body["message"]["seq"], 3);
        assert_eq!(body["message"]["delivery_status"], "sent");
        assert_eq!(body["delivery"]["status"], "sent");

        let sent = server.messaging.sent.lock().unwrap().clone();
        assert_eq!(sent.last().map(String::as_str), Some("An advisor will call you today."));
    })
    .await
    .expect("test timed out");
}
