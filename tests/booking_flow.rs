//! End-to-end tests for the booking HTTP API.
//!
//! Each test spins up an Axum server on a random port with an in-memory
//! database, a scripted LLM and a recording email transport, then drives
//! it over HTTP with reqwest.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use booking_agent::api::{AppState, routes};
use booking_agent::channels::{EmailTransport, SvixVerifier};
use booking_agent::config::{AgentIdentity, RoutingConfig};
use booking_agent::error::{ChannelError, LlmError};
use booking_agent::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use booking_agent::pipeline::dates::display_date;
use booking_agent::pipeline::{
    ActionDispatcher, BandMember, BookingService, ConversationRouter, ProviderCapability, Roster,
};
use booking_agent::store::{ConversationStore, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Scripted LLM: answers by looking at which prompt it was given.
struct ScriptedLlm;

impl ScriptedLlm {
    fn answer(request: &CompletionRequest) -> String {
        let system = request
            .messages
            .first()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let last = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        if system.starts_with("You classify") {
            let label = if last.contains('$') { "NEGOTIATION" } else { "FOLLOW_UP" };
            label.to_string()
        } else if system.starts_with("You extract") {
            let message = last.split("Message:\n").nth(1).unwrap_or_default();
            let message = message.split("\n\nReturn a JSON").next().unwrap_or_default();
            let person = ["John", "Zed"].into_iter().find(|name| message.contains(name));
            let date = message.contains("July 4th").then_some("July 4th");
            format!(
                "```json\n{}\n```",
                json!({
                    "person": person.map(|p| json!({"value": p, "confidence": 0.9})),
                    "date": date.map(|d| json!({"value": d, "confidence": 0.9})),
                })
            )
        } else {
            "Thanks for getting in touch!\n\nBest,\n[Your Name]".to_string()
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: Self::answer(&request),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
        })
    }
}

/// Records every email instead of sending it.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<SentEmail>>,
}

#[derive(Debug, Clone)]
struct SentEmail {
    to: String,
    from_name: String,
    subject: String,
}

#[async_trait]
impl EmailTransport for RecordingTransport {
    async fn send(
        &self,
        to: &str,
        from_display_name: &str,
        subject: &str,
        _body: &str,
    ) -> Result<String, ChannelError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(SentEmail {
            to: to.to_string(),
            from_name: from_display_name.to_string(),
            subject: subject.to_string(),
        });
        Ok(format!("<{}@test.example>", sent.len()))
    }
}

impl RecordingTransport {
    fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }
}

struct TestServer {
    base: String,
    transport: Arc<RecordingTransport>,
    verifier: Arc<SvixVerifier>,
    client: reqwest::Client,
}

/// Start an Axum server on a random port.
async fn start_server() -> TestServer {
    let store: Arc<dyn ConversationStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let identity = AgentIdentity::default();
    let roster = Roster::new(vec![
        BandMember::new("John Smith", "john@band.example"),
        BandMember::new("Mike Jones", "mike@band.example"),
    ]);
    for member in roster.members() {
        store.upsert_band_member(member).await.unwrap();
    }

    let capability = Arc::new(ProviderCapability::new(Arc::new(ScriptedLlm), identity.clone()));
    let router = ConversationRouter::new(
        Arc::clone(&store),
        capability,
        roster,
        identity.clone(),
        RoutingConfig {
            collaborator_timeout: Duration::from_secs(2),
            lock_timeout: Duration::from_secs(5),
            min_entity_confidence: 0.5,
            ..RoutingConfig::default()
        },
    );
    let transport = Arc::new(RecordingTransport::default());
    let dispatcher = ActionDispatcher::new(transport.clone(), identity);
    let service = Arc::new(BookingService::new(store, router, dispatcher));

    let secret = SecretString::from(format!("whsec_{}", BASE64.encode(b"integration-secret")));
    let verifier = Arc::new(SvixVerifier::new(&secret).unwrap());

    let app = routes(
        AppState {
            service,
            verifier: Some(Arc::clone(&verifier)),
        },
        &[],
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        transport,
        verifier,
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    async fn chat(&self, body: Value) -> (reqwest::StatusCode, Value) {
        let response = self
            .client
            .post(format!("{}/api/v1/chat", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn webhook(&self, svix_id: &str, event: &Value, signed: bool) -> (reqwest::StatusCode, Value) {
        let body = serde_json::to_vec(event).unwrap();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = if signed {
            self.verifier.sign(svix_id, &timestamp, &body).unwrap()
        } else {
            "v1,bm90LWEtc2lnbmF0dXJl".to_string()
        };
        let response = self
            .client
            .post(format!("{}/api/v1/webhooks/email", self.base))
            .header("content-type", "application/json")
            .header("svix-id", svix_id)
            .header("svix-timestamp", timestamp)
            .header("svix-signature", signature)
            .body(body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn history(&self, conversation_id: &str) -> Vec<Value> {
        let response: Value = self
            .client
            .get(format!("{}/api/v1/conversations/{conversation_id}/messages", self.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        response["messages"].as_array().cloned().unwrap_or_default()
    }
}

fn venue_email(email_id: &str, text: &str) -> Value {
    json!({
        "type": "email.received",
        "data": {
            "email_id": email_id,
            "from": "The Blue Room <booking@blueroom.example>",
            "subject": "Show on July 4th",
            "text": text,
            "headers": {}
        }
    })
}

// ── Chat ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_availability_request_emails_the_member() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, body) = server
            .chat(json!({
                "message": "ask John what his availability is for July 4th",
                "sender_email": "Mike@Band.example",
                "sender_name": "Mike"
            }))
            .await;

        assert_eq!(status, 200);
        assert_eq!(body["intent"], "BAND_AVAILABILITY_REQUEST");
        assert_eq!(body["conversation_id"], "chat:mike@band.example");
        assert!(body["response"].as_str().unwrap().contains("John Smith"));

        let sent = server.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "john@band.example");
        assert_eq!(sent[0].from_name, "SickDay Agent");
        assert_eq!(
            sent[0].subject,
            format!("Availability check: {}", display_date("July 4th"))
        );
        assert!(sent[0].subject.starts_with("Availability check: July 4, 20"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn chat_unknown_member_gets_clarification_without_email() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, body) = server
            .chat(json!({
                "message": "ask Zed what his availability is for July 4th",
                "sender_email": "mike@band.example"
            }))
            .await;

        assert_eq!(status, 200);
        assert_eq!(body["intent"], "BAND_AVAILABILITY_REQUEST");
        let reply = body["response"].as_str().unwrap();
        assert!(reply.contains("Zed"));
        assert!(reply.contains("John Smith, Mike Jones"));
        assert!(server.transport.sent().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn chat_retry_with_same_message_id_returns_recorded_reply() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let request = json!({
            "message": "ask John what his availability is for July 4th",
            "sender_email": "mike@band.example",
            "message_id": "client-1"
        });

        let (_, first) = server.chat(request.clone()).await;
        let (status, retry) = server.chat(request).await;

        assert_eq!(status, 200);
        assert_eq!(retry["duplicate"], true);
        assert_eq!(retry["response"], first["response"]);
        assert_eq!(server.transport.sent().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_first_messages_yield_one_venue_inquiry() {
    timeout(TEST_TIMEOUT, async {
        let server = Arc::new(start_server().await);

        let requests = (0..5).map(|i| {
            let server = Arc::clone(&server);
            async move {
                server
                    .chat(json!({
                        "message": format!("Hello, message {i}"),
                        "sender_email": "venue@club.example",
                        "conversation_id": "club-session",
                        "message_id": format!("msg-{i}")
                    }))
                    .await
            }
        });
        let results = futures::future::join_all(requests).await;

        let inquiries = results
            .iter()
            .filter(|(status, body)| *status == 200 && body["intent"] == "VENUE_INQUIRY")
            .count();
        assert_eq!(inquiries, 1);
        assert!(results.iter().all(|(status, _)| *status == 200));
    })
    .await
    .expect("test timed out");
}

// ── Webhook ──────────────────────────────────────────────────────────

#[tokio::test]
async fn venue_email_thread_first_contact_then_negotiation() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, first) = server
            .webhook("svix-1", &venue_email("em-1", "URGENT CANCEL"), true)
            .await;
        assert_eq!(status, 200);
        assert_eq!(first["intent"], "VENUE_INQUIRY");
        assert_eq!(first["conversation_id"], "email:booking@blueroom.example");

        let (status, second) = server
            .webhook("svix-2", &venue_email("em-2", "Could you do $900 for the night?"), true)
            .await;
        assert_eq!(status, 200);
        assert_eq!(second["intent"], "NEGOTIATION");

        let sent = server.transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|e| e.to == "booking@blueroom.example"));
        assert_eq!(sent[0].subject, "Re: Show on July 4th");

        let history = server.history("email:booking@blueroom.example").await;
        let directions: Vec<&str> = history
            .iter()
            .map(|m| m["direction"].as_str().unwrap())
            .collect();
        assert_eq!(directions, ["inbound", "outbound", "inbound", "outbound"]);
        assert_eq!(history[0]["classification"]["stage"], "FIRST");
        assert_eq!(history[2]["classification"]["stage"], "FOLLOW_UP");
        assert!(
            history[1]["body"]
                .as_str()
                .unwrap()
                .contains("SickDay Agent")
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_retry_is_deduplicated() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let event = venue_email("em-1", "Do you play weddings?");

        server.webhook("svix-1", &event, true).await;
        let (status, retry) = server.webhook("svix-1", &event, true).await;

        assert_eq!(status, 200);
        assert_eq!(retry["duplicate"], true);
        assert_eq!(server.transport.sent().len(), 1);
        assert_eq!(server.history("email:booking@blueroom.example").await.len(), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_with_bad_signature_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, _) = server
            .webhook("svix-1", &venue_email("em-1", "Hello"), false)
            .await;
        assert_eq!(status, 401);
        assert!(server.transport.sent().is_empty());
        assert!(server.history("email:booking@blueroom.example").await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn non_email_events_are_ignored() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let event = json!({"type": "email.delivered", "data": {"email_id": "em-9"}});

        let (status, body) = server.webhook("svix-9", &event, true).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ignored");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn health_reports_roster() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let body: Value = server
            .client
            .get(format!("{}/health", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["roster_size"], 2);
        assert_eq!(body["webhook_verification"], true);
    })
    .await
    .expect("test timed out");
}
