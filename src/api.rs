//! HTTP surface: chat turns, the inbound email webhook, history and health.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channels::webhook::{EMAIL_RECEIVED, SvixVerifier, WebhookEvent};
use crate::error::{ChannelError, DispatchError, Error, RoutingError};
use crate::pipeline::service::BookingService;
use crate::pipeline::types::{InboundMessage, Intent};

const DEFAULT_LIST_LIMIT: usize = 50;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BookingService>,
    /// `None` accepts unsigned webhooks (local development only).
    pub verifier: Option<Arc<SvixVerifier>>,
}

/// Build the API router.
pub fn routes(state: AppState, cors_origins: &[String]) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/v1/chat", post(chat))
        .route("/api/v1/webhooks/email", post(email_webhook))
        .route("/api/v1/conversations", get(list_conversations))
        .route("/api/v1/conversations/{id}/messages", get(conversation_messages))
        .with_state(state);

    let origins: Vec<HeaderValue> = cors_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    if origins.is_empty() {
        return router;
    }
    router.layer(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any),
    )
}

// ── Errors ──────────────────────────────────────────────────────────

/// Maps service errors onto status codes.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retry_after) = match &self.0 {
            Error::Routing(RoutingError::Busy { waited, .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, Some(waited.as_secs().max(1)))
            }
            Error::Routing(RoutingError::InvalidMessage(_)) => (StatusCode::BAD_REQUEST, None),
            Error::Dispatch(DispatchError::InFlight(_)) => (StatusCode::CONFLICT, Some(1)),
            Error::Dispatch(_) => (StatusCode::BAD_GATEWAY, None),
            Error::Channel(ChannelError::AuthFailed { .. }) => (StatusCode::UNAUTHORIZED, None),
            Error::Channel(_) => (StatusCode::BAD_REQUEST, None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.0, "Request failed");
        }

        let mut response = (
            status,
            Json(json!({
                "error": self.0.to_string(),
                "retryable": retry_after.is_some(),
            })),
        )
            .into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

// ── Chat ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub sender_email: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Chat session key; defaults to the sender.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Client-chosen id for safe retries.
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub intent: Intent,
    pub response: String,
    pub message_id: String,
    pub duplicate: bool,
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let provider_id = req
        .message_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut inbound = InboundMessage::chat(
        provider_id,
        &req.sender_email,
        req.conversation_id.as_deref(),
        req.message,
    );
    inbound.sender_name = req.sender_name;

    let outcome = state.service.handle(inbound).await?;
    Ok(Json(ChatResponse {
        conversation_id: outcome.conversation_id,
        intent: outcome.intent,
        response: outcome.response.unwrap_or_default(),
        message_id: outcome.message_id,
        duplicate: outcome.duplicate,
    }))
}

// ── Email webhook ───────────────────────────────────────────────────

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

async fn email_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if let Some(verifier) = &state.verifier {
        verifier
            .verify(
                header(&headers, "svix-id"),
                header(&headers, "svix-timestamp"),
                header(&headers, "svix-signature"),
                &body,
                chrono::Utc::now().timestamp(),
            )
            .map_err(|e| {
                warn!(error = %e, "Rejected webhook with invalid signature");
                Error::from(e)
            })?;
    }

    let event: WebhookEvent = serde_json::from_slice(&body).map_err(|e| {
        Error::from(ChannelError::InvalidMessage(format!("invalid webhook payload: {e}")))
    })?;
    if event.event_type != EMAIL_RECEIVED {
        debug!(event_type = %event.event_type, "Ignoring webhook event");
        return Ok(Json(json!({"status": "ignored"})).into_response());
    }

    let svix_id = headers
        .get("svix-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty());
    let inbound = event.into_inbound(svix_id).map_err(Error::from)?;
    let outcome = state.service.handle(inbound).await?;

    Ok(Json(json!({
        "status": "processed",
        "conversation_id": outcome.conversation_id,
        "intent": outcome.intent,
        "duplicate": outcome.duplicate,
    }))
    .into_response())
}

// ── History ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_conversations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 500);
    let conversations = state
        .service
        .store()
        .list_conversations(limit)
        .await
        .map_err(Error::from)?;
    Ok(Json(json!({ "conversations": conversations })).into_response())
}

async fn conversation_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let store = state.service.store();
    let Some(conversation) = store.get_conversation(&id).await.map_err(Error::from)? else {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Conversation not found"})),
        )
            .into_response());
    };
    let messages = store.load_history(&id).await.map_err(Error::from)?;
    Ok(Json(json!({
        "conversation": conversation,
        "messages": messages,
    }))
    .into_response())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "roster_size": state.service.router().roster().members().len(),
        "webhook_verification": state.verifier.is_some(),
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use secrecy::SecretString;
    use tower::ServiceExt;

    use super::*;
    use crate::channels::email::DisabledEmailTransport;
    use crate::config::{AgentIdentity, RoutingConfig};
    use crate::error::LlmError;
    use crate::pipeline::capability::{ComposeRequest, ExtractionRequest, LanguageCapability};
    use crate::pipeline::dispatcher::ActionDispatcher;
    use crate::pipeline::identity::Roster;
    use crate::pipeline::router::ConversationRouter;
    use crate::store::{ConversationStore, LibSqlBackend};

    #[test]
    fn busy_maps_to_503_with_retry_after() {
        let err = ApiError(Error::Routing(RoutingError::Busy {
            conversation_id: "chat:x".into(),
            waited: Duration::from_secs(10),
        }));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "10");
    }

    #[test]
    fn transport_failure_maps_to_502() {
        let err = ApiError(Error::Dispatch(DispatchError::Transport(ChannelError::SendFailed {
            name: "email".into(),
            reason: "smtp down".into(),
        })));
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn auth_failure_maps_to_401() {
        let err = ApiError(Error::Channel(ChannelError::AuthFailed {
            name: "webhook".into(),
            reason: "bad signature".into(),
        }));
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    struct SilentCapability;

    #[async_trait]
    impl LanguageCapability for SilentCapability {
        async fn classify_follow_up(&self, _text: &str) -> Result<String, LlmError> {
            Ok("OTHER".into())
        }
        async fn extract_entities(&self, _request: &ExtractionRequest) -> Result<serde_json::Value, LlmError> {
            Ok(json!({}))
        }
        async fn compose_reply(&self, _request: &ComposeRequest<'_>) -> Result<String, LlmError> {
            Ok("Thanks!".into())
        }
    }

    async fn app(verifier: Option<Arc<SvixVerifier>>) -> Router {
        let store: Arc<dyn ConversationStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let identity = AgentIdentity::default();
        let router = ConversationRouter::new(
            Arc::clone(&store),
            Arc::new(SilentCapability),
            Roster::default(),
            identity.clone(),
            RoutingConfig::default(),
        );
        let dispatcher = ActionDispatcher::new(Arc::new(DisabledEmailTransport), identity);
        let service = Arc::new(BookingService::new(store, router, dispatcher));
        routes(
            AppState { service, verifier },
            &["http://localhost:3000".to_string()],
        )
    }

    #[tokio::test]
    async fn unknown_conversation_is_404() {
        let response = app(None)
            .await
            .oneshot(
                Request::builder()
                    .uri("/api/v1/conversations/chat:nobody/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unsigned_webhook_rejected_when_secret_configured() {
        let secret = SecretString::from("whsec_c2VjcmV0LWtleQ==");
        let verifier = Arc::new(SvixVerifier::new(&secret).unwrap());
        let response = app(Some(verifier))
            .await
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/v1/webhooks/email")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"type":"email.received","data":{}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cors_preflight_allows_configured_origin() {
        let response = app(None)
            .await
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/v1/chat")
                    .header("origin", "http://localhost:3000")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:3000"
        );
    }
}
