//! Inbound email webhook: Svix signature verification and event parsing.
//!
//! Events only reach the router after `SvixVerifier::verify` has passed
//! (when a signing secret is configured).

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::channels::email_types::{self, parse_address, readable_body, thread_reference};
use crate::error::ChannelError;
use crate::pipeline::types::InboundMessage;

type HmacSha256 = Hmac<Sha256>;

/// The only event type the router consumes.
pub const EMAIL_RECEIVED: &str = "email.received";

/// Accepted clock skew between sender and us.
const DEFAULT_TOLERANCE: Duration = Duration::from_secs(5 * 60);

fn auth_failed(reason: impl Into<String>) -> ChannelError {
    ChannelError::AuthFailed {
        name: "webhook".into(),
        reason: reason.into(),
    }
}

// ── Signature verification ──────────────────────────────────────────

/// Verifies Svix-style signatures: HMAC-SHA256 over `id.timestamp.body`.
pub struct SvixVerifier {
    key: Vec<u8>,
    tolerance: Duration,
}

impl SvixVerifier {
    /// Build from a `whsec_<base64>` secret. A secret without the prefix
    /// is used as raw key bytes.
    pub fn new(secret: &SecretString) -> Result<Self, ChannelError> {
        let secret = secret.expose_secret();
        let key = match secret.strip_prefix("whsec_") {
            Some(encoded) => BASE64
                .decode(encoded)
                .map_err(|e| auth_failed(format!("webhook secret is not valid base64: {e}")))?,
            None => secret.as_bytes().to_vec(),
        };
        if key.is_empty() {
            return Err(auth_failed("webhook secret is empty"));
        }
        Ok(Self {
            key,
            tolerance: DEFAULT_TOLERANCE,
        })
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    fn mac(&self, id: &str, timestamp: &str, body: &[u8]) -> Result<HmacSha256, ChannelError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| auth_failed(format!("invalid HMAC key: {e}")))?;
        mac.update(id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac)
    }

    /// Produce a `v1,<base64>` signature (used by senders and tests).
    pub fn sign(&self, id: &str, timestamp: &str, body: &[u8]) -> Result<String, ChannelError> {
        let mac = self.mac(id, timestamp, body)?;
        Ok(format!("v1,{}", BASE64.encode(mac.finalize().into_bytes())))
    }

    /// Check the headers against the body. `now` is unix seconds.
    ///
    /// `signatures` is the space-separated `svix-signature` header; any one
    /// valid `v1` entry is enough.
    pub fn verify(
        &self,
        id: &str,
        timestamp: &str,
        signatures: &str,
        body: &[u8],
        now: i64,
    ) -> Result<(), ChannelError> {
        if id.is_empty() {
            return Err(auth_failed("missing svix-id"));
        }
        let sent_at: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| auth_failed("invalid svix-timestamp"))?;
        if (now - sent_at).unsigned_abs() > self.tolerance.as_secs() {
            return Err(auth_failed("svix-timestamp outside tolerance"));
        }

        for candidate in signatures.split_whitespace() {
            let Some(encoded) = candidate.strip_prefix("v1,") else {
                continue;
            };
            let Ok(expected) = BASE64.decode(encoded) else {
                continue;
            };
            if self.mac(id, timestamp, body)?.verify_slice(&expected).is_ok() {
                return Ok(());
            }
        }
        Err(auth_failed("no matching signature"))
    }
}

// ── Event payload ───────────────────────────────────────────────────

/// Provider webhook event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EmailEventData,
}

/// Inbound email payload. `raw` (full MIME) fills in anything missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailEventData {
    #[serde(default)]
    pub email_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    /// Either a `{name: value}` map or a `[{name, value}]` list.
    #[serde(default)]
    pub headers: serde_json::Value,
    #[serde(default)]
    pub raw: Option<String>,
}

impl EmailEventData {
    /// Case-insensitive header lookup over either header shape.
    pub fn header(&self, name: &str) -> Option<&str> {
        match &self.headers {
            serde_json::Value::Object(map) => map
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .and_then(|(_, v)| v.as_str()),
            serde_json::Value::Array(list) => list.iter().find_map(|h| {
                let key = h.get("name")?.as_str()?;
                if key.eq_ignore_ascii_case(name) {
                    h.get("value")?.as_str()
                } else {
                    None
                }
            }),
            _ => None,
        }
    }
}

impl WebhookEvent {
    /// Reduce the event to an inbound message for the router.
    ///
    /// `fallback_id` (the delivery id) is the dedup key when the payload has
    /// neither an `email_id` nor a Message-ID.
    pub fn into_inbound(self, fallback_id: Option<&str>) -> Result<InboundMessage, ChannelError> {
        if self.event_type != EMAIL_RECEIVED {
            return Err(ChannelError::InvalidMessage(format!(
                "unsupported event type '{}'",
                self.event_type
            )));
        }
        let data = self.data;
        let from_raw = data
            .raw
            .as_deref()
            .and_then(|raw| email_types::parse_raw_email(raw.as_bytes()));

        let (sender, sender_name) = match (&data.from, &from_raw) {
            (Some(from), _) if !from.trim().is_empty() => parse_address(from),
            (_, Some(parsed)) => (parsed.sender.clone(), parsed.sender_name.clone()),
            _ => return Err(ChannelError::InvalidMessage("event has no sender".into())),
        };
        if !sender.contains('@') {
            return Err(ChannelError::InvalidMessage(format!(
                "sender '{sender}' is not an email address"
            )));
        }

        let subject = data
            .subject
            .clone()
            .or_else(|| from_raw.as_ref().and_then(|p| p.subject.clone()));

        let mut body = readable_body(data.text.as_deref(), data.html.as_deref());
        if body.is_empty()
            && let Some(parsed) = &from_raw
        {
            body = parsed.body.clone();
        }
        if body.is_empty() {
            return Err(ChannelError::InvalidMessage("event has no readable body".into()));
        }

        let thread = thread_reference(
            data.header("References"),
            data.header("In-Reply-To"),
            subject.as_deref(),
        )
        .or_else(|| from_raw.as_ref().and_then(|p| p.thread_reference.clone()));

        let provider_id = data
            .email_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| data.header("Message-ID").map(str::to_string))
            .or_else(|| from_raw.as_ref().and_then(|p| p.message_id.clone()))
            .or_else(|| fallback_id.map(str::to_string))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut message = InboundMessage::email(provider_id, &sender, subject, body, thread);
        message.sender_name = sender_name;
        Ok(message)
    }
}
