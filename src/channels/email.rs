//! Outbound email transport. SMTP via lettre.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::error::ChannelError;

// ── Configuration ───────────────────────────────────────────────────

/// SMTP settings, built by `AppConfig` from `EMAIL_*` variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

// ── Transport trait ─────────────────────────────────────────────────

/// Sends one email and returns a delivery id.
///
/// Retries are the transport's business; callers report failures upward.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(
        &self,
        to: &str,
        from_display_name: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, ChannelError>;
}

fn send_failed(reason: impl Into<String>) -> ChannelError {
    ChannelError::SendFailed {
        name: "email".into(),
        reason: reason.into(),
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

/// lettre-backed SMTP transport. The blocking send runs on the blocking pool.
pub struct SmtpEmailTransport {
    config: SmtpConfig,
}

impl SmtpEmailTransport {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

/// Build the lettre message. Returns it with its Message-ID (the delivery id).
fn build_message(
    from_address: &str,
    to: &str,
    from_display_name: &str,
    subject: &str,
    body: &str,
) -> Result<(Message, String), ChannelError> {
    let from = Mailbox::new(
        Some(from_display_name.to_string()),
        from_address
            .parse()
            .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
    );
    let to: Mailbox = to
        .parse()
        .map_err(|e| send_failed(format!("Invalid to address: {e}")))?;

    let domain = from_address.rsplit('@').next().unwrap_or("localhost");
    let message_id = format!("<{}@{}>", Uuid::new_v4(), domain);

    let email = Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .message_id(Some(message_id.clone()))
        .body(body.to_string())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;

    Ok((email, message_id))
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    async fn send(
        &self,
        to: &str,
        from_display_name: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, ChannelError> {
        let (email, message_id) =
            build_message(&self.config.from_address, to, from_display_name, subject, body)?;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            let creds = Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            );
            let transport = SmtpTransport::relay(&config.host)
                .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
                .port(config.port)
                .credentials(creds)
                .build();
            transport
                .send(&email)
                .map_err(|e| send_failed(format!("SMTP send failed: {e}")))
        })
        .await
        .map_err(|e| send_failed(format!("SMTP task panicked: {e}")))??;

        tracing::info!(to, delivery_id = %message_id, "Email sent");
        Ok(message_id)
    }
}

/// Used when SMTP is not configured: every send fails.
pub struct DisabledEmailTransport;

#[async_trait]
impl EmailTransport for DisabledEmailTransport {
    async fn send(
        &self,
        to: &str,
        _from_display_name: &str,
        _subject: &str,
        _body: &str,
    ) -> Result<String, ChannelError> {
        tracing::warn!(to, "Email transport not configured, dropping send");
        Err(send_failed("email transport not configured (set EMAIL_SMTP_HOST)"))
    }
}
