//! Email I/O: outbound transport and the inbound webhook.

pub mod email;
pub mod email_types;
pub mod webhook;

pub use email::{DisabledEmailTransport, EmailTransport, SmtpConfig, SmtpEmailTransport};
pub use webhook::{SvixVerifier, WebhookEvent};
