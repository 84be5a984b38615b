//! Configuration types, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::channels::email::SmtpConfig;
use crate::error::ConfigError;
use crate::pipeline::identity::BandMember;

/// Default agent display name used in every outbound message.
pub const DEFAULT_AGENT_NAME: &str = "SickDay Agent";

/// Default band name used in composed replies.
pub const DEFAULT_BAND_NAME: &str = "Sick Day with Ferris";

/// Who the agent speaks as.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    /// Fixed display name, always included in outbound replies.
    pub agent_name: String,
    /// Band the agent books for.
    pub band_name: String,
    /// Sender address for outbound email.
    pub from_address: String,
}

impl Default for AgentIdentity {
    fn default() -> Self {
        Self {
            agent_name: DEFAULT_AGENT_NAME.to_string(),
            band_name: DEFAULT_BAND_NAME.to_string(),
            from_address: "bookings@example.com".to_string(),
        }
    }
}

/// Which hosted model family composes and classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }

    /// Environment variable holding this backend's API key.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }

    /// Model used when `LLM_MODEL` is unset.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAi => "gpt-4-turbo",
        }
    }
}

/// Model settings for the booking agent's language capability.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

impl LlmConfig {
    fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match var("LLM_BACKEND") {
            None => LlmBackend::OpenAi,
            Some(label) => LlmBackend::parse(&label).ok_or_else(|| ConfigError::InvalidValue {
                key: "LLM_BACKEND".into(),
                message: format!("unknown backend '{label}' (expected openai or anthropic)"),
            })?,
        };
        let key_var = backend.api_key_var();
        let api_key = var(key_var).ok_or_else(|| ConfigError::MissingEnvVar(key_var.into()))?;
        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model: var("LLM_MODEL").unwrap_or_else(|| backend.default_model().to_string()),
        })
    }
}

/// Knobs for the conversation router.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Upper bound on any single extraction/classification/composition call.
    pub collaborator_timeout: Duration,
    /// How long to wait for the per-conversation lock before reporting busy.
    pub lock_timeout: Duration,
    /// Extracted entities below this confidence are treated as absent.
    pub min_entity_confidence: f32,
    /// A dispatch claim older than this is presumed abandoned and may be retaken.
    pub dispatch_claim_ttl: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            collaborator_timeout: Duration::from_secs(20),
            lock_timeout: Duration::from_secs(10),
            min_entity_confidence: 0.5,
            dispatch_claim_ttl: Duration::from_secs(120),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub identity: AgentIdentity,
    pub port: u16,
    pub db_path: PathBuf,
    pub llm: LlmConfig,
    /// SMTP transport; `None` disables outbound email.
    pub smtp: Option<SmtpConfig>,
    /// Webhook signing secret; `None` skips signature verification.
    pub webhook_secret: Option<SecretString>,
    pub routing: RoutingConfig,
    /// Band members to seed into the roster table at startup.
    pub roster_seed: Vec<BandMember>,
    pub cors_origins: Vec<String>,
}

impl AppConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let llm = LlmConfig::from_vars(&var)?;

        let from_address =
            var("EMAIL_FROM_ADDRESS").unwrap_or_else(|| "bookings@example.com".to_string());

        let identity = AgentIdentity {
            agent_name: var("BOOKING_AGENT_NAME").unwrap_or_else(|| DEFAULT_AGENT_NAME.into()),
            band_name: var("BOOKING_BAND_NAME").unwrap_or_else(|| DEFAULT_BAND_NAME.into()),
            from_address: from_address.clone(),
        };

        let smtp = var("EMAIL_SMTP_HOST").map(|host| SmtpConfig {
            host,
            port: parse_or(var("EMAIL_SMTP_PORT"), 587),
            username: var("EMAIL_USERNAME").unwrap_or_default(),
            password: SecretString::from(var("EMAIL_PASSWORD").unwrap_or_default()),
            from_address,
        });

        let routing = RoutingConfig {
            collaborator_timeout: Duration::from_secs(parse_or(
                var("BOOKING_COLLABORATOR_TIMEOUT_SECS"),
                20,
            )),
            lock_timeout: Duration::from_secs(parse_or(var("BOOKING_LOCK_TIMEOUT_SECS"), 10)),
            min_entity_confidence: parse_or(var("BOOKING_MIN_ENTITY_CONFIDENCE"), 0.5_f32)
                .clamp(0.0, 1.0),
            dispatch_claim_ttl: Duration::from_secs(parse_or(
                var("BOOKING_DISPATCH_CLAIM_TTL_SECS"),
                120,
            )),
        };

        let roster_seed = match var("BOOKING_ROSTER") {
            Some(raw) => parse_roster(&raw)?,
            None => Vec::new(),
        };

        let cors_origins = var("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            identity,
            port: parse_or(var("BOOKING_PORT"), 8000),
            db_path: var("BOOKING_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/booking-agent.db")),
            llm,
            smtp,
            webhook_secret: var("EMAIL_WEBHOOK_SECRET").map(SecretString::from),
            routing,
            roster_seed,
            cors_origins,
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// Parse `Name <email>; Name <email>` into roster entries.
pub fn parse_roster(raw: &str) -> Result<Vec<BandMember>, ConfigError> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = || ConfigError::InvalidValue {
                key: "BOOKING_ROSTER".into(),
                message: format!("expected 'Name <email>', got '{entry}'"),
            };
            let open = entry.find('<').ok_or_else(invalid)?;
            let close = entry.rfind('>').filter(|&c| c > open).ok_or_else(invalid)?;
            let name = entry[..open].trim();
            let email = entry[open + 1..close].trim();
            if name.is_empty() || !email.contains('@') {
                return Err(invalid());
            }
            Ok(BandMember::new(name, email))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_with_only_api_key() {
        let config = AppConfig::from_lookup(lookup(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.identity.agent_name, DEFAULT_AGENT_NAME);
        assert_eq!(config.port, 8000);
        assert_eq!(config.llm.backend, LlmBackend::OpenAi);
        assert_eq!(config.llm.api_key.expose_secret(), "sk-test");
        assert!(config.smtp.is_none());
        assert!(config.webhook_secret.is_none());
        assert_eq!(config.routing.lock_timeout, Duration::from_secs(10));
        assert!(config.roster_seed.is_empty());
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let err = AppConfig::from_lookup(lookup(&[("LLM_BACKEND", "anthropic")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "ANTHROPIC_API_KEY"));
    }

    #[test]
    fn anthropic_backend_picks_its_key_and_model() {
        let config = AppConfig::from_lookup(lookup(&[
            ("LLM_BACKEND", " Anthropic "),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "sk-unused"),
        ]))
        .unwrap();
        assert_eq!(config.llm.backend, LlmBackend::Anthropic);
        assert_eq!(config.llm.api_key.expose_secret(), "sk-ant");
        assert_eq!(config.llm.model, LlmBackend::Anthropic.default_model());

        let pinned = AppConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("LLM_MODEL", "gpt-4o-mini"),
        ]))
        .unwrap();
        assert_eq!(pinned.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn unknown_backend_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("LLM_BACKEND", "llama")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn smtp_and_timeouts_from_env() {
        let config = AppConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("EMAIL_SMTP_HOST", "smtp.example.com"),
            ("EMAIL_SMTP_PORT", "2525"),
            ("EMAIL_FROM_ADDRESS", "agent@band.example"),
            ("BOOKING_COLLABORATOR_TIMEOUT_SECS", "3"),
            ("BOOKING_MIN_ENTITY_CONFIDENCE", "7"),
            ("BOOKING_DISPATCH_CLAIM_TTL_SECS", "45"),
        ]))
        .unwrap();
        let smtp = config.smtp.unwrap();
        assert_eq!(smtp.host, "smtp.example.com");
        assert_eq!(smtp.port, 2525);
        assert_eq!(smtp.from_address, "agent@band.example");
        assert_eq!(config.identity.from_address, "agent@band.example");
        assert_eq!(config.routing.collaborator_timeout, Duration::from_secs(3));
        assert_eq!(config.routing.dispatch_claim_ttl, Duration::from_secs(45));
        assert!((config.routing.min_entity_confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn roster_parsing() {
        let roster = parse_roster("John Smith <John@Band.example>; Jane Doe <jane@band.example>;")
            .unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].name, "John Smith");
        assert_eq!(roster[0].email, "John@Band.example");
        assert_eq!(roster[1].name, "Jane Doe");
    }

    #[test]
    fn roster_parsing_rejects_garbage() {
        assert!(parse_roster("John Smith john@band.example").is_err());
        assert!(parse_roster("<john@band.example>").is_err());
    }
}
