use std::sync::Arc;

use anyhow::Context;

use booking_agent::api::{AppState, routes};
use booking_agent::channels::{DisabledEmailTransport, EmailTransport, SmtpEmailTransport, SvixVerifier};
use booking_agent::config::AppConfig;
use booking_agent::llm::create_provider;
use booking_agent::pipeline::{
    ActionDispatcher, BookingService, ConversationRouter, ProviderCapability, Roster,
};
use booking_agent::store::{ConversationStore, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("Invalid configuration")?;

    eprintln!("🎸 Booking Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent: {} for {}", config.identity.agent_name, config.identity.band_name);
    eprintln!("   Model: {}", config.llm.model);

    let llm = create_provider(&config.llm)?;

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn ConversationStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Roster ──────────────────────────────────────────────────────────
    for member in &config.roster_seed {
        store.upsert_band_member(member).await?;
    }
    let roster = Roster::new(store.list_band_members().await?);
    if roster.is_empty() {
        tracing::warn!("Roster is empty: every sender will be treated as external (set BOOKING_ROSTER)");
    }
    eprintln!("   Roster: {}", roster.display_names());

    // ── Email ───────────────────────────────────────────────────────────
    let transport: Arc<dyn EmailTransport> = match config.smtp.clone() {
        Some(smtp) => {
            eprintln!("   Email: SMTP {}:{}", smtp.host, smtp.port);
            Arc::new(SmtpEmailTransport::new(smtp))
        }
        None => {
            eprintln!("   Email: disabled (set EMAIL_SMTP_HOST)");
            Arc::new(DisabledEmailTransport)
        }
    };
    let verifier = match &config.webhook_secret {
        Some(secret) => Some(Arc::new(SvixVerifier::new(secret)?)),
        None => {
            tracing::warn!("EMAIL_WEBHOOK_SECRET not set: inbound webhooks are not verified");
            None
        }
    };

    // ── Pipeline ────────────────────────────────────────────────────────
    let capability = Arc::new(ProviderCapability::new(llm, config.identity.clone()));
    let router = ConversationRouter::new(
        Arc::clone(&store),
        capability,
        roster,
        config.identity.clone(),
        config.routing.clone(),
    );
    let dispatcher = ActionDispatcher::new(transport, config.identity.clone());
    let service = Arc::new(BookingService::new(store, router, dispatcher));

    let app = routes(AppState { service, verifier }, &config.cors_origins);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    eprintln!("   API: http://0.0.0.0:{}/api/v1\n", config.port);
    tracing::info!(port = config.port, "Booking agent listening");

    axum::serve(listener, app).await?;
    Ok(())
}
