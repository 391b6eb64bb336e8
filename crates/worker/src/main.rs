use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence_engine::{Channels, Engine, EngineConfig, Stores};
use cadence_events::{CrmConfig, CrmWebhook, EmailConfig, EmailDelivery, SmsConfig, SmsGateway};

/// How long each engine service gets to finish its current step after the
/// shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cadence_worker=debug,cadence_engine=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = EngineConfig::from_env().context("Invalid engine configuration")?;
    tracing::info!(
        worker_id = %config.worker_id,
        poll_interval_secs = config.poll_interval.as_secs(),
        batch_size = config.batch_size,
        worker_concurrency = config.worker_concurrency,
        "Loaded engine configuration"
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = cadence_db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    cadence_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");

    cadence_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // --- Channels ---
    let channels = build_channels()?;
    let configured = channels.configured();
    if configured.is_empty() {
        tracing::warn!("No delivery channel configured, every dispatching action will fail");
    } else {
        tracing::info!(channels = ?configured, "Delivery channels configured");
    }

    // --- Engine ---
    let engine = Engine::new(Stores::postgres(pool), channels, config)
        .context("Failed to build engine")?;
    let cancel = CancellationToken::new();
    let handles = engine.spawn(cancel.clone());
    tracing::info!("Worker started (scheduler, event listener, clock triggers)");

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping engine services");
    cancel.cancel();

    for handle in handles {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Engine service task panicked"),
            Err(_) => tracing::warn!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "Engine service did not stop in time"
            ),
        }
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Channels whose configuration is present in the environment. A missing
/// block leaves that channel disabled; a present but broken one is fatal.
fn build_channels() -> anyhow::Result<Channels> {
    let mut channels = Channels::new();
    if let Some(config) = EmailConfig::from_env() {
        let email = EmailDelivery::new(config).context("Invalid SMTP configuration")?;
        channels = channels.with_email(Arc::new(email));
    }
    if let Some(config) = SmsConfig::from_env() {
        let sms = SmsGateway::new(config).context("Failed to build SMS gateway client")?;
        channels = channels.with_sms(Arc::new(sms));
    }
    if let Some(config) = CrmConfig::from_env() {
        let crm = CrmWebhook::new(config).context("Failed to build CRM webhook client")?;
        channels = channels.with_crm(Arc::new(crm));
    }
    Ok(channels)
}

/// Wait for Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
