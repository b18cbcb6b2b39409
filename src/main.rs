use std::sync::Arc;
use std::sync::atomic::Ordering;

use docmail::config::{EngineConfig, PollerConfig, SmtpConfig};
use docmail::connector::NetworkConnector;
use docmail::import::ImportOrchestrator;
use docmail::outbound::SmtpMailTransport;
use docmail::poller::spawn_import_poller;
use docmail::repository::{FsRepository, GuessMimeTypes};
use docmail::store::{AccountStore, LibSqlAccountStore};

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

    let engine_config = EngineConfig::from_env()?;
    let poller_config = PollerConfig::from_env()?;
    let smtp_config = SmtpConfig::from_env()?;

    eprintln!("📬 docmail v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Accounts: {}", poller_config.db_path.display());
    eprintln!("   Repository: {}", poller_config.repository_root.display());
    eprintln!("   Mail root: {}", engine_config.mail_root);
    eprintln!("   Poll interval: {}s", poller_config.poll_interval.as_secs());
    match &smtp_config {
        Some(smtp) => eprintln!("   Outbound SMTP: {}:{}\n", smtp.host, smtp.port),
        None => eprintln!("   Outbound SMTP: disabled (DOCMAIL_SMTP_HOST not set)\n"),
    }

    // ── Storage ──────────────────────────────────────────────────────────
    if let Some(parent) = poller_config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let accounts: Arc<dyn AccountStore> =
        Arc::new(LibSqlAccountStore::open(&poller_config.db_path).await?);
    let repository = Arc::new(FsRepository::open(&poller_config.repository_root)?);

    // Fail fast on a broken relay configuration.
    if let Some(smtp) = &smtp_config {
        SmtpMailTransport::new(smtp)?;
    }

    // ── Import poller ────────────────────────────────────────────────────
    let engine = Arc::new(ImportOrchestrator::new(
        Arc::new(NetworkConnector::default()),
        repository,
        Arc::clone(&accounts),
        Arc::new(GuessMimeTypes),
        engine_config,
    ));
    let (poller, shutdown) =
        spawn_import_poller(engine, accounts, poller_config.poll_interval);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown.store(true, Ordering::Relaxed);
    poller.abort();

    Ok(())
}
