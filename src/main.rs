use credvault::{Config, CredentialStore};
use mimalloc::MiMalloc;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Open (and if needed create or migrate) the vault database named by the
/// configuration, report what happened, and release it.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        database_url = %cfg.database.url,
        loglevel = %cfg.loglevel,
        max_connections = cfg.database.max_connections,
        m_cost = cfg.hashing.m_cost,
        t_cost = cfg.hashing.t_cost,
    );

    let store = CredentialStore::open(&cfg).await?;

    match store.legacy_import() {
        Some(report) => info!(
            owners = report.owners,
            accounts = report.accounts,
            skipped = report.skipped_accounts,
            "legacy database migrated"
        ),
        None => info!("schema ready"),
    }

    store.close().await;
    Ok(())
}
