//! # Meridian Terminal Agent
//!
//! Runs the resilience service for one POS terminal.
//!
//! ## Startup Sequence
//! 1. Initialize tracing (`RUST_LOG` or `info,meridian=debug,sqlx=warn`)
//! 2. Load `resilience.toml` (path from the first argument or `MERIDIAN_CONFIG`)
//! 3. Connect to the local database & run migrations
//! 4. Build and start the `ResilienceService`
//! 5. Wait for Ctrl+C / SIGTERM, then shut down gracefully

use anyhow::Context;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian_db::{Database, DbConfig};
use meridian_sync::{ResilienceConfig, ResilienceServiceBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Meridian terminal agent");

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MERIDIAN_CONFIG").ok())
        .map(PathBuf::from);

    let mut config =
        ResilienceConfig::load(config_path.clone()).context("loading resilience config")?;
    info!(
        role = %config.terminal.role,
        name = %config.terminal.name,
        "Configuration loaded"
    );

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Database::new(DbConfig::new(&db_path))
        .await
        .with_context(|| format!("opening {}", db_path.display()))?;
    info!(path = %db_path.display(), "Database ready");

    let handle = ResilienceServiceBuilder::new(config.clone())
        .with_database(db.clone())
        .with_app_version(env!("CARGO_PKG_VERSION"))
        .build()?
        .start()
        .await?;

    // Keep the assigned id across restarts
    if config.terminal.id.is_none() {
        config.terminal.id = Some(handle.terminal_id().to_string());
        if let Err(e) = config.save(config_path) {
            warn!(error = %e, "Could not persist terminal id");
        }
    }

    shutdown_signal().await;

    if let Err(e) = handle.shutdown().await {
        error!(error = %e, "Resilience service did not stop cleanly");
    }
    db.close().await;

    info!("Terminal agent stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meridian=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, stopping services...");
}
