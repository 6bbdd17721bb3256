//! branchbase daemon entry point.
//!
//! Loads configuration, opens the database, builds the engine, serves the
//! HTTP API and shuts down cleanly on SIGINT/SIGTERM.

mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use branchbase_core::config::AppConfig;
use branchbase_core::db::Database;
use branchbase_core::engine::Engine;
use branchbase_web::WebServer;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// branchbase server daemon.
#[derive(Parser, Debug)]
#[command(
    name = "branchbase-daemon",
    version,
    about = "Serve the branchbase version-control API"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load_and_validate(&args.config)
        .context("failed to load configuration file")?;

    // Initialize tracing
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    // Startup banner
    info!("========================================");
    info!("  branchbase daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file    : {}", args.config.display());
    info!("Web listen     : {}", config.web.listen);
    info!("Data dir       : {}", config.daemon.data_dir.display());
    info!("Default tenant : {}", config.engine.default_tenant);
    info!("Lock timeout   : {}ms", config.engine.merge_lock_timeout_ms);
    info!("Log level      : {}", log_level);
    info!("========================================");

    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;

    let db_path = config.daemon.database_path();
    let db = Database::open(&db_path).context("failed to open database")?;
    info!("Database initialized at {}", db_path.display());

    let engine = Arc::new(Engine::new(Arc::new(db), config.engine.clone()));
    let tenant = engine
        .ensure_tenant(None)
        .await
        .context("failed to bootstrap the default branch")?;
    info!(branch_id = %tenant.id, name = %tenant.name, "default branch ready");

    let listen_addr = config.web.listen.clone();
    let web_server = WebServer::new(config, engine);
    web_server
        .start(&listen_addr, signals::shutdown_signal())
        .await
        .context("web server failed")?;

    info!("branchbase daemon stopped.");
    Ok(())
}
