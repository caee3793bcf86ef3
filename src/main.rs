//! conduit: HTTP/1.1 and HTTP/2 connection pipeline server.
//!
//! ```text
//!   socket ──▶ listener ──▶ driver ──▶ stage chain ──▶ dispatcher
//!                                  ◀── frames ◀──────── response
//! ```
//!
//! Serves the built-in info dispatcher; embedders supply their own through
//! the library API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use conduit::config::validation::validate_config;
use conduit::config::watcher::ConfigWatcher;
use conduit::config::{load_config, ConfigError, ServerConfig};
use conduit::http::{HttpServer, InfoDispatcher};
use conduit::lifecycle::wait_for_signal;
use conduit::net::PemContextProvider;
use conduit::observability::logging::init_logging;
use conduit::observability::metrics::init_metrics;
use conduit::observability::TracingAccessLog;
use conduit::pipeline::assembler::Services;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "HTTP connection pipeline server", long_about = None)]
struct Cli {
    /// TOML configuration file, watched for changes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
        validate_config(&config).map_err(ConfigError::Validation)?;
    }

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "conduit starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let services = Services::new(
        Arc::new(InfoDispatcher),
        Arc::new(TracingAccessLog),
        Arc::new(PemContextProvider::new()),
    );
    let server = HttpServer::bind(config, services).await?;

    // The watcher stops when its handle is dropped.
    let (_watcher, reloads) = match &cli.config {
        Some(path) => {
            let (watcher, rx) = ConfigWatcher::new(path);
            (Some(watcher.run()?), Some(rx))
        }
        None => (None, None),
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.trigger();
    });

    server.run(reloads).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
