//! HTTP server: accept loop, per-connection tasks, reload and shutdown.
//!
//! # Responsibilities
//! - Bind the listener and accept connections under the connection limit
//! - Assemble each connection's chain from the current configuration
//! - Swap in a new assembler when a reloaded configuration arrives
//! - Stop accepting on shutdown and drain open connections

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::{PipelineConfig, ServerConfig};
use crate::lifecycle::Shutdown;
use crate::net::listener::ConnectionPermit;
use crate::net::{ConnectionDriver, ConnectionTracker, Listener, ListenerError};
use crate::observability::metrics;
use crate::pipeline::assembler::Services;
use crate::pipeline::{Assembler, AssemblyError, ConnectionContext, Pipeline};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct HttpServer {
    config: ServerConfig,
    services: Services,
    listener: Listener,
    local_addr: SocketAddr,
    assembler: ArcSwap<Assembler>,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
}

impl HttpServer {
    /// Binds the listener and compiles the initial configuration.
    pub async fn bind(config: ServerConfig, services: Services) -> Result<Self, ServerError> {
        let listener = Listener::bind(&config.listener).await?;
        let local_addr = listener.local_addr()?;
        let assembler = Assembler::new(
            PipelineConfig::from_server(&config),
            &config.listener,
            local_addr,
            services.clone(),
        )?;

        Ok(Self {
            config,
            services,
            listener,
            local_addr,
            assembler: ArcSwap::from_pointee(assembler),
            tracker: ConnectionTracker::new(),
            shutdown: Shutdown::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops the server when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Applies a new configuration to connections accepted from now on.
    /// Listener settings need a restart and are not applied.
    pub fn reload(&self, config: &ServerConfig) -> Result<(), AssemblyError> {
        if config.listener != self.config.listener {
            tracing::warn!("Listener settings changed; they take effect after a restart");
        }
        let assembler = Assembler::new(
            PipelineConfig::from_server(config),
            &self.config.listener,
            self.local_addr,
            self.services.clone(),
        )?;
        self.assembler.store(Arc::new(assembler));
        tracing::info!("Configuration reloaded");
        Ok(())
    }

    /// Serves until shutdown is triggered, then waits for open connections.
    pub async fn run(self, mut reloads: Option<mpsc::UnboundedReceiver<ServerConfig>>) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!(address = %self.local_addr, secure = self.config.listener.secure, "HTTP server starting");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                config = next_reload(&mut reloads) => {
                    if let Err(e) = self.reload(&config) {
                        tracing::error!(error = %e, "Failed to apply reloaded configuration");
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => self.spawn_connection(stream, peer, permit),
                    Err(ListenerError::Closed) => break,
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
            }
        }

        let active = self.tracker.active_count();
        tracing::info!(active_connections = active, "Stopped accepting, draining connections");
        let timeout = Duration::from_secs(self.config.listener.shutdown_timeout_secs);
        if !self.tracker.wait_for_shutdown(timeout).await {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Shutdown timeout elapsed with connections still open"
            );
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
        let assembler = self.assembler.load_full();
        let guard = self.tracker.track();
        let shutdown = self.shutdown.subscribe();
        let local = self.local_addr;
        let span = tracing::debug_span!("connection", connection_id = %guard.id(), peer_addr = %peer);

        tokio::spawn(
            async move {
                let _permit = permit;
                metrics::connection_opened();

                let mut conn = ConnectionContext::new(guard.id(), assembler.is_secure(), local, peer);
                match assembler.build(&mut conn) {
                    Ok(chain) => {
                        let pipeline = Pipeline::new(chain, conn);
                        let driver = ConnectionDriver::new(stream, pipeline, assembler, shutdown);
                        if let Err(e) = driver.run().await {
                            tracing::debug!(error = %e, "Connection ended with an I/O error");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Rejecting connection"),
                }

                metrics::connection_closed();
                drop(guard);
            }
            .instrument(span),
        );
    }
}

async fn next_reload(reloads: &mut Option<mpsc::UnboundedReceiver<ServerConfig>>) -> ServerConfig {
    if let Some(rx) = reloads {
        if let Some(config) = rx.recv().await {
            return config;
        }
        *reloads = None;
    }
    std::future::pending().await
}
