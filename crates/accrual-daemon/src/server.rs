//! WebSocket server for accepting heartbeat connections.
//!
//! Owns the registry, the adapter in front of it and the sweeper that reaps
//! it. Every accepted connection runs in its own task.

use crate::adapter::IngestionAdapter;
use crate::config::DaemonConfig;
use crate::connection::PeerConnection;
use accrual_core::{PeerRegistry, Sweeper};
use anyhow::Result;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info};

/// Heartbeat ingestion and health-query server.
pub struct HeartbeatServer {
    config: DaemonConfig,
    registry: Arc<PeerRegistry>,
    adapter: Arc<IngestionAdapter>,
}

impl HeartbeatServer {
    /// Create a server from a validated configuration.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(PeerRegistry::new(&config.detector));
        let adapter = Arc::new(IngestionAdapter::new(Arc::clone(&registry), config.identity));
        Ok(Self {
            config,
            registry,
            adapter,
        })
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Heartbeat server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Address from the configuration, for [`bind`](Self::bind).
    pub fn listen_addr(&self) -> &str {
        &self.config.listen
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Accept connections and sweep the registry until `shutdown` resolves.
    ///
    /// On shutdown open connections are dropped and the sweeper is stopped
    /// after finishing any sweep in progress.
    pub async fn run(self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        let sweeper = Sweeper::start(Arc::clone(&self.registry), self.config.detector.sweep_interval());
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        info!(
            identity = ?self.config.identity,
            window_size = self.config.detector.window_size,
            time_unit = ?self.config.detector.time_unit,
            "Heartbeat server running"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let adapter = Arc::clone(&self.adapter);
                            connections.spawn(accept_connection(stream, addr, adapter));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                Some(result) = connections.join_next() => {
                    if let Err(e) = result {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        connections.shutdown().await;
        sweeper.stop().await;
        info!(
            active_peers = self.registry.len(),
            reaped_total = self.registry.reaped_total(),
            "Heartbeat server stopped"
        );
        Ok(())
    }
}

/// Upgrade a TCP connection to WebSocket and serve it until it closes.
async fn accept_connection(stream: TcpStream, addr: SocketAddr, adapter: Arc<IngestionAdapter>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            // Health checks (like `nc -z`) connect and immediately close without
            // completing the WebSocket handshake.
            let err_str = e.to_string();
            if err_str.contains("Handshake not finished")
                || err_str.contains("Connection reset")
                || err_str.contains("unexpected EOF")
            {
                debug!("Connection closed before handshake from {}", addr);
            } else {
                error!("WebSocket upgrade failed for {}: {}", addr, e);
            }
            return;
        }
    };

    debug!("New connection from {}", addr);
    PeerConnection::new(addr, ws_stream, adapter).run().await;
    debug!("Connection from {} finished", addr);
}
