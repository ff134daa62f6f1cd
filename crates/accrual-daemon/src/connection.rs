//! Individual heartbeat connection handling.
//!
//! Each accepted WebSocket is served by its own task: read a frame, stamp its
//! arrival, hand it to the adapter, write back any reply.

use crate::adapter::IngestionAdapter;
use crate::message::{MAX_MESSAGE_SIZE, WireMessage};
use anyhow::{Result, anyhow};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};
use web_time::Instant;

/// A single WebSocket connection from a heartbeat client.
pub struct PeerConnection {
    /// Remote socket address
    remote: SocketAddr,
    ws: WebSocketStream<TcpStream>,
    adapter: Arc<IngestionAdapter>,
}

impl PeerConnection {
    pub fn new(remote: SocketAddr, ws: WebSocketStream<TcpStream>, adapter: Arc<IngestionAdapter>) -> Self {
        Self { remote, ws, adapter }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Serve frames until the client disconnects.
    pub async fn run(mut self) {
        loop {
            match self.ws.next().await {
                Some(Ok(msg)) => {
                    // Stamp before any parsing or lock acquisition.
                    let arrival = Instant::now();

                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", self.remote);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from {} exceeds max size ({} > {}), dropping",
                            self.remote,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    if let Some(reply) = self.adapter.handle_frame(&data, self.remote, arrival) {
                        if let Err(e) = self.send(&reply).await {
                            error!("Failed to reply to {}: {}", self.remote, e);
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", self.remote);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", self.remote, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", self.remote);
                    break;
                }
            }
        }
    }

    async fn send(&mut self, reply: &WireMessage) -> Result<()> {
        let data = reply.to_binary()?;
        self.ws
            .send(Message::Binary(data.into()))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }
}
