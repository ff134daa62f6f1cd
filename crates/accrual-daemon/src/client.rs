//! Heartbeat client.
//!
//! Sends a beat on a fixed interval over a long-lived WebSocket and
//! reconnects with exponential backoff whenever the connection drops.
//! Also provides the one-shot `query_health` and `query_status` requests
//! used by the CLI.

use crate::message::{HealthQuery, StatusReport, WireMessage};
use accrual_core::{PeerHealth, Tags};
use anyhow::{Context, Result, anyhow, bail};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

/// How long one-shot queries wait for the reply.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of consecutive failed attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: None, // Unlimited
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Periodic heartbeat sender for one identity.
#[derive(Debug, Clone)]
pub struct HeartbeatClient {
    /// Server URL, e.g. `ws://127.0.0.1:8080`
    server_url: String,
    token: Option<String>,
    tags: Tags,
    interval: Duration,
    reconnect: ReconnectConfig,
}

impl HeartbeatClient {
    /// Fails if `interval` is zero.
    pub fn new(
        server_url: impl Into<String>,
        token: Option<String>,
        tags: Tags,
        interval: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            bail!("Heartbeat interval must be non-zero");
        }
        Ok(Self {
            server_url: server_url.into(),
            token,
            tags,
            interval,
            reconnect: ReconnectConfig::default(),
        })
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Send heartbeats until `shutdown` resolves.
    ///
    /// Fails only when `max_attempts` consecutive reconnects fail.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let mut attempts: u32 = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Heartbeat client shutting down");
                    return Ok(());
                }
                result = self.session(&mut attempts) => {
                    match result {
                        Ok(()) => info!("Server {} closed the connection", self.server_url),
                        Err(e) => warn!("Heartbeat session to {} failed: {:#}", self.server_url, e),
                    }
                }
            }

            attempts += 1;
            if self.reconnect.max_attempts.is_some_and(|max| attempts > max) {
                bail!(
                    "Giving up on {} after {} attempt(s)",
                    self.server_url,
                    attempts - 1
                );
            }

            let delay = calculate_backoff(attempts, &self.reconnect);
            info!(
                "Reconnecting to {} in {:?} (attempt {})",
                self.server_url, delay, attempts
            );
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Heartbeat client shutting down");
                    return Ok(());
                }
                _ = sleep(delay) => {}
            }
        }
    }

    /// One connection's worth of heartbeats. Resets `attempts` once connected.
    async fn session(&self, attempts: &mut u32) -> Result<()> {
        let (ws, _) = connect_async(self.server_url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", self.server_url))?;
        *attempts = 0;
        info!("Connected to {}", self.server_url);

        let (mut write, mut read) = ws.split();
        let beat = WireMessage::beat(self.token.clone(), self.tags.clone()).to_binary()?;
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    write
                        .send(Message::Binary(beat.clone().into()))
                        .await
                        .map_err(|e| anyhow!("Failed to send heartbeat: {}", e))?;
                    trace!("Sent heartbeat to {}", self.server_url);
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => log_server_message(&data),
                        Some(Ok(Message::Text(text))) => log_server_message(text.as_bytes()),
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }
}

fn log_server_message(data: &[u8]) {
    match WireMessage::from_binary(data) {
        Ok(WireMessage::Error { message }) => warn!("Server rejected heartbeat: {}", message),
        Ok(other) => debug!("Ignoring unexpected message from server: {:?}", other),
        Err(e) => warn!("Unreadable message from server: {}", e),
    }
}

/// Ask the server at `server_url` for its healthy peers.
pub async fn query_health(server_url: &str, query: HealthQuery) -> Result<Vec<PeerHealth>> {
    match request(server_url, &WireMessage::HealthQuery(query)).await? {
        WireMessage::HealthReport { statuses } => Ok(statuses),
        WireMessage::Error { message } => bail!("Server rejected health query: {}", message),
        other => bail!("Unexpected reply to health query: {:?}", other),
    }
}

/// Ask the server at `server_url` for its counters and per-peer statistics.
pub async fn query_status(server_url: &str) -> Result<StatusReport> {
    match request(server_url, &WireMessage::StatusQuery).await? {
        WireMessage::StatusReport(report) => Ok(report),
        WireMessage::Error { message } => bail!("Server rejected status query: {}", message),
        other => bail!("Unexpected reply to status query: {:?}", other),
    }
}

/// Send one message on a fresh connection and wait for the first reply.
async fn request(server_url: &str, message: &WireMessage) -> Result<WireMessage> {
    let (mut ws, _) = connect_async(server_url)
        .await
        .with_context(|| format!("Failed to connect to {}", server_url))?;

    ws.send(Message::Binary(message.to_binary()?.into()))
        .await
        .map_err(|e| anyhow!("Failed to send request: {}", e))?;

    let reply = timeout(QUERY_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Close(_))) | None => bail!("Connection closed before reply"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    })
    .await
    .context("Timed out waiting for reply")??;

    let _ = ws.close(None).await;
    Ok(WireMessage::from_binary(&reply)?)
}
