//! Translation between wire messages and registry operations.
//!
//! The adapter owns identity extraction and reply construction. It never
//! reads the clock itself: connections stamp each frame's arrival when it is
//! read and pass that instant in.

use crate::config::IdentityStrategy;
use crate::message::{HealthQuery, MessageError, PeerReport, StatusReport, WireMessage};
use accrual_core::{IngestOutcome, PeerHealth, PeerRegistry, RegistryError, Tags};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};
use web_time::Instant;

/// Tag consulted by labelled health queries.
pub const SERVICE_TAG: &str = "service";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Heartbeat is missing a token")]
    MissingToken,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("Unexpected {0} message from client")]
    Unexpected(&'static str),
}

/// Feeds heartbeats into a [`PeerRegistry`] and answers health queries.
pub struct IngestionAdapter {
    registry: Arc<PeerRegistry>,
    strategy: IdentityStrategy,
}

impl IngestionAdapter {
    pub fn new(registry: Arc<PeerRegistry>, strategy: IdentityStrategy) -> Self {
        Self { registry, strategy }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn strategy(&self) -> IdentityStrategy {
        self.strategy
    }

    /// Resolve the identity a heartbeat counts towards.
    pub fn identity_for(&self, token: Option<&str>, remote: SocketAddr) -> Result<String, AdapterError> {
        match self.strategy {
            IdentityStrategy::Token => match token {
                Some(token) if !token.is_empty() => Ok(token.to_string()),
                _ => Err(AdapterError::MissingToken),
            },
            IdentityStrategy::TransportAddress => Ok(remote.to_string()),
        }
    }

    /// Record one heartbeat that arrived at `arrival`.
    pub fn ingest_beat(
        &self,
        token: Option<&str>,
        tags: Tags,
        remote: SocketAddr,
        arrival: Instant,
    ) -> Result<IngestOutcome, AdapterError> {
        let identity = self.identity_for(token, remote)?;
        let outcome = self.registry.ingest(&identity, arrival, tags)?;
        trace!("Heartbeat from {} ({:?})", identity, outcome);
        Ok(outcome)
    }

    /// Healthy peers for `query` as seen at `at`, most trusted first.
    pub fn health_report(&self, query: &HealthQuery, at: Instant) -> Vec<PeerHealth> {
        let limit = query.limit as usize;
        let mut statuses = match query.label.as_deref() {
            Some(label) => self
                .registry
                .healthy_peers_where(at, query.threshold, limit, |_, tags| {
                    tags.get(SERVICE_TAG).map(String::as_str) == Some(label)
                }),
            None => self.registry.healthy_peers(at, query.threshold, limit),
        };
        statuses.sort_by(|a, b| a.suspicion.total_cmp(&b.suspicion));
        statuses
    }

    /// Counters and per-peer statistics as seen at `at`, sorted by identity.
    pub fn status_report(&self, at: Instant) -> StatusReport {
        let mut peers: Vec<PeerReport> = self
            .registry
            .snapshot(at)
            .into_iter()
            .map(PeerReport::from)
            .collect();
        peers.sort_by(|a, b| a.identity.cmp(&b.identity));
        StatusReport {
            active_peers: peers.len(),
            reaped_total: self.registry.reaped_total(),
            peers,
        }
    }

    /// Handle one inbound frame, returning the reply to send, if any.
    ///
    /// Beats are silent on success. Every rejected frame gets an `error`
    /// reply; the connection stays open.
    pub fn handle_frame(&self, data: &[u8], remote: SocketAddr, arrival: Instant) -> Option<WireMessage> {
        match self.dispatch(data, remote, arrival) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Rejected frame from {}: {}", remote, e);
                Some(WireMessage::error(e.to_string()))
            }
        }
    }

    fn dispatch(
        &self,
        data: &[u8],
        remote: SocketAddr,
        arrival: Instant,
    ) -> Result<Option<WireMessage>, AdapterError> {
        match WireMessage::from_binary(data)? {
            WireMessage::Beat { token, tags } => {
                self.ingest_beat(token.as_deref(), tags, remote, arrival)?;
                Ok(None)
            }
            WireMessage::HealthQuery(query) => {
                let statuses = self.health_report(&query, arrival);
                debug!(
                    "Health query from {} (threshold {}, limit {}, label {:?}): {} peer(s)",
                    remote,
                    query.threshold,
                    query.limit,
                    query.label,
                    statuses.len()
                );
                Ok(Some(WireMessage::HealthReport { statuses }))
            }
            WireMessage::StatusQuery => {
                let report = self.status_report(arrival);
                debug!(
                    "Status query from {}: {} active, {} reaped",
                    remote, report.active_peers, report.reaped_total
                );
                Ok(Some(WireMessage::StatusReport(report)))
            }
            WireMessage::HealthReport { .. } => Err(AdapterError::Unexpected("healthReport")),
            WireMessage::StatusReport(_) => Err(AdapterError::Unexpected("statusReport")),
            WireMessage::Error { .. } => Err(AdapterError::Unexpected("error")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accrual_core::DetectorConfig;
    use std::time::Duration;

    fn remote() -> SocketAddr {
        "10.0.0.7:51234".parse().unwrap()
    }

    fn adapter(strategy: IdentityStrategy) -> IngestionAdapter {
        let registry = Arc::new(PeerRegistry::new(&DetectorConfig::default()));
        IngestionAdapter::new(registry, strategy)
    }

    fn beat_frame(token: Option<&str>, service: Option<&str>) -> Vec<u8> {
        let mut tags = Tags::new();
        if let Some(service) = service {
            tags.insert(SERVICE_TAG.into(), service.into());
        }
        WireMessage::beat(token.map(String::from), tags).to_binary().unwrap()
    }

    fn query_frame(threshold: f64, limit: u32, label: Option<&str>) -> Vec<u8> {
        WireMessage::HealthQuery(HealthQuery {
            threshold,
            limit,
            label: label.map(String::from),
        })
        .to_binary()
        .unwrap()
    }

    /// Beats 90/110 ms apart; returns the last arrival.
    fn beat_steadily(adapter: &IngestionAdapter, token: &str, service: Option<&str>, start: Instant) -> Instant {
        let mut t = start;
        for i in 0..20 {
            if i > 0 {
                t += Duration::from_millis(if i % 2 == 0 { 90 } else { 110 });
            }
            assert!(adapter.handle_frame(&beat_frame(Some(token), service), remote(), t).is_none());
        }
        t
    }

    // ==================== Identity ====================

    #[test]
    fn test_token_strategy_uses_token() {
        let adapter = adapter(IdentityStrategy::Token);
        assert_eq!(adapter.identity_for(Some("abc"), remote()).unwrap(), "abc");
    }

    #[test]
    fn test_token_strategy_rejects_missing_token() {
        let adapter = adapter(IdentityStrategy::Token);
        assert!(matches!(adapter.identity_for(None, remote()), Err(AdapterError::MissingToken)));
        assert!(matches!(adapter.identity_for(Some(""), remote()), Err(AdapterError::MissingToken)));
    }

    #[test]
    fn test_transport_strategy_ignores_token() {
        let adapter = adapter(IdentityStrategy::TransportAddress);
        assert_eq!(adapter.identity_for(Some("abc"), remote()).unwrap(), "10.0.0.7:51234");
        assert_eq!(adapter.identity_for(None, remote()).unwrap(), "10.0.0.7:51234");
    }

    // ==================== Frames ====================

    #[test]
    fn test_beat_registers_peer() {
        let adapter = adapter(IdentityStrategy::Token);
        let reply = adapter.handle_frame(&beat_frame(Some("p1"), None), remote(), Instant::now());

        assert!(reply.is_none());
        assert!(adapter.registry().contains("p1"));
    }

    #[test]
    fn test_beat_without_token_gets_error_reply() {
        let adapter = adapter(IdentityStrategy::Token);
        let reply = adapter.handle_frame(&beat_frame(None, None), remote(), Instant::now());

        assert!(matches!(reply, Some(WireMessage::Error { .. })));
        assert!(adapter.registry().is_empty());
    }

    #[test]
    fn test_malformed_frame_gets_error_reply() {
        let adapter = adapter(IdentityStrategy::Token);
        let reply = adapter.handle_frame(b"{ nope", remote(), Instant::now());
        assert!(matches!(reply, Some(WireMessage::Error { .. })));
    }

    #[test]
    fn test_server_only_message_rejected() {
        let adapter = adapter(IdentityStrategy::Token);
        let frame = WireMessage::HealthReport { statuses: vec![] }.to_binary().unwrap();
        match adapter.handle_frame(&frame, remote(), Instant::now()) {
            Some(WireMessage::Error { message }) => assert!(message.contains("healthReport")),
            other => panic!("expected error reply, got {:?}", other),
        }
    }

    // ==================== Health queries ====================

    #[test]
    fn test_health_query_sorted_ascending() {
        let adapter = adapter(IdentityStrategy::Token);
        let t0 = Instant::now();
        let last_a = beat_steadily(&adapter, "a", None, t0);
        // "b" stops beating 50 ms before "a" does.
        let last_b = beat_steadily(&adapter, "b", None, t0 - Duration::from_millis(50));
        assert!(last_b < last_a);

        let at = last_a + Duration::from_millis(60);
        let reply = adapter.handle_frame(&query_frame(8.0, 10, None), remote(), at);
        let Some(WireMessage::HealthReport { statuses }) = reply else {
            panic!("expected health report");
        };

        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].identity, "a");
        assert_eq!(statuses[1].identity, "b");
        assert!(statuses[0].suspicion <= statuses[1].suspicion);
    }

    #[test]
    fn test_health_query_label_filter() {
        let adapter = adapter(IdentityStrategy::Token);
        let t0 = Instant::now();
        beat_steadily(&adapter, "a", Some("billing"), t0);
        let last = beat_steadily(&adapter, "b", Some("search"), t0);

        let query = HealthQuery {
            threshold: 8.0,
            limit: 10,
            label: Some("search".into()),
        };
        let statuses = adapter.health_report(&query, last);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].identity, "b");
    }

    #[test]
    fn test_health_query_excludes_new_peers() {
        let adapter = adapter(IdentityStrategy::Token);
        let t0 = Instant::now();
        adapter.handle_frame(&beat_frame(Some("new"), None), remote(), t0);

        let query = HealthQuery {
            threshold: 8.0,
            limit: 10,
            label: None,
        };
        assert!(adapter.health_report(&query, t0).is_empty());
    }

    // ==================== Status ====================

    #[test]
    fn test_status_report_lists_every_peer() {
        let adapter = adapter(IdentityStrategy::Token);
        let t0 = Instant::now();
        let last = beat_steadily(&adapter, "b", Some("search"), t0);
        adapter.handle_frame(&beat_frame(Some("a"), None), remote(), last);

        let frame = WireMessage::StatusQuery.to_binary().unwrap();
        let Some(WireMessage::StatusReport(report)) = adapter.handle_frame(&frame, remote(), last) else {
            panic!("expected status report");
        };

        assert_eq!(report.active_peers, 2);
        assert_eq!(report.reaped_total, 0);
        assert_eq!(report.peers[0].identity, "a");
        assert_eq!(report.peers[0].samples, 0);
        assert!(report.peers[0].suspicion.is_nan());

        let b = &report.peers[1];
        assert_eq!(b.identity, "b");
        assert_eq!(b.samples, 19);
        assert!((b.mean - 100.0).abs() < 2.0);
        assert!(b.stdev > 0.0);
        assert_eq!(b.tags.get(SERVICE_TAG).map(String::as_str), Some("search"));
    }

    #[test]
    fn test_status_report_counts_reaped_peers() {
        let adapter = adapter(IdentityStrategy::Token);
        let t0 = Instant::now();
        let last = beat_steadily(&adapter, "gone", None, t0);

        let now = last + Duration::from_secs(3600);
        let registry = adapter.registry();
        assert_eq!(registry.sweep(now, registry.grace_window()).reaped.len(), 1);

        let report = adapter.status_report(now);
        assert_eq!(report.active_peers, 0);
        assert_eq!(report.reaped_total, 1);
        assert!(report.peers.is_empty());
    }

    #[test]
    fn test_status_report_from_client_rejected() {
        let adapter = adapter(IdentityStrategy::Token);
        let frame = WireMessage::StatusReport(StatusReport {
            active_peers: 0,
            reaped_total: 0,
            peers: vec![],
        })
        .to_binary()
        .unwrap();
        match adapter.handle_frame(&frame, remote(), Instant::now()) {
            Some(WireMessage::Error { message }) => assert!(message.contains("statusReport")),
            other => panic!("expected error reply, got {:?}", other),
        }
    }
}
