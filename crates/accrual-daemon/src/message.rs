//! Heartbeat protocol messages.
//!
//! Every message is JSON sent as a binary WebSocket frame (UTF-8 bytes),
//! tagged by a `"type"` field.

use accrual_core::{PeerHealth, PeerStatus, Tags};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum message size (64KB). Heartbeats and health queries are tiny;
/// anything larger is dropped before parsing.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Message exceeds max size ({size} > {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Request for peers whose suspicion is below `threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthQuery {
    /// Exclusive upper bound on suspicion
    pub threshold: f64,

    /// Maximum number of peers to return
    pub limit: u32,

    /// Only peers whose `service` tag equals this label (all peers if absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// One peer's detector statistics, as carried by `statusReport`.
///
/// `mean`, `stdev` and `suspicion` may be `NaN` (too few intervals) or
/// `Infinity` (saturated suspicion); those travel as JSON strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerReport {
    pub identity: String,

    #[serde(default)]
    pub tags: Tags,

    /// Interval mean, in the daemon's time unit
    #[serde(with = "non_finite")]
    pub mean: f64,

    /// Interval standard deviation, in the daemon's time unit
    #[serde(with = "non_finite")]
    pub stdev: f64,

    /// Intervals currently in the window
    pub samples: usize,

    #[serde(with = "non_finite")]
    pub suspicion: f64,
}

impl From<PeerStatus> for PeerReport {
    fn from(status: PeerStatus) -> Self {
        Self {
            identity: status.identity,
            tags: status.tags,
            mean: status.mean,
            stdev: status.stdev,
            samples: status.samples,
            suspicion: status.suspicion,
        }
    }
}

/// Registry-wide counters plus every tracked peer, sorted by identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Peers currently tracked
    pub active_peers: usize,

    /// Peers reaped since the daemon started
    pub reaped_total: u64,

    pub peers: Vec<PeerReport>,
}

/// JSON numbers cannot hold `NaN` or infinities; spell those as strings.
mod non_finite {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    const NAN: &str = "NaN";
    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str(NAN)
        } else if *value == f64::INFINITY {
            serializer.serialize_str(INFINITY)
        } else if *value == f64::NEG_INFINITY {
            serializer.serialize_str(NEG_INFINITY)
        } else {
            serializer.serialize_f64(*value)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                NAN => Ok(f64::NAN),
                INFINITY => Ok(f64::INFINITY),
                NEG_INFINITY => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("expected a number, got {:?}", other))),
            },
        }
    }
}

/// Messages exchanged between heartbeat clients and the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireMessage {
    /// Liveness signal. The daemon does not reply.
    Beat {
        /// Client-chosen identity, required by the token identity strategy
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,

        /// Metadata attached to the peer on its first heartbeat
        #[serde(default)]
        tags: Tags,
    },

    HealthQuery(HealthQuery),

    /// Reply to `HealthQuery`, sorted by ascending suspicion.
    HealthReport { statuses: Vec<PeerHealth> },

    /// Request for the registry's counters and per-peer statistics.
    StatusQuery,

    StatusReport(StatusReport),

    /// Sent back for frames the daemon rejects.
    Error { message: String },
}

impl WireMessage {
    pub fn beat(token: Option<String>, tags: Tags) -> Self {
        WireMessage::Beat { token, tags }
    }

    pub fn error(message: impl Into<String>) -> Self {
        WireMessage::Error {
            message: message.into(),
        }
    }

    /// Serialize to UTF-8 JSON bytes for sending as binary WebSocket frame.
    pub fn to_binary(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a message from a binary frame, enforcing `MAX_MESSAGE_SIZE`.
    pub fn from_binary(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(MessageError::TooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(serde_json::from_slice(data)?)
    }
}
