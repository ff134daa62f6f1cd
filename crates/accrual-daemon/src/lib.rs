//! accrual-daemon library: heartbeat transport around accrual-core.
//!
//! Exposes the server, client and protocol modules so the binary and the
//! integration tests share one implementation.

pub mod adapter;
pub mod client;
pub mod config;
pub mod connection;
pub mod message;
pub mod server;

// Re-export key types for convenience
pub use adapter::{AdapterError, IngestionAdapter};
pub use client::{HeartbeatClient, ReconnectConfig, query_health, query_status};
pub use config::{DaemonConfig, IdentityStrategy};
pub use message::{HealthQuery, MAX_MESSAGE_SIZE, PeerReport, StatusReport, WireMessage};
pub use server::HeartbeatServer;
