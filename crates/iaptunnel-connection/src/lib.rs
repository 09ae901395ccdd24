//! Relay connection engine
//!
//! A [`RelayConnection`] turns "connect me to instance X, port P" into a
//! reliable, authenticated byte stream over a [`TransportConnector`]. It owns
//! the handshake, DATA/ACK sequencing, the bounded retransmit buffer and
//! transparent resume after transport loss.
//!
//! [`TunnelProbe`] reuses the handshake to check reachability and
//! authorization without exchanging application data.
//!
//! [`TransportConnector`]: iaptunnel_transport::TransportConnector

pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod probe;
pub mod reconnect;

pub use config::RelayConfig;
pub use connection::{ConnectionHandle, ConnectionState, RelayConnection, RelayReader, RelayWriter};
pub use credential::{CredentialSource, RelayCredential, SharedCredential, StaticCredential};
pub use error::RelayError;
pub use probe::TunnelProbe;
pub use reconnect::{ReconnectConfig, ReconnectError, Reconnector};

/// Tracing target for audit-grade lifecycle events
pub const AUDIT_TARGET: &str = "iaptunnel::audit";
