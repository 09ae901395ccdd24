//! TLS transport implementation using tokio-rustls
//!
//! Connects to the relay endpoint over TCP and performs a TLS handshake,
//! presenting the caller's client certificate when one is supplied (mutual
//! TLS for enrolled devices).

pub mod config;
pub mod connector;

pub use config::TlsConfig;
pub use connector::TlsConnector;
