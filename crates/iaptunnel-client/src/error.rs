//! Tunnel errors

use iaptunnel_connection::RelayError;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to bind local listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Listen address {0} is not a loopback address")]
    NonLoopbackListenAddress(IpAddr),

    #[error("Tunnel service is shut down")]
    ServiceShutDown,

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
