//! Tunnel client library
//!
//! Exposes relay connections to local callers as ordinary loopback sockets.
//! A [`TunnelService`] creates [`Tunnel`]s; each tunnel listens on loopback,
//! checks every accepted caller against its [`RelayPolicy`] and bridges
//! allowed callers to a fresh relay connection.

pub mod error;
pub mod peer;
pub mod policy;
pub mod service;
pub mod tunnel;

pub use error::TunnelError;
pub use peer::{LocalPeer, PeerParseError, PeerResolver, ProcfsPeerResolver};
pub use policy::{PolicyDecision, RelayPolicy};
pub use service::TunnelService;
pub use tunnel::{Tunnel, TunnelEvent, TunnelId};

pub use iaptunnel_connection::{
    CredentialSource, RelayConfig, RelayCredential, RelayError, SharedCredential,
    StaticCredential,
};
pub use iaptunnel_proto::{InstanceLocator, TunnelDestination};
