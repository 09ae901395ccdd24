//! Relay protocol definitions
//!
//! This crate defines the destination types, the wire frames and the frame
//! codec spoken between the tunnel client and the relay endpoint.
//!
//! Every frame starts with a big-endian `u16` tag followed by a tag-specific
//! body. Sequence numbers and acknowledgements are cumulative byte counts of
//! the stream in one direction.

pub mod codec;
pub mod destination;
pub mod frame;

pub use codec::{CodecError, FrameCodec};
pub use destination::{InstanceLocator, LocatorParseError, TunnelDestination};
pub use frame::{BearerToken, CloseCode, Frame, FrameTag};

/// Maximum payload carried by a single DATA frame (64KB)
pub const MAX_DATA_FRAME_SIZE: usize = 64 * 1024;

/// Default payload size used when chunking outbound data (16KB)
pub const DEFAULT_DATA_FRAME_SIZE: usize = 16 * 1024;

/// Maximum size of a length-prefixed string or SID field (16MB)
pub const MAX_FIELD_SIZE: usize = 16 * 1024 * 1024;
