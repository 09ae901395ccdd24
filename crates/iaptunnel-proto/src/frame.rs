//! Protocol frame types

use crate::destination::TunnelDestination;
use bytes::Bytes;
use std::fmt;

/// Frame tag, the first two bytes of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameTag {
    Connect = 0x0001,
    ConnectSuccessSid = 0x0002,
    ConnectFail = 0x0003,
    Resume = 0x0004,
    ResumeSuccessAck = 0x0005,
    Data = 0x0006,
    Ack = 0x0007,
    Close = 0x0008,
}

impl TryFrom<u16> for FrameTag {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(FrameTag::Connect),
            0x0002 => Ok(FrameTag::ConnectSuccessSid),
            0x0003 => Ok(FrameTag::ConnectFail),
            0x0004 => Ok(FrameTag::Resume),
            0x0005 => Ok(FrameTag::ResumeSuccessAck),
            0x0006 => Ok(FrameTag::Data),
            0x0007 => Ok(FrameTag::Ack),
            0x0008 => Ok(FrameTag::Close),
            other => Err(other),
        }
    }
}

/// Close / rejection code carried by CONNECT_FAIL and CLOSE frames
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const ERROR_UNKNOWN: CloseCode = CloseCode(4000);
    pub const SID_UNKNOWN: CloseCode = CloseCode(4001);
    pub const SID_IN_USE: CloseCode = CloseCode(4002);
    pub const FAILED_TO_CONNECT_TO_BACKEND: CloseCode = CloseCode(4003);
    pub const REAUTHENTICATION_REQUIRED: CloseCode = CloseCode(4004);
    pub const BAD_ACK: CloseCode = CloseCode(4005);
    pub const INVALID_ACK: CloseCode = CloseCode(4006);
    pub const INVALID_TAG: CloseCode = CloseCode(4008);
    pub const INVALID_DATA: CloseCode = CloseCode(4013);
    pub const NOT_AUTHORIZED: CloseCode = CloseCode(4033);
    pub const LOOKUP_FAILED: CloseCode = CloseCode(4047);

    pub fn is_normal(&self) -> bool {
        *self == Self::NORMAL
    }

    /// Codes meaning the credential, certificate or destination was refused
    pub fn is_authorization_failure(&self) -> bool {
        matches!(
            *self,
            Self::NOT_AUTHORIZED
                | Self::LOOKUP_FAILED
                | Self::FAILED_TO_CONNECT_TO_BACKEND
                | Self::REAUTHENTICATION_REQUIRED
        )
    }

    /// Codes meaning the session can no longer be resumed
    pub fn is_session_expired(&self) -> bool {
        matches!(*self, Self::SID_UNKNOWN | Self::SID_IN_USE)
    }

    pub fn name(&self) -> &'static str {
        match *self {
            Self::NORMAL => "NORMAL",
            Self::ERROR_UNKNOWN => "ERROR_UNKNOWN",
            Self::SID_UNKNOWN => "SID_UNKNOWN",
            Self::SID_IN_USE => "SID_IN_USE",
            Self::FAILED_TO_CONNECT_TO_BACKEND => "FAILED_TO_CONNECT_TO_BACKEND",
            Self::REAUTHENTICATION_REQUIRED => "REAUTHENTICATION_REQUIRED",
            Self::BAD_ACK => "BAD_ACK",
            Self::INVALID_ACK => "INVALID_ACK",
            Self::INVALID_TAG => "INVALID_TAG",
            Self::INVALID_DATA => "INVALID_DATA",
            Self::NOT_AUTHORIZED => "NOT_AUTHORIZED",
            Self::LOOKUP_FAILED => "LOOKUP_FAILED",
            _ => "UNRECOGNIZED",
        }
    }
}

impl fmt::Debug for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// Bearer token sent in CONNECT frames
///
/// Debug output is redacted so frames can be traced safely.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

/// A relay protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client opens a new session to a destination
    Connect {
        destination: TunnelDestination,
        token: BearerToken,
    },
    /// Relay accepted the session and assigned a session id
    ConnectSuccessSid { sid: Bytes },
    /// Relay refused a CONNECT or RESUME
    ConnectFail { code: CloseCode, reason: String },
    /// Client re-attaches to an existing session after a transport loss
    Resume { sid: Bytes, received: u64 },
    /// Relay accepted the resume and reports how many bytes it has received
    ResumeSuccessAck { ack: u64 },
    /// Stream payload; `seq` is the cumulative byte count including this payload
    Data { seq: u64, payload: Bytes },
    /// Cumulative acknowledgement of received stream bytes
    Ack { ack: u64 },
    /// Orderly or error shutdown of the session
    Close { code: CloseCode, reason: String },
}

impl Frame {
    pub fn tag(&self) -> FrameTag {
        match self {
            Frame::Connect { .. } => FrameTag::Connect,
            Frame::ConnectSuccessSid { .. } => FrameTag::ConnectSuccessSid,
            Frame::ConnectFail { .. } => FrameTag::ConnectFail,
            Frame::Resume { .. } => FrameTag::Resume,
            Frame::ResumeSuccessAck { .. } => FrameTag::ResumeSuccessAck,
            Frame::Data { .. } => FrameTag::Data,
            Frame::Ack { .. } => FrameTag::Ack,
            Frame::Close { .. } => FrameTag::Close,
        }
    }

    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Frame::Close {
            code,
            reason: reason.into(),
        }
    }
}
