//! Relay connection configuration

use iaptunnel_proto::{DEFAULT_DATA_FRAME_SIZE, MAX_DATA_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::RelayError;
use crate::reconnect::ReconnectConfig;

/// Tunables for a single relay connection
///
/// Durations are (de)serialized as integer milliseconds so the struct can be
/// embedded in YAML config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bound on transport setup plus CONNECT/RESUME handshake
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,

    /// Unacknowledged outbound bytes kept for retransmission
    pub retransmit_buffer_capacity: usize,

    /// Largest DATA payload this side sends
    pub max_data_frame_size: usize,

    /// Send an ACK at least this often while bytes are unacknowledged
    #[serde(with = "duration_ms", rename = "ack_interval_ms")]
    pub ack_interval: Duration,

    /// Send an ACK as soon as this many bytes are unacknowledged
    pub ack_threshold: usize,

    /// Bound on flushing and sending CLOSE during shutdown
    #[serde(with = "duration_ms", rename = "close_timeout_ms")]
    pub close_timeout: Duration,

    pub reconnect: ReconnectConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            retransmit_buffer_capacity: 1024 * 1024,
            max_data_frame_size: DEFAULT_DATA_FRAME_SIZE,
            ack_interval: Duration::from_millis(500),
            ack_threshold: 64 * 1024,
            close_timeout: Duration::from_secs(2),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retransmit_buffer_capacity(mut self, capacity: usize) -> Self {
        self.retransmit_buffer_capacity = capacity;
        self
    }

    pub fn with_max_data_frame_size(mut self, size: usize) -> Self {
        self.max_data_frame_size = size;
        self
    }

    pub fn with_ack_interval(mut self, interval: Duration) -> Self {
        self.ack_interval = interval;
        self
    }

    pub fn with_ack_threshold(mut self, threshold: usize) -> Self {
        self.ack_threshold = threshold;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        let invalid = |msg: String| Err(RelayError::InvalidConfig(msg));

        if self.max_data_frame_size == 0 || self.max_data_frame_size > MAX_DATA_FRAME_SIZE {
            return invalid(format!(
                "max_data_frame_size must be between 1 and {}",
                MAX_DATA_FRAME_SIZE
            ));
        }
        if self.retransmit_buffer_capacity < self.max_data_frame_size {
            return invalid(
                "retransmit_buffer_capacity must hold at least one DATA frame".to_string(),
            );
        }
        if self.retransmit_buffer_capacity > tokio::sync::Semaphore::MAX_PERMITS {
            return invalid("retransmit_buffer_capacity is too large".to_string());
        }
        if self.ack_threshold == 0 {
            return invalid("ack_threshold must be positive".to_string());
        }
        if self.ack_interval.is_zero() {
            return invalid("ack_interval must be positive".to_string());
        }
        if self.reconnect.multiplier < 1.0 {
            return invalid("reconnect.multiplier must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return invalid("reconnect.jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

/// Serde adapter for durations stored as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
