//! Queue manager error types

use acomms_protocol::{ModemId, StreamKey};
use thiserror::Error;

/// Queue-specific errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("No queue configured for stream {0}")]
    UnknownStream(StreamKey),

    #[error("Stream {0} configured more than once")]
    DuplicateStream(StreamKey),

    #[error("Invalid configuration for stream {key}: {reason}")]
    InvalidConfig { key: StreamKey, reason: String },

    #[error("Invalid manager configuration: {0}")]
    InvalidManagerConfig(String),

    #[error("Modem id is fixed at {current}, configuration requested {requested}")]
    ModemIdChanged { current: ModemId, requested: ModemId },

    #[error("Payload for stream {key} too large: {size} bytes (max: {max})")]
    PayloadTooLarge {
        key: StreamKey,
        size: usize,
        max: usize,
    },

    #[error("Payload for legacy stream {0} must start with its CCL id")]
    InvalidCclPayload(StreamKey),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] acomms_protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;
