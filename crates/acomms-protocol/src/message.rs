//! Messages exchanged with the application and the modem driver

use serde::{Deserialize, Serialize};

use crate::types::{ModemId, StreamKey};

/// An application message waiting to be queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Stream the message belongs to
    pub key: StreamKey,

    /// Destination modem
    pub dest: ModemId,

    /// Encoded payload (opaque to the queue layer)
    pub payload: Vec<u8>,
}

impl OutgoingMessage {
    pub fn new(key: StreamKey, dest: ModemId, payload: impl Into<Vec<u8>>) -> Self {
        OutgoingMessage {
            key,
            dest,
            payload: payload.into(),
        }
    }
}

/// A modem driver asking for data to transmit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    /// Maximum number of bytes the frame may hold
    pub max_bytes: usize,

    /// Destination the driver wants to address, if it already decided one
    pub dest: Option<ModemId>,

    /// Modem frame number the data will be sent in
    pub frame_number: u32,

    /// First frame of a new packet; resets the packet's destination and ack
    pub first_user_frame: bool,
}

impl DataRequest {
    /// Request for the first frame of a packet with no destination preference
    pub fn new(max_bytes: usize, frame_number: u32) -> Self {
        DataRequest {
            max_bytes,
            dest: None,
            frame_number,
            first_user_frame: true,
        }
    }

    /// Restrict the packet to a destination
    pub fn with_dest(mut self, dest: ModemId) -> Self {
        self.dest = Some(dest);
        self
    }

    /// Mark this request as a continuation frame of the current packet
    pub fn continuation(mut self) -> Self {
        self.first_user_frame = false;
        self
    }
}

/// One frame handed to or received from the modem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemTransmission {
    pub src: ModemId,
    pub dest: ModemId,

    /// Whether the sender expects an acknowledgment for this frame
    pub ack_requested: bool,

    pub frame_number: u32,

    /// Frame bytes (stitched or legacy)
    pub data: Vec<u8>,
}

impl ModemTransmission {
    /// Hex dump of the frame bytes for diagnostics
    pub fn data_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

/// Acknowledgment of a frame reported by the modem driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemAck {
    /// Modem that acknowledged the frame
    pub src: ModemId,

    /// Modem that sent the acknowledged frame
    pub dest: ModemId,

    pub frame_number: u32,
}
