//! Acoustic Communications Protocol Module
//!
//! This module defines the wire-level types shared by the queue manager and
//! the modem driver: modem addresses, stream keys, the driver boundary
//! messages and the stitched frame format.

pub mod error;
pub mod frame;
pub mod message;
pub mod types;

pub use error::{ProtocolError, Result};
pub use frame::{FrameBuilder, FrameReader, Piece};
pub use message::{DataRequest, ModemAck, ModemTransmission, OutgoingMessage};
pub use types::{ModemId, StreamKey, StreamKind};
