//! Error types for protocol operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Empty frame")]
    EmptyFrame,

    #[error("Not a stitched frame (header byte {0:#04x})")]
    InvalidFrameHeader(u8),

    #[error("Frame truncated at offset {offset}: need {needed} bytes, {available} available")]
    FrameTruncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Piece at offset {offset} too short: {len} bytes")]
    PieceTooShort { offset: usize, len: usize },

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid stream key: {0}")]
    InvalidStreamKey(String),
}
