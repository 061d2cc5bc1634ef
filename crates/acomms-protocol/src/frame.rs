//! Stitched frame format for the acoustic link
//!
//! Several queued messages ("pieces") are combined into one modem frame to
//! amortize the fixed per-frame cost of the link.
//!
//! Frame Structure (3-byte header + pieces, integers big-endian):
//! - Header byte (1 byte): 0x20, marks a stitched frame
//! - Declared length (2 bytes): total size of all pieces that follow
//! - Pieces (variable), each:
//!   - Length prefix (1 byte): size of stream id + payload
//!   - Stream id (2 bytes)
//!   - Payload (variable, 0-253 bytes)
//!
//! Modems commonly pad frames up to their slot size, so bytes beyond the
//! declared length are ignored by the reader.

use crate::error::{ProtocolError, Result};

/// First byte of every stitched frame
pub const STITCH_HEADER: u8 = 0x20;

/// Header byte + declared length
pub const FRAME_HEADER_SIZE: usize = 3;

/// Length prefix + stream id
pub const PIECE_OVERHEAD: usize = 3;

/// Largest payload a single piece can carry
pub const MAX_PIECE_PAYLOAD: usize = u8::MAX as usize - 2;

/// Largest declared length the header can express
pub const MAX_FRAME_BODY: usize = u16::MAX as usize;

/// Bytes a payload occupies once framed as a piece
pub fn piece_size(payload_len: usize) -> usize {
    PIECE_OVERHEAD + payload_len
}

/// Whether the bytes follow the stitched framing convention
pub fn is_stitched(data: &[u8]) -> bool {
    data.first() == Some(&STITCH_HEADER)
}

/// Incrementally assembles a stitched frame
///
/// The declared length is written as a placeholder and rewritten by
/// [`FrameBuilder::finish`] once every piece is known.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    bytes: Vec<u8>,
    pieces: usize,
}

impl FrameBuilder {
    /// Create an empty frame
    pub fn new() -> Self {
        let mut bytes = Vec::with_capacity(64);
        bytes.push(STITCH_HEADER);
        bytes.extend_from_slice(&0u16.to_be_bytes());

        FrameBuilder { bytes, pieces: 0 }
    }

    /// Append one piece
    pub fn push_piece(&mut self, stream_id: u16, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PIECE_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PIECE_PAYLOAD,
            });
        }

        let body = self.body_len() + piece_size(payload.len());
        if body > MAX_FRAME_BODY {
            return Err(ProtocolError::FrameTooLarge {
                size: body,
                max: MAX_FRAME_BODY,
            });
        }

        // Length prefix covers stream id + payload
        self.bytes.push((payload.len() + 2) as u8);
        self.bytes.extend_from_slice(&stream_id.to_be_bytes());
        self.bytes.extend_from_slice(payload);
        self.pieces += 1;

        Ok(())
    }

    /// Number of pieces appended so far
    pub fn piece_count(&self) -> usize {
        self.pieces
    }

    pub fn is_empty(&self) -> bool {
        self.pieces == 0
    }

    /// Current encoded size including the header
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    fn body_len(&self) -> usize {
        self.bytes.len() - FRAME_HEADER_SIZE
    }

    /// Rewrite the declared length and return the frame bytes
    pub fn finish(mut self) -> Vec<u8> {
        let declared = self.body_len() as u16;
        self.bytes[1..FRAME_HEADER_SIZE].copy_from_slice(&declared.to_be_bytes());
        self.bytes
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One message slice of a stitched frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece<'a> {
    pub stream_id: u16,
    pub payload: &'a [u8],
}

/// Iterates over the pieces of a stitched frame
///
/// Yields `Err` once when a piece is malformed and stops afterwards; the
/// pieces yielded before the error remain valid.
#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    body: &'a [u8],
    declared: usize,
    offset: usize,
    done: bool,
}

impl<'a> FrameReader<'a> {
    /// Validate the frame header and prepare to iterate its pieces
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let header = *data.first().ok_or(ProtocolError::EmptyFrame)?;
        if header != STITCH_HEADER {
            return Err(ProtocolError::InvalidFrameHeader(header));
        }

        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTruncated {
                offset: 0,
                needed: FRAME_HEADER_SIZE,
                available: data.len(),
            });
        }

        let declared = u16::from_be_bytes([data[1], data[2]]) as usize;
        let present = data.len() - FRAME_HEADER_SIZE;
        let end = FRAME_HEADER_SIZE + declared.min(present);

        Ok(FrameReader {
            body: &data[FRAME_HEADER_SIZE..end],
            declared,
            offset: 0,
            done: false,
        })
    }

    /// Total piece bytes announced by the header
    pub fn declared_len(&self) -> usize {
        self.declared
    }

    /// Whether fewer bytes arrived than the header announced
    pub fn is_truncated(&self) -> bool {
        self.body.len() < self.declared
    }

    fn fail(&mut self, err: ProtocolError) -> Option<Result<Piece<'a>>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = Result<Piece<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.body.len() {
            return None;
        }

        let frame_offset = FRAME_HEADER_SIZE + self.offset;
        let len = self.body[self.offset] as usize;
        if len < 2 {
            return self.fail(ProtocolError::PieceTooShort {
                offset: frame_offset,
                len,
            });
        }

        let start = self.offset + 1;
        let available = self.body.len() - start;
        if len > available {
            return self.fail(ProtocolError::FrameTruncated {
                offset: frame_offset,
                needed: len,
                available,
            });
        }

        let piece = &self.body[start..start + len];
        self.offset = start + len;

        Some(Ok(Piece {
            stream_id: u16::from_be_bytes([piece[0], piece[1]]),
            payload: &piece[2..],
        }))
    }
}
