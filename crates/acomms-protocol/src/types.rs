//! Core protocol types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Address of a modem on the acoustic network
///
/// Modem ids are small integers assigned per vehicle/node. Id 0 is reserved
/// for broadcast.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModemId(u32);

impl ModemId {
    /// Broadcast address; frames sent here are never acknowledged
    pub const BROADCAST: ModemId = ModemId(0);

    /// Create a ModemId from its numeric value
    pub const fn new(id: u32) -> Self {
        ModemId(id)
    }

    /// Get the numeric value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl From<u32> for ModemId {
    fn from(id: u32) -> Self {
        ModemId(id)
    }
}

impl fmt::Debug for ModemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModemId({})", self.0)
    }
}

impl fmt::Display for ModemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Framing family of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Stitchable messages carried as pieces of a stitched frame
    Dccl,
    /// Legacy single-frame messages; the first payload byte is the CCL id
    Ccl,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Dccl => write!(f, "dccl"),
            StreamKind::Ccl => write!(f, "ccl"),
        }
    }
}

/// Identifier of a logical message stream
///
/// Ordering is total (kind first, then id) so keys can index ordered maps and
/// break scheduling ties deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub kind: StreamKind,
    pub id: u16,
}

impl StreamKey {
    /// Key of a stitchable stream
    pub const fn dccl(id: u16) -> Self {
        StreamKey {
            kind: StreamKind::Dccl,
            id,
        }
    }

    /// Key of a legacy CCL stream
    pub const fn ccl(id: u8) -> Self {
        StreamKey {
            kind: StreamKind::Ccl,
            id: id as u16,
        }
    }

    pub fn is_ccl(&self) -> bool {
        self.kind == StreamKind::Ccl
    }

    /// Parse the `kind:id` form produced by `Display`
    pub fn parse(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidStreamKey(s.to_string()))?;
        let id: u16 = id
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidStreamKey(s.to_string()))?;

        match kind.trim() {
            "dccl" => Ok(StreamKey::dccl(id)),
            "ccl" => u8::try_from(id)
                .map(StreamKey::ccl)
                .map_err(|_| ProtocolError::InvalidStreamKey(s.to_string())),
            _ => Err(ProtocolError::InvalidStreamKey(s.to_string())),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
