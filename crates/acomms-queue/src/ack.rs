//! Bookkeeping of frames awaiting acknowledgment

use acomms_protocol::StreamKey;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::queue::QueuedMessage;

/// A stitched message waiting for its frame to be acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    pub frame_number: u32,
    pub key: StreamKey,
    pub message: QueuedMessage,
    pub sent_at: DateTime<Utc>,
}

/// Frame number -> messages carried by that frame that require an ack
///
/// A frame can combine messages from several streams, so one frame number
/// maps to many entries.
#[derive(Debug, Clone, Default)]
pub struct AckWaitTable {
    frames: BTreeMap<u32, Vec<PendingAck>>,
}

impl AckWaitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message sent in a frame
    pub fn insert(&mut self, frame_number: u32, message: QueuedMessage, sent_at: DateTime<Utc>) {
        self.frames.entry(frame_number).or_default().push(PendingAck {
            frame_number,
            key: message.key,
            message,
            sent_at,
        });
    }

    /// Remove and return every entry of a frame
    pub fn take(&mut self, frame_number: u32) -> Vec<PendingAck> {
        self.frames.remove(&frame_number).unwrap_or_default()
    }

    /// Remove and return every entry sent before `cutoff`
    pub fn take_sent_before(&mut self, cutoff: DateTime<Utc>) -> Vec<PendingAck> {
        let mut expired = Vec::new();

        self.frames.retain(|_, entries| {
            let (old, fresh): (Vec<_>, Vec<_>) =
                entries.drain(..).partition(|e| e.sent_at < cutoff);
            expired.extend(old);
            *entries = fresh;
            !entries.is_empty()
        });

        expired
    }

    pub fn contains_frame(&self, frame_number: u32) -> bool {
        self.frames.contains_key(&frame_number)
    }

    /// Total number of pending messages
    pub fn len(&self) -> usize {
        self.frames.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingAck> {
        self.frames.values().flatten()
    }
}
