//! Per-stream message queue

use acomms_protocol::{frame::piece_size, ModemId, StreamKey, StreamKind};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::fmt;

use crate::clock::elapsed_secs;
use crate::config::{OverflowPolicy, StreamConfig};

/// Identity of a pushed message, unique per queue manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Message with queueing metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: MessageId,

    pub key: StreamKey,

    /// When the message was pushed
    pub enqueued_at: DateTime<Utc>,

    pub src: ModemId,

    pub dest: ModemId,

    /// Encoded payload
    pub payload: Vec<u8>,

    /// Copied from the stream policy when the message was queued
    pub ack_required: bool,

    /// Times the message was put back after a presumed loss
    pub retries: u32,
}

impl QueuedMessage {
    /// Bytes the message occupies in a frame, excluding the frame header
    pub fn framed_size(&self) -> usize {
        match self.key.kind {
            StreamKind::Dccl => piece_size(self.payload.len()),
            StreamKind::Ccl => self.payload.len(),
        }
    }
}

/// A deadline past the representable range never arrives
fn outlived(message: &QueuedMessage, ttl: Duration, now: DateTime<Utc>) -> bool {
    message
        .enqueued_at
        .checked_add_signed(ttl)
        .is_some_and(|deadline| deadline < now)
}

/// Pending messages of one stream, oldest first
#[derive(Debug, Clone)]
pub struct Queue {
    cfg: StreamConfig,

    messages: VecDeque<QueuedMessage>,

    /// Last time a message of this stream was stitched
    last_served_at: Option<DateTime<Utc>>,
}

impl Queue {
    /// Create an empty queue
    pub fn new(cfg: StreamConfig) -> Self {
        Queue {
            cfg,
            messages: VecDeque::new(),
            last_served_at: None,
        }
    }

    pub fn key(&self) -> StreamKey {
        self.cfg.key
    }

    pub fn config(&self) -> &StreamConfig {
        &self.cfg
    }

    /// Append a message, applying the overflow policy
    ///
    /// Returns the message that did not survive, if any: the evicted oldest
    /// entry under `DropOldest`, the incoming one under `RejectNew`.
    pub fn enqueue(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        if self.messages.len() < self.cfg.max_depth {
            self.messages.push_back(message);
            return None;
        }

        match self.cfg.overflow {
            OverflowPolicy::DropOldest => {
                let evicted = self.messages.pop_front();
                self.messages.push_back(message);
                evicted
            }
            OverflowPolicy::RejectNew => Some(message),
        }
    }

    /// Put a message back ahead of every newer message of the stream
    ///
    /// Messages stay ordered by id, so a retried message goes in front of
    /// everything pushed after it. Fails with the message when the queue is
    /// already full.
    pub fn requeue(&mut self, message: QueuedMessage) -> Result<(), QueuedMessage> {
        if self.messages.len() >= self.cfg.max_depth {
            return Err(message);
        }
        let at = self.messages.partition_point(|m| m.id < message.id);
        self.messages.insert(at, message);
        Ok(())
    }

    /// Next message to be sent
    pub fn peek_highest(&self) -> Option<&QueuedMessage> {
        self.messages.front()
    }

    /// Remove the next message to be sent
    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.messages.pop_front()
    }

    /// Record that the stream was served, starting its blackout
    pub fn mark_served(&mut self, now: DateTime<Utc>) {
        self.last_served_at = Some(now);
    }

    pub fn last_served_at(&self) -> Option<DateTime<Utc>> {
        self.last_served_at
    }

    /// Aged priority of the stream
    ///
    /// `base + min(aging_rate * age_of_head, max_bonus)`; an empty queue
    /// reports its base priority.
    pub fn effective_priority(&self, now: DateTime<Utc>) -> f64 {
        let bonus = self
            .messages
            .front()
            .map(|head| {
                let age = elapsed_secs(head.enqueued_at, now);
                (self.cfg.priority_aging_rate * age).min(self.cfg.priority_max_bonus)
            })
            .unwrap_or(0.0);

        self.cfg.priority_base + bonus
    }

    pub fn is_blacked_out(&self, now: DateTime<Utc>) -> bool {
        match self.last_served_at {
            Some(served) => served
                .checked_add_signed(self.cfg.blackout())
                .map_or(true, |end| now < end),
            None => false,
        }
    }

    /// Whether a message outlived the stream's time-to-live
    pub fn is_stale(&self, message: &QueuedMessage, now: DateTime<Utc>) -> bool {
        outlived(message, self.cfg.ttl(), now)
    }

    /// Remove and return every message whose time-to-live has elapsed
    pub fn expire_stale(&mut self, now: DateTime<Utc>) -> Vec<QueuedMessage> {
        let ttl = self.cfg.ttl();
        let (stale, fresh): (VecDeque<_>, VecDeque<_>) = self
            .messages
            .drain(..)
            .partition(|m| outlived(m, ttl, now));

        self.messages = fresh;
        stale.into()
    }

    /// Remove every message
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.messages.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
