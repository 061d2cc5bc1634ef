//! Notifications raised by the queue manager

use acomms_protocol::{ModemId, StreamKey};
use chrono::{DateTime, Utc};
use std::fmt;

use crate::queue::QueuedMessage;
use crate::signal::Signal;

/// A frame carrying `message` was acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEvent {
    pub key: StreamKey,
    pub frame_number: u32,
    /// Modem that acknowledged the frame
    pub acked_by: ModemId,
    pub message: QueuedMessage,
}

/// A message delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub key: StreamKey,
    pub src: ModemId,
    pub dest: ModemId,
    pub frame_number: u32,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Why a message left the system without being acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpireReason {
    /// Waited in its queue longer than the stream's time-to-live
    TtlExceeded,
    /// Evicted or rejected by a full queue
    Overflow,
    /// No acknowledgment arrived and no retry is left
    AckTimeout,
    /// Its stream was removed by a configuration change
    Unconfigured,
}

impl fmt::Display for ExpireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ExpireReason::TtlExceeded => "ttl exceeded",
            ExpireReason::Overflow => "queue overflow",
            ExpireReason::AckTimeout => "ack timeout",
            ExpireReason::Unconfigured => "stream unconfigured",
        };
        write!(f, "{}", reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpireEvent {
    pub message: QueuedMessage,
    pub reason: ExpireReason,
}

/// Request for fresh data on an on-demand stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataOnDemand {
    pub key: StreamKey,
    /// Bytes still available in the frame
    pub max_bytes: usize,
    pub dest: Option<ModemId>,
    pub frame_number: u32,
}

/// New size of a queue after it changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSize {
    pub key: StreamKey,
    pub size: usize,
}

/// Every notification the manager raises
///
/// Handlers receive the event by reference and cannot call back into the
/// manager.
#[derive(Debug, Default)]
pub struct Notifications {
    pub ack: Signal<AckEvent>,
    pub receive: Signal<ReceivedMessage>,
    pub receive_foreign: Signal<ReceivedMessage>,
    pub expire: Signal<ExpireEvent>,
    /// Handlers return a payload to push, or `None`
    pub data_on_demand: Signal<DataOnDemand, Option<Vec<u8>>>,
    pub queue_size_change: Signal<QueueSize>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }
}
