//! Store-and-forward message queueing for acoustic modems
//!
//! This crate implements the queue layer between applications and a modem
//! driver:
//! - One bounded queue per stream with aging priorities and time-to-live
//! - Stitching of several messages into a single modem frame
//! - Unstitching of received frames and local delivery
//! - Acknowledgment tracking with optional retransmission
//! - Per-stream manipulators (loopback, on-demand, promiscuous, ...)

pub mod ack;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod manipulator;
pub mod queue;
pub mod scheduler;
pub mod signal;

pub use ack::{AckWaitTable, PendingAck};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{OverflowPolicy, QueueManagerConfig, StreamConfig};
pub use error::{QueueError, Result};
pub use events::{
    AckEvent, DataOnDemand, ExpireEvent, ExpireReason, Notifications, QueueSize, ReceivedMessage,
};
pub use manager::QueueManager;
pub use manipulator::{EligibilityFilter, Manipulator, ManipulatorManager};
pub use queue::{MessageId, Queue, QueuedMessage};
pub use scheduler::{find_next_sender, PacketContext};
pub use signal::{Signal, SlotId};

pub use acomms_protocol as protocol;
