//! Per-stream manipulators and eligibility filters
//!
//! Manipulators switch individual behaviours of a stream on or off without
//! touching its priority policy. The manipulator table doubles as the
//! built-in eligibility filter consulted by the scheduler.

use acomms_protocol::StreamKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Behaviour switches attached to a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Manipulator {
    /// Accept pushes but never queue them
    NoQueue,
    /// Never select the stream for transmission
    NoDequeue,
    /// Deliver pushed messages locally as if received
    Loopback,
    /// Deliver messages locally once they are stitched into a frame
    LoopbackAsSent,
    /// Ask the application for fresh data whenever the modem requests data
    OnDemand,
    /// Deliver received messages even when addressed to another modem
    Promiscuous,
}

impl fmt::Display for Manipulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Manipulator::NoQueue => "no_queue",
            Manipulator::NoDequeue => "no_dequeue",
            Manipulator::Loopback => "loopback",
            Manipulator::LoopbackAsSent => "loopback_as_sent",
            Manipulator::OnDemand => "on_demand",
            Manipulator::Promiscuous => "promiscuous",
        };
        write!(f, "{}", name)
    }
}

/// Decides whether a stream may be selected right now
pub trait EligibilityFilter {
    fn is_eligible(&self, key: &StreamKey, now: DateTime<Utc>) -> bool;
}

impl<F> EligibilityFilter for F
where
    F: Fn(&StreamKey, DateTime<Utc>) -> bool,
{
    fn is_eligible(&self, key: &StreamKey, now: DateTime<Utc>) -> bool {
        self(key, now)
    }
}

/// Manipulators configured for every stream
#[derive(Debug, Clone, Default)]
pub struct ManipulatorManager {
    manipulators: BTreeMap<StreamKey, BTreeSet<Manipulator>>,
}

impl ManipulatorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a manipulator to a stream
    pub fn add(&mut self, key: StreamKey, manipulator: Manipulator) {
        self.manipulators.entry(key).or_default().insert(manipulator);
    }

    /// Replace all manipulators of a stream
    pub fn set(&mut self, key: StreamKey, manipulators: impl IntoIterator<Item = Manipulator>) {
        let set: BTreeSet<_> = manipulators.into_iter().collect();
        if set.is_empty() {
            self.manipulators.remove(&key);
        } else {
            self.manipulators.insert(key, set);
        }
    }

    /// Forget every manipulator of a stream
    pub fn remove(&mut self, key: &StreamKey) {
        self.manipulators.remove(key);
    }

    pub fn has(&self, key: &StreamKey, manipulator: Manipulator) -> bool {
        self.manipulators
            .get(key)
            .is_some_and(|set| set.contains(&manipulator))
    }

    /// Streams carrying a manipulator, in key order
    pub fn keys_with(&self, manipulator: Manipulator) -> Vec<StreamKey> {
        self.manipulators
            .iter()
            .filter(|(_, set)| set.contains(&manipulator))
            .map(|(key, _)| *key)
            .collect()
    }

    /// Manipulators of a stream, in a stable order
    pub fn get(&self, key: &StreamKey) -> Vec<Manipulator> {
        self.manipulators
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl EligibilityFilter for ManipulatorManager {
    fn is_eligible(&self, key: &StreamKey, _now: DateTime<Utc>) -> bool {
        !self.has(key, Manipulator::NoDequeue)
    }
}
