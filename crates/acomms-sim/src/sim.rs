//! Two queue managers on a simulated half-duplex acoustic link

use acomms_protocol::{DataRequest, ModemAck, ModemId, OutgoingMessage, StreamKind};
use acomms_queue::{
    AckEvent, ExpireEvent, ExpireReason, ManualClock, QueueManager, QueueManagerConfig,
    ReceivedMessage,
};
use anyhow::{Context, Result};
use rand::{rngs::StdRng, Rng};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Link and traffic parameters
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Probability that a data frame is lost
    pub frame_loss: f64,

    /// Probability that an acknowledgment is lost
    pub ack_loss: f64,

    /// Bytes per modem frame
    pub frame_bytes: usize,

    /// Simulated seconds per transmission slot
    pub slot_secs: f64,

    /// Probability that a stream produces a message in a slot
    pub traffic: f64,

    /// Largest generated payload
    pub max_payload: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            frame_loss: 0.2,
            ack_loss: 0.1,
            frame_bytes: 64,
            slot_secs: 10.0,
            traffic: 0.3,
            max_payload: 24,
        }
    }
}

/// Notification counters of one node
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NodeStats {
    pub pushed: u64,
    pub frames_sent: u64,
    pub received: u64,
    pub received_foreign: u64,
    pub acked: u64,
    pub expired_ttl: u64,
    pub expired_overflow: u64,
    pub expired_ack_timeout: u64,
}

impl fmt::Display for NodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pushed {} frames {} received {} (+{} legacy) acked {} expired ttl/overflow/ack {}/{}/{}",
            self.pushed,
            self.frames_sent,
            self.received,
            self.received_foreign,
            self.acked,
            self.expired_ttl,
            self.expired_overflow,
            self.expired_ack_timeout
        )
    }
}

/// A queue manager with counters attached to its notifications
pub struct SimNode {
    pub manager: QueueManager,
    stats: Arc<Mutex<NodeStats>>,
    next_frame: u32,
}

impl SimNode {
    pub fn new(cfg: QueueManagerConfig, clock: ManualClock) -> Result<Self> {
        let modem_id = cfg.modem_id;
        let mut manager = QueueManager::new(cfg, clock)
            .with_context(|| format!("Invalid configuration for modem {}", modem_id))?;
        let stats = Arc::new(Mutex::new(NodeStats::default()));

        let notifications = manager.notifications();

        let counter = stats.clone();
        notifications.receive.connect(move |_: &ReceivedMessage| {
            if let Ok(mut stats) = counter.lock() {
                stats.received += 1;
            }
        });

        let counter = stats.clone();
        notifications
            .receive_foreign
            .connect(move |_: &ReceivedMessage| {
                if let Ok(mut stats) = counter.lock() {
                    stats.received_foreign += 1;
                }
            });

        let counter = stats.clone();
        notifications.ack.connect(move |_: &AckEvent| {
            if let Ok(mut stats) = counter.lock() {
                stats.acked += 1;
            }
        });

        let counter = stats.clone();
        notifications.expire.connect(move |event: &ExpireEvent| {
            if let Ok(mut stats) = counter.lock() {
                match event.reason {
                    ExpireReason::TtlExceeded => stats.expired_ttl += 1,
                    ExpireReason::Overflow => stats.expired_overflow += 1,
                    ExpireReason::AckTimeout | ExpireReason::Unconfigured => {
                        stats.expired_ack_timeout += 1
                    }
                }
            }
        });

        Ok(SimNode {
            manager,
            stats,
            next_frame: 0,
        })
    }

    pub fn stats(&self) -> NodeStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    fn count(&self, update: impl FnOnce(&mut NodeStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    /// Push random application traffic to `dest`
    fn generate(&mut self, dest: ModemId, link: &LinkConfig, rng: &mut StdRng) {
        let streams: Vec<_> = self.manager.config().queues.iter().map(|q| q.key).collect();

        for key in streams {
            if !rng.gen_bool(link.traffic) {
                continue;
            }

            let len = rng.gen_range(1..=link.max_payload.max(1));
            let mut payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            if key.kind == StreamKind::Ccl {
                payload[0] = key.id as u8;
            }

            match self.manager.push(OutgoingMessage::new(key, dest, payload)) {
                Ok(id) => {
                    debug!("Modem {} pushed {} on {}", self.manager.modem_id(), id, key);
                    self.count(|s| s.pushed += 1);
                }
                Err(e) => debug!("Modem {} push rejected: {}", self.manager.modem_id(), e),
            }
        }
    }
}

/// Half-duplex link between two nodes sharing one clock
pub struct Link {
    pub a: SimNode,
    pub b: SimNode,
    clock: ManualClock,
    cfg: LinkConfig,
    rng: StdRng,
}

impl Link {
    pub fn new(
        a: QueueManagerConfig,
        b: QueueManagerConfig,
        cfg: LinkConfig,
        clock: ManualClock,
        rng: StdRng,
    ) -> Result<Self> {
        if a.modem_id == b.modem_id {
            anyhow::bail!("Both nodes use modem id {}", a.modem_id);
        }

        Ok(Link {
            a: SimNode::new(a, clock.clone())?,
            b: SimNode::new(b, clock.clone())?,
            clock,
            cfg,
            rng,
        })
    }

    /// Run one transmission slot; even slots belong to `a`
    pub fn step(&mut self, slot: u64) {
        let a_id = self.a.manager.modem_id();
        let b_id = self.b.manager.modem_id();
        self.a.generate(b_id, &self.cfg, &mut self.rng);
        self.b.generate(a_id, &self.cfg, &mut self.rng);

        let (sender, receiver) = if slot % 2 == 0 {
            (&mut self.a, &mut self.b)
        } else {
            (&mut self.b, &mut self.a)
        };

        let request = DataRequest::new(self.cfg.frame_bytes, sender.next_frame);
        sender.next_frame = sender.next_frame.wrapping_add(1);

        if let Some(frame) = sender.manager.request_data(&request) {
            sender.count(|s| s.frames_sent += 1);

            if self.rng.gen_bool(self.cfg.frame_loss) {
                info!(
                    "Frame {} from {} lost ({} bytes)",
                    frame.frame_number,
                    frame.src,
                    frame.data.len()
                );
            } else {
                receiver.manager.receive_data(&frame);

                if frame.ack_requested && !self.rng.gen_bool(self.cfg.ack_loss) {
                    sender.manager.receive_ack(&ModemAck {
                        src: receiver.manager.modem_id(),
                        dest: frame.src,
                        frame_number: frame.frame_number,
                    });
                }
            }
        }

        self.clock.advance_secs(self.cfg.slot_secs);
        self.a.manager.tick();
        self.b.manager.tick();
    }

    pub fn run(&mut self, slots: u64) {
        for slot in 0..slots {
            self.step(slot);
        }
    }
}
