//! Selection of the next stream to serve
//!
//! Among the queues that may contribute to the frame being assembled, the one
//! with the highest aged priority wins. Equal priorities fall back to the
//! oldest head message, then to the smallest stream key, so identical inputs
//! always produce the same choice.

use acomms_protocol::{frame::FRAME_HEADER_SIZE, ModemId, StreamKey, StreamKind};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::manipulator::EligibilityFilter;
use crate::queue::{MessageId, Queue, QueuedMessage};

/// State of the outgoing packet being assembled
///
/// Destination and ack flag are fixed by the first message of the packet and
/// constrain every later message, including those of continuation frames.
/// The stitched list and budget are per frame.
#[derive(Debug, Clone, Default)]
pub struct PacketContext {
    dest: Option<ModemId>,
    ack: Option<bool>,
    stitched: Vec<(StreamKey, MessageId)>,
    remaining: usize,
    closed: bool,
}

impl PacketContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new packet, optionally restricted to a destination
    pub fn reset(&mut self, dest_hint: Option<ModemId>) {
        self.dest = dest_hint;
        self.ack = None;
        self.stitched.clear();
        self.remaining = 0;
        self.closed = false;
    }

    /// Start a new frame of the current packet
    pub fn begin_frame(&mut self, budget: usize) {
        self.stitched.clear();
        self.remaining = budget;
        self.closed = false;
    }

    pub fn dest(&self) -> Option<ModemId> {
        self.dest
    }

    pub fn ack(&self) -> Option<bool> {
        self.ack
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Messages stitched into the current frame
    pub fn stitched(&self) -> &[(StreamKey, MessageId)] {
        &self.stitched
    }

    pub fn is_frame_empty(&self) -> bool {
        self.stitched.is_empty()
    }

    /// No further message may join the current frame
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes a message would consume if it joined the current frame
    pub fn cost(&self, message: &QueuedMessage) -> usize {
        match message.key.kind {
            StreamKind::Dccl if self.is_frame_empty() => FRAME_HEADER_SIZE + message.framed_size(),
            _ => message.framed_size(),
        }
    }

    /// Whether a message may join the current frame
    pub fn accepts(&self, message: &QueuedMessage) -> bool {
        if self.closed {
            return false;
        }
        // Legacy messages travel alone
        if message.key.kind == StreamKind::Ccl && !self.is_frame_empty() {
            return false;
        }
        if self.dest.is_some_and(|dest| dest != message.dest) {
            return false;
        }
        if self.ack.is_some_and(|ack| ack != message.ack_required) {
            return false;
        }
        self.cost(message) <= self.remaining
    }

    /// Account for a message joining the frame
    ///
    /// The first message of the packet fixes its destination and ack flag.
    pub fn record(&mut self, message: &QueuedMessage) {
        let cost = self.cost(message);
        self.remaining = self.remaining.saturating_sub(cost);
        self.dest.get_or_insert(message.dest);
        self.ack.get_or_insert(message.ack_required);
        self.stitched.push((message.key, message.id));

        if message.key.kind == StreamKind::Ccl {
            self.closed = true;
        }
    }
}

struct Candidate {
    key: StreamKey,
    priority: f64,
    enqueued_at: DateTime<Utc>,
}

impl Candidate {
    /// Ordering where `Greater` means "should be sent first"
    fn rank(&self, other: &Candidate) -> Ordering {
        self.priority
            .partial_cmp(&other.priority)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.key.cmp(&self.key))
    }
}

/// Pick the stream whose head message should join the frame next
pub fn find_next_sender(
    queues: &BTreeMap<StreamKey, Queue>,
    ctx: &PacketContext,
    filter: &dyn EligibilityFilter,
    now: DateTime<Utc>,
) -> Option<StreamKey> {
    queues
        .values()
        .filter_map(|queue| {
            let head = queue.peek_highest()?;
            if queue.is_blacked_out(now)
                || !ctx.accepts(head)
                || !filter.is_eligible(&queue.key(), now)
            {
                return None;
            }

            Some(Candidate {
                key: queue.key(),
                priority: queue.effective_priority(now),
                enqueued_at: head.enqueued_at,
            })
        })
        .max_by(|a, b| a.rank(b))
        .map(|winner| winner.key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::manipulator::{Manipulator, ManipulatorManager};
    use acomms_protocol::frame::piece_size;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    struct Fixture {
        queues: BTreeMap<StreamKey, Queue>,
        next_id: u64,
    }

    impl Fixture {
        fn new(configs: Vec<StreamConfig>) -> Self {
            let queues = configs
                .into_iter()
                .map(|cfg| (cfg.key, Queue::new(cfg)))
                .collect();
            Fixture { queues, next_id: 0 }
        }

        fn push(&mut self, key: StreamKey, dest: u32, at: DateTime<Utc>) {
            self.push_sized(key, dest, at, 10);
        }

        fn push_sized(&mut self, key: StreamKey, dest: u32, at: DateTime<Utc>, size: usize) {
            let queue = self.queues.get_mut(&key).unwrap();
            let ack_required = queue.config().ack;
            self.next_id += 1;
            queue.enqueue(QueuedMessage {
                id: MessageId(self.next_id),
                key,
                enqueued_at: at,
                src: ModemId::new(1),
                dest: ModemId::new(dest),
                payload: vec![0u8; size],
                ack_required,
                retries: 0,
            });
        }
    }

    fn frame(budget: usize) -> PacketContext {
        let mut ctx = PacketContext::new();
        ctx.begin_frame(budget);
        ctx
    }

    fn no_filter() -> ManipulatorManager {
        ManipulatorManager::new()
    }

    #[test]
    fn test_highest_priority_wins() {
        let a = StreamKey::dccl(1);
        let b = StreamKey::dccl(2);
        let mut fx = Fixture::new(vec![
            StreamConfig::new(a).with_priority(10.0),
            StreamConfig::new(b).with_priority(1.0),
        ]);
        fx.push(b, 2, start());
        fx.push(a, 2, start());

        let winner = find_next_sender(&fx.queues, &frame(64), &no_filter(), start());
        assert_eq!(winner, Some(a));
    }

    #[test]
    fn test_empty_queues_yield_none() {
        let fx = Fixture::new(vec![StreamConfig::new(StreamKey::dccl(1))]);
        assert_eq!(
            find_next_sender(&fx.queues, &frame(64), &no_filter(), start()),
            None
        );
    }

    #[test]
    fn test_tie_break_oldest_then_key() {
        let a = StreamKey::dccl(1);
        let b = StreamKey::dccl(2);
        let mut fx = Fixture::new(vec![StreamConfig::new(a), StreamConfig::new(b)]);

        fx.push(b, 2, start());
        fx.push(a, 2, start() + Duration::seconds(1));
        assert_eq!(
            find_next_sender(&fx.queues, &frame(64), &no_filter(), start()),
            Some(b),
            "older head wins on equal priority"
        );

        let mut fx = Fixture::new(vec![StreamConfig::new(a), StreamConfig::new(b)]);
        fx.push(b, 2, start());
        fx.push(a, 2, start());
        assert_eq!(
            find_next_sender(&fx.queues, &frame(64), &no_filter(), start()),
            Some(a),
            "smaller key wins on equal priority and age"
        );
    }

    #[test]
    fn test_aging_overtakes_static_priority() {
        let slow = StreamKey::dccl(1);
        let fixed = StreamKey::dccl(2);
        let mut fx = Fixture::new(vec![
            StreamConfig::new(slow).with_priority(1.0).with_aging(1.0, 50.0),
            StreamConfig::new(fixed).with_priority(10.0),
        ]);
        fx.push(slow, 2, start());
        fx.push(fixed, 2, start());

        let ctx = frame(64);
        assert_eq!(
            find_next_sender(&fx.queues, &ctx, &no_filter(), start()),
            Some(fixed)
        );
        assert_eq!(
            find_next_sender(
                &fx.queues,
                &ctx,
                &no_filter(),
                start() + Duration::seconds(10)
            ),
            Some(slow)
        );
    }

    #[test]
    fn test_blacked_out_and_filtered_skipped() {
        let a = StreamKey::dccl(1);
        let b = StreamKey::dccl(2);
        let c = StreamKey::dccl(3);
        let mut fx = Fixture::new(vec![
            StreamConfig::new(a).with_priority(10.0).with_blackout_secs(5.0),
            StreamConfig::new(b).with_priority(5.0),
            StreamConfig::new(c).with_priority(1.0),
        ]);
        fx.push(a, 2, start());
        fx.push(b, 2, start());
        fx.push(c, 2, start());
        fx.queues.get_mut(&a).unwrap().mark_served(start());

        let mut manip = ManipulatorManager::new();
        manip.add(b, Manipulator::NoDequeue);

        assert_eq!(
            find_next_sender(&fx.queues, &frame(64), &manip, start()),
            Some(c)
        );
        assert_eq!(
            find_next_sender(
                &fx.queues,
                &frame(64),
                &manip,
                start() + Duration::seconds(5)
            ),
            Some(a)
        );
    }

    #[test]
    fn test_destination_and_ack_constraints() {
        let a = StreamKey::dccl(1);
        let b = StreamKey::dccl(2);
        let c = StreamKey::dccl(3);
        let mut fx = Fixture::new(vec![
            StreamConfig::new(a).with_priority(10.0),
            StreamConfig::new(b).with_priority(5.0).with_ack(false),
            StreamConfig::new(c).with_priority(1.0),
        ]);
        fx.push(a, 3, start());
        fx.push(b, 2, start());
        fx.push(c, 2, start());

        let mut ctx = frame(64);
        let first = fx.queues[&c].peek_highest().unwrap().clone();
        ctx.record(&first);
        assert_eq!(ctx.dest(), Some(ModemId::new(2)));
        assert_eq!(ctx.ack(), Some(true));

        // a: wrong destination, b: wrong ack flag, c: matches
        assert_eq!(
            find_next_sender(&fx.queues, &ctx, &no_filter(), start()),
            Some(c)
        );
    }

    #[test]
    fn test_budget_excludes_oversized() {
        let big = StreamKey::dccl(1);
        let small = StreamKey::dccl(2);
        let mut fx = Fixture::new(vec![
            StreamConfig::new(big).with_priority(10.0),
            StreamConfig::new(small),
        ]);
        fx.push_sized(big, 2, start(), 40);
        fx.push(small, 2, start());

        let budget = FRAME_HEADER_SIZE + piece_size(10);
        assert_eq!(
            find_next_sender(&fx.queues, &frame(budget), &no_filter(), start()),
            Some(small)
        );
        assert_eq!(
            find_next_sender(&fx.queues, &frame(budget - 1), &no_filter(), start()),
            None
        );
    }

    #[test]
    fn test_ccl_travels_alone() {
        let legacy = StreamKey::ccl(5);
        let modern = StreamKey::dccl(1);
        let mut fx = Fixture::new(vec![
            StreamConfig::new(legacy).with_priority(10.0),
            StreamConfig::new(modern),
        ]);
        fx.push(legacy, 2, start());
        fx.push(modern, 2, start());

        let mut ctx = frame(64);
        assert_eq!(
            find_next_sender(&fx.queues, &ctx, &no_filter(), start()),
            Some(legacy)
        );

        let modern_head = fx.queues[&modern].peek_highest().unwrap().clone();
        ctx.record(&modern_head);
        assert_eq!(
            find_next_sender(&fx.queues, &ctx, &no_filter(), start()),
            Some(modern),
            "legacy message cannot join a frame with pieces"
        );

        let mut ctx = frame(64);
        let legacy_head = fx.queues[&legacy].peek_highest().unwrap().clone();
        ctx.record(&legacy_head);
        assert!(ctx.is_closed());
        assert_eq!(
            find_next_sender(&fx.queues, &ctx, &no_filter(), start()),
            None
        );
    }

    #[test]
    fn test_context_reset() {
        let mut ctx = PacketContext::new();
        ctx.reset(Some(ModemId::new(4)));
        ctx.begin_frame(32);
        assert_eq!(ctx.dest(), Some(ModemId::new(4)));
        assert_eq!(ctx.remaining(), 32);

        let message = QueuedMessage {
            id: MessageId(1),
            key: StreamKey::dccl(1),
            enqueued_at: start(),
            src: ModemId::new(1),
            dest: ModemId::new(4),
            payload: vec![1, 2, 3],
            ack_required: false,
            retries: 0,
        };
        assert!(ctx.accepts(&message));
        ctx.record(&message);
        assert_eq!(ctx.remaining(), 32 - FRAME_HEADER_SIZE - piece_size(3));
        assert_eq!(ctx.stitched(), &[(StreamKey::dccl(1), MessageId(1))]);

        // Continuation frame keeps packet constraints
        ctx.begin_frame(32);
        assert!(ctx.is_frame_empty());
        assert_eq!(ctx.ack(), Some(false));

        ctx.reset(None);
        assert_eq!(ctx.dest(), None);
        assert_eq!(ctx.ack(), None);
    }
}
