//! Queue manager
//!
//! Owns the queue of every configured stream and sits between the
//! application, which pushes messages, and the modem driver, which asks for
//! frames to send and hands over what it received or had acknowledged.
//! Every operation runs to completion on the caller's thread; results reach
//! the application through [`Notifications`].

use acomms_protocol::{
    frame::{
        is_stitched, FrameBuilder, FrameReader, FRAME_HEADER_SIZE, MAX_FRAME_BODY,
        MAX_PIECE_PAYLOAD,
    },
    DataRequest, ModemAck, ModemId, ModemTransmission, OutgoingMessage, StreamKey, StreamKind,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::ack::{AckWaitTable, PendingAck};
use crate::clock::Clock;
use crate::config::QueueManagerConfig;
use crate::error::{QueueError, Result};
use crate::events::{
    AckEvent, DataOnDemand, ExpireEvent, ExpireReason, Notifications, QueueSize, ReceivedMessage,
};
use crate::manipulator::{EligibilityFilter, Manipulator, ManipulatorManager};
use crate::queue::{MessageId, Queue, QueuedMessage};
use crate::scheduler::{find_next_sender, PacketContext};

type BoxedFilter = Box<dyn EligibilityFilter + Send>;

/// Manipulators plus user filters; a stream must pass all of them
struct Eligibility<'a> {
    manipulators: &'a ManipulatorManager,
    filters: &'a [BoxedFilter],
}

impl EligibilityFilter for Eligibility<'_> {
    fn is_eligible(&self, key: &StreamKey, now: DateTime<Utc>) -> bool {
        self.manipulators.is_eligible(key, now)
            && self.filters.iter().all(|filter| filter.is_eligible(key, now))
    }
}

fn build_tables(cfg: &QueueManagerConfig) -> (BTreeMap<StreamKey, Queue>, ManipulatorManager) {
    let mut queues = BTreeMap::new();
    let mut manipulators = ManipulatorManager::new();

    for stream in &cfg.queues {
        manipulators.set(stream.key, stream.manipulators.iter().copied());
        queues.insert(stream.key, Queue::new(stream.clone()));
    }

    (queues, manipulators)
}

fn validate_payload(message: &OutgoingMessage) -> Result<()> {
    match message.key.kind {
        StreamKind::Dccl if message.payload.len() > MAX_PIECE_PAYLOAD => {
            Err(QueueError::PayloadTooLarge {
                key: message.key,
                size: message.payload.len(),
                max: MAX_PIECE_PAYLOAD,
            })
        }
        StreamKind::Ccl if message.payload.first() != Some(&(message.key.id as u8)) => {
            Err(QueueError::InvalidCclPayload(message.key))
        }
        _ => Ok(()),
    }
}

/// Store-and-forward queue manager of one modem
pub struct QueueManager {
    /// Fixed for the lifetime of the manager
    modem_id: ModemId,

    cfg: QueueManagerConfig,

    queues: BTreeMap<StreamKey, Queue>,

    /// Frame number -> stitched messages awaiting acknowledgment
    waiting_for_ack: AckWaitTable,

    /// Destination and ack flag of the packet being assembled
    packet: PacketContext,

    manipulators: ManipulatorManager,

    filters: Vec<BoxedFilter>,

    notifications: Notifications,

    clock: Box<dyn Clock>,

    next_message_id: u64,
}

impl QueueManager {
    /// Create a manager from a validated configuration
    pub fn new(cfg: QueueManagerConfig, clock: impl Clock + 'static) -> Result<Self> {
        cfg.validate()?;
        let (queues, manipulators) = build_tables(&cfg);

        info!(
            "Queue manager for modem {} configured with {} stream(s)",
            cfg.modem_id,
            queues.len()
        );

        Ok(QueueManager {
            modem_id: cfg.modem_id,
            cfg,
            queues,
            waiting_for_ack: AckWaitTable::new(),
            packet: PacketContext::new(),
            manipulators,
            filters: Vec::new(),
            notifications: Notifications::new(),
            clock: Box::new(clock),
            next_message_id: 0,
        })
    }

    pub fn modem_id(&self) -> ModemId {
        self.modem_id
    }

    pub fn config(&self) -> &QueueManagerConfig {
        &self.cfg
    }

    /// Handler registration lists
    pub fn notifications(&mut self) -> &mut Notifications {
        &mut self.notifications
    }

    pub fn manipulators(&self) -> &ManipulatorManager {
        &self.manipulators
    }

    /// Attach a manipulator to a configured stream
    pub fn add_manipulator(&mut self, key: StreamKey, manipulator: Manipulator) -> Result<()> {
        if !self.queues.contains_key(&key) {
            return Err(QueueError::UnknownStream(key));
        }
        self.manipulators.add(key, manipulator);
        debug!("Manipulator {} added to {}", manipulator, key);
        Ok(())
    }

    /// Register an additional eligibility filter
    ///
    /// A stream is only selected when every filter agrees.
    pub fn add_filter(&mut self, filter: impl EligibilityFilter + Send + 'static) {
        self.filters.push(Box::new(filter));
    }

    /// Number of queued messages of a stream
    pub fn queue_size(&self, key: &StreamKey) -> Option<usize> {
        self.queues.get(key).map(Queue::len)
    }

    pub fn queue(&self, key: &StreamKey) -> Option<&Queue> {
        self.queues.get(key)
    }

    /// Number of stitched messages still waiting for an ack
    pub fn pending_acks(&self) -> usize {
        self.waiting_for_ack.len()
    }

    /// Queue a message for transmission
    ///
    /// `Loopback` streams also deliver the message locally, with frame
    /// number 0. `NoQueue` streams accept the message without queueing it.
    pub fn push(&mut self, message: OutgoingMessage) -> Result<MessageId> {
        let ack = self
            .queues
            .get(&message.key)
            .ok_or(QueueError::UnknownStream(message.key))?
            .config()
            .ack;
        validate_payload(&message)?;

        let now = self.clock.now();
        self.next_message_id += 1;
        let id = MessageId(self.next_message_id);

        let queued = QueuedMessage {
            id,
            key: message.key,
            enqueued_at: now,
            src: self.modem_id,
            dest: message.dest,
            // Nobody acknowledges a broadcast
            ack_required: ack && !message.dest.is_broadcast(),
            payload: message.payload,
            retries: 0,
        };

        if self.manipulators.has(&queued.key, Manipulator::Loopback) {
            self.loop_back(&queued, 0, now);
        }

        if self.manipulators.has(&queued.key, Manipulator::NoQueue) {
            debug!("Message {} on {} accepted without queueing", id, queued.key);
            return Ok(id);
        }

        self.enqueue(queued);
        Ok(id)
    }

    fn enqueue(&mut self, message: QueuedMessage) {
        let key = message.key;
        let id = message.id;
        let Some(queue) = self.queues.get_mut(&key) else {
            return;
        };

        let displaced = queue.enqueue(message);
        let size = queue.len();
        debug!("Message {} queued on {} ({} pending)", id, key, size);

        if let Some(displaced) = displaced {
            debug!("Queue {} full, dropping message {}", key, displaced.id);
            self.expire(displaced, ExpireReason::Overflow);
        }
        self.notify_size(key, size);
    }

    /// Assemble the next frame for the modem
    ///
    /// Returns `None` when nothing can be sent under the request's
    /// constraints.
    pub fn request_data(&mut self, request: &DataRequest) -> Option<ModemTransmission> {
        let now = self.clock.now();
        self.expire_stale(now);

        if request.first_user_frame {
            self.packet.reset(request.dest);
        }

        if self.waiting_for_ack.contains_frame(request.frame_number) {
            let displaced = self.waiting_for_ack.take(request.frame_number);
            warn!(
                "Frame number {} reused while {} message(s) still await its ack",
                request.frame_number,
                displaced.len()
            );
            self.presumed_lost(displaced, now);
        }

        self.packet
            .begin_frame(request.max_bytes.min(FRAME_HEADER_SIZE + MAX_FRAME_BODY));
        self.poll_on_demand(request);

        let mut frame = FrameBuilder::new();
        let mut legacy: Option<Vec<u8>> = None;
        let mut stitched = 0;

        while stitched < self.cfg.max_messages_per_frame && !self.packet.is_closed() {
            let eligibility = Eligibility {
                manipulators: &self.manipulators,
                filters: &self.filters,
            };
            let Some(key) = find_next_sender(&self.queues, &self.packet, &eligibility, now) else {
                break;
            };
            let Some(message) = self.take_head(key, now) else {
                break;
            };

            match key.kind {
                StreamKind::Dccl => {
                    if let Err(e) = frame.push_piece(key.id, &message.payload) {
                        warn!("Cannot stitch message {} on {}: {}", message.id, key, e);
                        self.expire(message, ExpireReason::Overflow);
                        break;
                    }
                }
                StreamKind::Ccl => legacy = Some(message.payload.clone()),
            }

            self.packet.record(&message);
            stitched += 1;
            debug!(
                "Stitched message {} from {} into frame {} ({} bytes left)",
                message.id,
                key,
                request.frame_number,
                self.packet.remaining()
            );

            if self.manipulators.has(&key, Manipulator::LoopbackAsSent) {
                self.loop_back(&message, request.frame_number, now);
            }

            if message.ack_required {
                self.waiting_for_ack
                    .insert(request.frame_number, message, now);
            }
        }

        if stitched == 0 {
            debug!("No data available for frame {}", request.frame_number);
            return None;
        }

        let data = match legacy {
            Some(data) => data,
            None => frame.finish(),
        };

        let transmission = ModemTransmission {
            src: self.modem_id,
            dest: self.packet.dest().unwrap_or(ModemId::BROADCAST),
            ack_requested: self.packet.ack().unwrap_or(false),
            frame_number: request.frame_number,
            data,
        };

        debug!(
            "Frame {} for {}: {} message(s), {} bytes, ack {}",
            transmission.frame_number,
            transmission.dest,
            stitched,
            transmission.data.len(),
            transmission.ack_requested
        );

        Some(transmission)
    }

    fn take_head(&mut self, key: StreamKey, now: DateTime<Utc>) -> Option<QueuedMessage> {
        let queue = self.queues.get_mut(&key)?;
        let message = queue.pop_front()?;
        queue.mark_served(now);
        let size = queue.len();

        self.notify_size(key, size);
        Some(message)
    }

    /// Ask on-demand streams for fresh data and queue whatever they return
    fn poll_on_demand(&mut self, request: &DataRequest) {
        let dest = self.packet.dest().unwrap_or(ModemId::BROADCAST);

        for key in self.manipulators.keys_with(Manipulator::OnDemand) {
            if !self.queues.contains_key(&key) {
                continue;
            }

            let event = DataOnDemand {
                key,
                max_bytes: self.packet.remaining(),
                dest: self.packet.dest(),
                frame_number: request.frame_number,
            };
            let replies = self.notifications.data_on_demand.emit(&event);

            for payload in replies.into_iter().flatten() {
                if let Err(e) = self.push(OutgoingMessage::new(key, dest, payload)) {
                    warn!("Dropping on-demand data for {}: {}", key, e);
                }
            }
        }
    }

    /// Unstitch a frame from the modem and deliver its messages
    ///
    /// A malformed piece ends parsing; the pieces before it are still
    /// delivered.
    pub fn receive_data(&mut self, transmission: &ModemTransmission) {
        let Some(&first) = transmission.data.first() else {
            debug!(
                "Ignoring empty frame {} from {}",
                transmission.frame_number, transmission.src
            );
            return;
        };
        let now = self.clock.now();

        if !is_stitched(&transmission.data) {
            let key = StreamKey::ccl(first);
            self.publish(key, transmission, transmission.data.clone(), now);
            return;
        }

        let reader = match FrameReader::new(&transmission.data) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(
                    "Malformed frame {} from {}: {}",
                    transmission.frame_number, transmission.src, e
                );
                return;
            }
        };

        if reader.is_truncated() {
            warn!(
                "Frame {} from {} shorter than its declared {} bytes",
                transmission.frame_number,
                transmission.src,
                reader.declared_len()
            );
        }

        for piece in reader {
            match piece {
                Ok(piece) => {
                    let key = StreamKey::dccl(piece.stream_id);
                    self.publish(key, transmission, piece.payload.to_vec(), now);
                }
                Err(e) => {
                    warn!(
                        "Discarding tail of frame {} from {}: {} (frame: {})",
                        transmission.frame_number,
                        transmission.src,
                        e,
                        transmission.data_hex()
                    );
                    break;
                }
            }
        }
    }

    fn publish(
        &mut self,
        key: StreamKey,
        transmission: &ModemTransmission,
        payload: Vec<u8>,
        now: DateTime<Utc>,
    ) {
        let addressed = transmission.dest == self.modem_id
            || transmission.dest.is_broadcast()
            || self.manipulators.has(&key, Manipulator::Promiscuous);

        if !addressed {
            debug!(
                "Ignoring {} message from {} addressed to {}",
                key, transmission.src, transmission.dest
            );
            return;
        }

        let message = ReceivedMessage {
            key,
            src: transmission.src,
            dest: transmission.dest,
            frame_number: transmission.frame_number,
            payload,
            received_at: now,
        };

        debug!(
            "Received {} bytes on {} from {}",
            message.payload.len(),
            key,
            message.src
        );

        match key.kind {
            StreamKind::Dccl => self.notifications.receive.emit(&message),
            StreamKind::Ccl => self.notifications.receive_foreign.emit(&message),
        };
    }

    /// Retire the messages of an acknowledged frame
    pub fn receive_ack(&mut self, ack: &ModemAck) {
        if ack.dest != self.modem_id {
            debug!(
                "Ignoring ack of frame {} addressed to {}",
                ack.frame_number, ack.dest
            );
            return;
        }

        let acked = self.waiting_for_ack.take(ack.frame_number);
        if acked.is_empty() {
            warn!(
                "Ack from {} for frame {} which has no pending messages",
                ack.src, ack.frame_number
            );
            return;
        }

        for entry in acked {
            debug!(
                "Message {} on {} acknowledged by {}",
                entry.message.id, entry.key, ack.src
            );
            self.notifications.ack.emit(&AckEvent {
                key: entry.key,
                frame_number: entry.frame_number,
                acked_by: ack.src,
                message: entry.message,
            });
        }
    }

    /// Expire stale messages and give up on frames never acknowledged
    pub fn tick(&mut self) {
        let now = self.clock.now();
        self.expire_stale(now);

        let Some(cutoff) = now.checked_sub_signed(self.cfg.max_ack_wait()) else {
            return;
        };
        let lost = self.waiting_for_ack.take_sent_before(cutoff);
        if !lost.is_empty() {
            warn!(
                "{} message(s) without ack after {}s",
                lost.len(),
                self.cfg.max_ack_wait_secs
            );
        }
        self.presumed_lost(lost, now);
    }

    fn expire_stale(&mut self, now: DateTime<Utc>) {
        let mut expired = Vec::new();
        let mut sizes = Vec::new();

        for queue in self.queues.values_mut() {
            let stale = queue.expire_stale(now);
            if !stale.is_empty() {
                sizes.push((queue.key(), queue.len()));
                expired.extend(stale);
            }
        }

        for message in expired {
            self.expire(message, ExpireReason::TtlExceeded);
        }
        for (key, size) in sizes {
            self.notify_size(key, size);
        }
    }

    /// Retry or expire messages whose frame was never acknowledged
    fn presumed_lost(&mut self, entries: Vec<PendingAck>, now: DateTime<Utc>) {
        for entry in entries {
            let key = entry.key;
            let mut message = entry.message;

            let Some(queue) = self.queues.get_mut(&key) else {
                self.expire(message, ExpireReason::Unconfigured);
                continue;
            };

            if message.retries >= queue.config().max_retries || queue.is_stale(&message, now) {
                warn!(
                    "Message {} on {} presumed lost in frame {}",
                    message.id, key, entry.frame_number
                );
                self.expire(message, ExpireReason::AckTimeout);
                continue;
            }

            message.retries += 1;
            let id = message.id;
            let retries = message.retries;

            match queue.requeue(message) {
                Ok(()) => {
                    let size = queue.len();
                    info!("Requeued message {} on {} (retry {})", id, key, retries);
                    self.notify_size(key, size);
                }
                Err(message) => self.expire(message, ExpireReason::Overflow),
            }
        }
    }

    fn loop_back(&mut self, message: &QueuedMessage, frame_number: u32, now: DateTime<Utc>) {
        self.notifications.receive.emit(&ReceivedMessage {
            key: message.key,
            src: message.src,
            dest: message.dest,
            frame_number,
            payload: message.payload.clone(),
            received_at: now,
        });
    }

    fn expire(&mut self, message: QueuedMessage, reason: ExpireReason) {
        debug!("Message {} on {} expired: {}", message.id, message.key, reason);
        self.notifications
            .expire
            .emit(&ExpireEvent { message, reason });
    }

    fn notify_size(&mut self, key: StreamKey, size: usize) {
        self.notifications
            .queue_size_change
            .emit(&QueueSize { key, size });
    }

    fn check_modem_id(&self, cfg: &QueueManagerConfig) -> Result<()> {
        if cfg.modem_id != self.modem_id {
            return Err(QueueError::ModemIdChanged {
                current: self.modem_id,
                requested: cfg.modem_id,
            });
        }
        Ok(())
    }

    /// Replace the whole configuration
    ///
    /// Streams kept by the new configuration keep their pending messages,
    /// re-queued under the new policy. Messages of removed streams expire.
    /// On error the previous configuration stays in place.
    pub fn set_cfg(&mut self, cfg: QueueManagerConfig) -> Result<()> {
        self.check_modem_id(&cfg)?;
        cfg.validate()?;

        let (mut queues, manipulators) = build_tables(&cfg);
        let mut overflowed = Vec::new();
        let mut unconfigured = Vec::new();
        let mut old_sizes = Vec::new();

        for (key, mut old) in std::mem::take(&mut self.queues) {
            old_sizes.push((key, old.len()));
            match queues.get_mut(&key) {
                Some(queue) => {
                    if let Some(served) = old.last_served_at() {
                        queue.mark_served(served);
                    }
                    for message in old.drain() {
                        overflowed.extend(queue.enqueue(message));
                    }
                }
                None => unconfigured.extend(old.drain()),
            }
        }

        self.queues = queues;
        self.manipulators = manipulators;
        self.cfg = cfg;

        info!(
            "Configuration replaced: {} stream(s), {} message(s) dropped",
            self.queues.len(),
            overflowed.len() + unconfigured.len()
        );

        for message in unconfigured {
            self.expire(message, ExpireReason::Unconfigured);
        }
        for message in overflowed {
            self.expire(message, ExpireReason::Overflow);
        }
        for (key, old_size) in old_sizes {
            let size = self.queue_size(&key).unwrap_or(0);
            if size != old_size {
                self.notify_size(key, size);
            }
        }

        Ok(())
    }

    /// Add the streams of `cfg` to the current configuration
    ///
    /// Fails without changes if any stream is already configured.
    pub fn merge_cfg(&mut self, cfg: QueueManagerConfig) -> Result<()> {
        self.check_modem_id(&cfg)?;
        cfg.validate()?;

        if let Some(existing) = cfg
            .queues
            .iter()
            .find(|stream| self.queues.contains_key(&stream.key))
        {
            return Err(QueueError::DuplicateStream(existing.key));
        }

        let added = cfg.queues.len();
        for stream in cfg.queues {
            self.manipulators
                .set(stream.key, stream.manipulators.iter().copied());
            self.queues.insert(stream.key, Queue::new(stream.clone()));
            self.cfg.queues.push(stream);
        }

        info!(
            "Merged {} stream(s), now {} configured",
            added,
            self.queues.len()
        );
        Ok(())
    }

    /// One line per stream with its size and policy
    pub fn summary(&self) -> String {
        let mut out = format!(
            "modem {}: {} stream(s), {} message(s) awaiting ack\n",
            self.modem_id,
            self.queues.len(),
            self.waiting_for_ack.len()
        );

        for queue in self.queues.values() {
            let cfg = queue.config();
            let name = if cfg.name.is_empty() { "-" } else { cfg.name.as_str() };
            out.push_str(&format!(
                "  {} {}: {}/{} priority {} ack {} ttl {}s blackout {}s\n",
                cfg.key,
                name,
                queue.len(),
                cfg.max_depth,
                cfg.priority_base,
                cfg.ack,
                cfg.ttl_secs,
                cfg.blackout_secs
            ));
        }

        out
    }
}

impl fmt::Display for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}
