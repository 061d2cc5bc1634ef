//! Queue configuration
//!
//! Configuration is usually loaded from YAML:
//!
//! ```yaml
//! modem_id: 1
//! max_ack_wait_secs: 30
//! queues:
//!   - key: { kind: dccl, id: 12 }
//!     name: status
//!     priority_base: 5.0
//!     ttl_secs: 120
//!     ack: false
//! ```

use acomms_protocol::{frame::STITCH_HEADER, ModemId, StreamKey, StreamKind};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::clock::secs_to_duration;
use crate::error::{QueueError, Result};
use crate::manipulator::Manipulator;

/// What to do when a push would exceed a queue's depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest pending message to make room
    #[default]
    DropOldest,
    /// Discard the incoming message
    RejectNew,
}

/// Static policy of one stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub key: StreamKey,

    /// Human readable name used in summaries
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_priority_base")]
    pub priority_base: f64,

    /// Priority gained per second a message waits at the head of the queue
    #[serde(default)]
    pub priority_aging_rate: f64,

    /// Cap on the priority gained from aging
    #[serde(default = "default_priority_max_bonus")]
    pub priority_max_bonus: f64,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: f64,

    /// Require acknowledgment of frames carrying this stream
    #[serde(default = "default_ack")]
    pub ack: bool,

    /// Cooldown after the stream is served, during which it is not selected
    #[serde(default)]
    pub blackout_secs: f64,

    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Retransmissions allowed after an ack is presumed lost
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default)]
    pub manipulators: Vec<Manipulator>,
}

fn default_priority_base() -> f64 {
    1.0
}

fn default_priority_max_bonus() -> f64 {
    100.0
}

fn default_max_depth() -> usize {
    100
}

fn default_ttl_secs() -> f64 {
    1800.0 // 30 minutes
}

fn default_ack() -> bool {
    true
}

impl StreamConfig {
    /// Stream with default policy
    pub fn new(key: StreamKey) -> Self {
        StreamConfig {
            key,
            name: String::new(),
            priority_base: default_priority_base(),
            priority_aging_rate: 0.0,
            priority_max_bonus: default_priority_max_bonus(),
            max_depth: default_max_depth(),
            ttl_secs: default_ttl_secs(),
            ack: default_ack(),
            blackout_secs: 0.0,
            overflow: OverflowPolicy::default(),
            max_retries: 0,
            manipulators: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, base: f64) -> Self {
        self.priority_base = base;
        self
    }

    pub fn with_aging(mut self, rate: f64, max_bonus: f64) -> Self {
        self.priority_aging_rate = rate;
        self.priority_max_bonus = max_bonus;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: f64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_ack(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    pub fn with_blackout_secs(mut self, blackout_secs: f64) -> Self {
        self.blackout_secs = blackout_secs;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_manipulator(mut self, manipulator: Manipulator) -> Self {
        if !self.manipulators.contains(&manipulator) {
            self.manipulators.push(manipulator);
        }
        self
    }

    pub fn ttl(&self) -> Duration {
        secs_to_duration(self.ttl_secs)
    }

    pub fn blackout(&self) -> Duration {
        secs_to_duration(self.blackout_secs)
    }

    /// Reject policies the scheduler cannot work with
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| QueueError::InvalidConfig {
            key: self.key,
            reason,
        };

        let non_negative = [
            ("priority_base", self.priority_base),
            ("priority_aging_rate", self.priority_aging_rate),
            ("priority_max_bonus", self.priority_max_bonus),
            ("ttl_secs", self.ttl_secs),
            ("blackout_secs", self.blackout_secs),
        ];
        for (field, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!(
                    "{} must be a finite non-negative number, got {}",
                    field, value
                )));
            }
        }

        if self.ttl_secs == 0.0 {
            return Err(invalid("ttl_secs must be greater than zero".to_string()));
        }

        if self.max_depth == 0 {
            return Err(invalid("max_depth must be at least 1".to_string()));
        }

        if self.key.kind == StreamKind::Ccl {
            if self.key.id > u8::MAX as u16 {
                return Err(invalid(format!("CCL id {} exceeds 255", self.key.id)));
            }
            if self.key.id == STITCH_HEADER as u16 {
                return Err(invalid(format!(
                    "CCL id {:#04x} collides with the stitched frame header",
                    self.key.id
                )));
            }
        }

        Ok(())
    }
}

/// Configuration of a queue manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueManagerConfig {
    /// Address of this node's modem
    pub modem_id: ModemId,

    /// Upper bound on messages stitched into a single frame
    #[serde(default = "default_max_messages_per_frame")]
    pub max_messages_per_frame: usize,

    /// Age after which an unacknowledged frame is presumed lost
    #[serde(default = "default_max_ack_wait_secs")]
    pub max_ack_wait_secs: f64,

    #[serde(default)]
    pub queues: Vec<StreamConfig>,
}

fn default_max_messages_per_frame() -> usize {
    32
}

fn default_max_ack_wait_secs() -> f64 {
    60.0
}

impl QueueManagerConfig {
    /// Configuration with no streams
    pub fn new(modem_id: ModemId) -> Self {
        QueueManagerConfig {
            modem_id,
            max_messages_per_frame: default_max_messages_per_frame(),
            max_ack_wait_secs: default_max_ack_wait_secs(),
            queues: Vec::new(),
        }
    }

    pub fn with_queue(mut self, queue: StreamConfig) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_max_messages_per_frame(mut self, max: usize) -> Self {
        self.max_messages_per_frame = max;
        self
    }

    pub fn with_max_ack_wait_secs(mut self, secs: f64) -> Self {
        self.max_ack_wait_secs = secs;
        self
    }

    pub fn max_ack_wait(&self) -> Duration {
        secs_to_duration(self.max_ack_wait_secs)
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate every stream and reject duplicate keys
    pub fn validate(&self) -> Result<()> {
        if !self.max_ack_wait_secs.is_finite() || self.max_ack_wait_secs <= 0.0 {
            return Err(QueueError::InvalidManagerConfig(format!(
                "max_ack_wait_secs must be positive, got {}",
                self.max_ack_wait_secs
            )));
        }

        if self.max_messages_per_frame == 0 {
            return Err(QueueError::InvalidManagerConfig(
                "max_messages_per_frame must be at least 1".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for queue in &self.queues {
            queue.validate()?;
            if !seen.insert(queue.key) {
                return Err(QueueError::DuplicateStream(queue.key));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE: &str = r#"
modem_id: 3
max_ack_wait_secs: 30
queues:
  - key: { kind: dccl, id: 12 }
    name: status
    priority_base: 5.0
    ttl_secs: 120
    ack: false
  - key: { kind: ccl, id: 1 }
    overflow: reject_new
    manipulators: [no_dequeue, loopback]
"#;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let cfg = QueueManagerConfig::from_yaml_str(EXAMPLE).unwrap();

        assert_eq!(cfg.modem_id, ModemId::new(3));
        assert_eq!(cfg.max_ack_wait_secs, 30.0);
        assert_eq!(cfg.max_messages_per_frame, 32);
        assert_eq!(cfg.queues.len(), 2);

        let status = &cfg.queues[0];
        assert_eq!(status.key, StreamKey::dccl(12));
        assert_eq!(status.name, "status");
        assert_eq!(status.priority_base, 5.0);
        assert!(!status.ack);
        assert_eq!(status.max_depth, 100);
        assert_eq!(status.overflow, OverflowPolicy::DropOldest);

        let legacy = &cfg.queues[1];
        assert_eq!(legacy.key, StreamKey::ccl(1));
        assert!(legacy.ack);
        assert_eq!(legacy.ttl_secs, 1800.0);
        assert_eq!(legacy.overflow, OverflowPolicy::RejectNew);
        assert_eq!(
            legacy.manipulators,
            vec![Manipulator::NoDequeue, Manipulator::Loopback]
        );

        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();

        let cfg = QueueManagerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.queues.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let result = QueueManagerConfig::load("/nonexistent/acomms/queues.yaml");
        assert!(matches!(result, Err(QueueError::Io(_))));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let cfg = QueueManagerConfig::new(ModemId::new(1))
            .with_queue(StreamConfig::new(StreamKey::dccl(4)).with_priority(2.5));

        let yaml = cfg.to_yaml().unwrap();
        assert_eq!(QueueManagerConfig::from_yaml_str(&yaml).unwrap(), cfg);
    }

    #[test]
    fn test_malformed_yaml() {
        let result = QueueManagerConfig::from_yaml_str("modem_id: [1, 2]");
        assert!(matches!(result, Err(QueueError::ConfigParse(_))));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let cfg = QueueManagerConfig::new(ModemId::new(1))
            .with_queue(StreamConfig::new(StreamKey::dccl(4)))
            .with_queue(StreamConfig::new(StreamKey::dccl(4)));

        assert!(matches!(
            cfg.validate(),
            Err(QueueError::DuplicateStream(key)) if key == StreamKey::dccl(4)
        ));
    }

    #[test]
    fn test_invalid_policies_rejected() {
        let key = StreamKey::dccl(1);
        let cases = vec![
            StreamConfig::new(key).with_priority(f64::NAN),
            StreamConfig::new(key).with_priority(-1.0),
            StreamConfig::new(key).with_aging(f64::INFINITY, 1.0),
            StreamConfig::new(key).with_ttl_secs(0.0),
            StreamConfig::new(key).with_blackout_secs(-3.0),
            StreamConfig::new(key).with_max_depth(0),
            StreamConfig::new(StreamKey::ccl(STITCH_HEADER)),
            StreamConfig::new(StreamKey {
                kind: StreamKind::Ccl,
                id: 256,
            }),
        ];

        for cfg in cases {
            assert!(
                matches!(cfg.validate(), Err(QueueError::InvalidConfig { .. })),
                "expected {:?} to be rejected",
                cfg
            );
        }
    }

    #[test]
    fn test_invalid_manager_settings_rejected() {
        let cfg = QueueManagerConfig::new(ModemId::new(1)).with_max_ack_wait_secs(0.0);
        assert!(matches!(
            cfg.validate(),
            Err(QueueError::InvalidManagerConfig(_))
        ));

        let cfg = QueueManagerConfig::new(ModemId::new(1)).with_max_messages_per_frame(0);
        assert!(matches!(
            cfg.validate(),
            Err(QueueError::InvalidManagerConfig(_))
        ));
    }

    #[test]
    fn test_durations() {
        let cfg = StreamConfig::new(StreamKey::dccl(1))
            .with_ttl_secs(2.5)
            .with_blackout_secs(0.25);

        assert_eq!(cfg.ttl(), Duration::milliseconds(2500));
        assert_eq!(cfg.blackout(), Duration::milliseconds(250));
    }
}
