//! Node configuration.
//!
//! Sizes for the shared segment and the three fragment size classes, plus
//! consumer wait behavior. Loadable from JSON so a launcher can hand the same
//! file to every rank on a node.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::fragment::{slot_size, FRAGMENT_HEADER_SIZE};
use crate::core::segment::{DATA_OFFSET, MAX_SEGMENT_SIZE};
use crate::core::{Error, Result};

pub const DEFAULT_SEGMENT_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_GROW_BATCH: usize = 8;
pub const DEFAULT_SPIN_US: u32 = 20;

/// Payload capacity in bytes of each fragment size class.
///
/// The three values must be pairwise distinct: a returned fragment is mapped
/// back to its free list purely by its payload capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClassConfig {
    /// Small inline sends.
    pub user: usize,
    /// Eager-protocol limit.
    pub eager: usize,
    /// Largest single fragment.
    pub max_send: usize,
}

impl Default for SizeClassConfig {
    fn default() -> Self {
        Self {
            user: 256 - FRAGMENT_HEADER_SIZE,
            eager: 4 * 1024,
            max_send: 32 * 1024,
        }
    }
}

/// How an idle consumer waits for its doorbell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WaitStrategy {
    /// Spin for `spin_us` then park on the segment futex.
    Hybrid { spin_us: u32 },
    /// Sleep for a fixed interval and return.
    BusyPoll { interval_us: u64 },
}

impl WaitStrategy {
    pub fn busy_poll(interval: Duration) -> Self {
        WaitStrategy::BusyPoll {
            interval_us: interval.as_micros() as u64,
        }
    }
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::Hybrid {
            spin_us: DEFAULT_SPIN_US,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Total bytes of this node's shared segment, control region included.
    pub segment_size: usize,
    #[serde(default)]
    pub size_classes: SizeClassConfig,
    /// Slots carved from the arena each time a free list runs dry.
    #[serde(default = "default_grow_batch")]
    pub grow_batch: usize,
    #[serde(default)]
    pub wait_strategy: WaitStrategy,
    /// Remove the segment file when the owning node is dropped.
    #[serde(default = "default_true")]
    pub unlink_on_drop: bool,
    /// `mlock` the own segment after creation.
    #[serde(default)]
    pub lock_memory: bool,
}

fn default_grow_batch() -> usize {
    DEFAULT_GROW_BATCH
}

fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            size_classes: SizeClassConfig::default(),
            grow_batch: DEFAULT_GROW_BATCH,
            wait_strategy: WaitStrategy::default(),
            unlink_on_drop: true,
            lock_memory: false,
        }
    }
}

impl NodeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_size > MAX_SEGMENT_SIZE {
            return Err(Error::InvalidConfig("segment size exceeds 4 GiB"));
        }
        if self.segment_size <= DATA_OFFSET {
            return Err(Error::InvalidConfig("segment size leaves no data region"));
        }
        if self.grow_batch == 0 {
            return Err(Error::InvalidConfig("grow batch must be non-zero"));
        }
        self.size_classes.validate()?;
        if self.size_classes.largest_slot()? > self.segment_size - DATA_OFFSET {
            return Err(Error::InvalidConfig("largest slot does not fit the data region"));
        }
        Ok(())
    }
}

impl SizeClassConfig {
    pub fn validate(&self) -> Result<()> {
        if self.user == 0 || self.eager == 0 || self.max_send == 0 {
            return Err(Error::InvalidConfig("size class capacity must be non-zero"));
        }
        if self.user == self.eager || self.user == self.max_send || self.eager == self.max_send {
            return Err(Error::InvalidConfig("size class capacities must be distinct"));
        }
        self.largest_slot()?;
        Ok(())
    }

    /// Arena bytes taken by a slot of the biggest class.
    pub fn largest_slot(&self) -> Result<usize> {
        [self.user, self.eager, self.max_send]
            .into_iter()
            .try_fold(0, |largest, capacity| {
                slot_size(capacity)
                    .map(|size| largest.max(size))
                    .ok_or(Error::InvalidConfig("size class capacity exceeds fragment limit"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fragment::MAX_FRAGMENT_CAPACITY;

    #[test]
    fn default_config_is_valid() {
        NodeConfig::default().validate().expect("default config");
    }

    #[test]
    fn duplicate_capacities_rejected() {
        let classes = SizeClassConfig {
            user: 1024,
            eager: 1024,
            max_send: 8192,
        };
        assert!(matches!(classes.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn huge_capacity_in_any_class_rejected() {
        let base = SizeClassConfig::default();
        let variants = [
            SizeClassConfig { user: usize::MAX, ..base },
            SizeClassConfig { eager: usize::MAX, ..base },
            SizeClassConfig { max_send: usize::MAX, ..base },
            SizeClassConfig { user: MAX_FRAGMENT_CAPACITY + 1, ..base },
        ];
        for classes in variants {
            assert!(matches!(classes.validate(), Err(Error::InvalidConfig(_))));
            let config = NodeConfig {
                size_classes: classes,
                ..NodeConfig::default()
            };
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn huge_capacity_from_json_rejected() {
        let json = format!(
            r#"{{ "segment_size": 1048576, "size_classes": {{ "user": {}, "eager": 4096, "max_send": 32768 }} }}"#,
            usize::MAX
        );
        assert!(matches!(
            NodeConfig::from_json_str(&json),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn segment_too_small_rejected() {
        let config = NodeConfig {
            segment_size: DATA_OFFSET,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn json_fills_defaults() {
        let config = NodeConfig::from_json_str(
            r#"{ "segment_size": 1048576, "wait_strategy": { "type": "BusyPoll", "interval_us": 50 } }"#,
        )
        .expect("parse config");
        assert_eq!(config.segment_size, 1 << 20);
        assert_eq!(config.size_classes, SizeClassConfig::default());
        assert_eq!(config.grow_batch, DEFAULT_GROW_BATCH);
        assert_eq!(config.wait_strategy, WaitStrategy::BusyPoll { interval_us: 50 });
        assert!(config.unlink_on_drop);
    }
}
