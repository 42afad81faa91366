//! # Configuration Management
//!
//! All tunables for a `GossipEngine`, validated once at construction so
//! every later operation can assume they hold. Loadable from a TOML file
//! following the same `config` crate pattern this codebase's loader used
//! before it grew validation, or built programmatically (tests, embedders)
//! via `Config::new` + field assignment + `validate`.
//!
//! ## Example Configuration File (config.toml)
//! ```toml
//! node_id = "node-1"
//! gossip_interval_ms = 1000
//! fanout = 3
//! peer_selection_strategy = "random"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use config::{Config as ConfigLib, File};
use serde::{Deserialize, Serialize};

use crate::error::{GossipError, Result};

/// Peer-selection strategy for a gossip cycle's fanout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSelectionStrategy {
    Random,
    RoundRobin,
    LeastRecentlyContacted,
    MostReliable,
}

impl Default for PeerSelectionStrategy {
    fn default() -> Self {
        PeerSelectionStrategy::Random
    }
}

/// Validated, immutable settings for a `GossipEngine`.
///
/// Every field has a sensible default (see `Config::default`); construct
/// with `Config::new(node_id)` and override fields before calling
/// `validate()`, or load from disk with `Config::from_file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Own node identity. Must be non-empty; validated separately from the
    /// `NodeId` newtype since `Config` is typically deserialized directly.
    pub node_id: String,

    pub gossip_interval_ms: u64,
    pub fanout: usize,
    pub gossip_timeout_ms: u64,
    pub max_events_per_message: usize,
    pub max_message_size_bytes: usize,
    pub peer_selection_strategy: PeerSelectionStrategy,

    pub enable_anti_entropy: bool,
    pub anti_entropy_interval_ms: u64,

    pub max_event_age_ms: u64,

    pub enable_duplicate_detection: bool,
    pub duplicate_cache_size: usize,

    pub peer_discovery_interval_ms: u64,

    pub enable_vector_clock_gc: bool,
    pub node_expiration_age_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            gossip_interval_ms: 1_000,
            fanout: 3,
            gossip_timeout_ms: 10_000,
            max_events_per_message: 100,
            max_message_size_bytes: 1024 * 1024,
            peer_selection_strategy: PeerSelectionStrategy::Random,
            enable_anti_entropy: true,
            anti_entropy_interval_ms: 5 * 60 * 1000,
            max_event_age_ms: 24 * 60 * 60 * 1000,
            enable_duplicate_detection: true,
            duplicate_cache_size: 10_000,
            peer_discovery_interval_ms: 60 * 1000,
            enable_vector_clock_gc: false,
            node_expiration_age_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

impl Config {
    /// Builds a default config for `node_id`. Still needs `validate()`
    /// before use if other fields are subsequently overridden.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Loads a TOML config file and validates it.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let settings = ConfigLib::builder()
            .add_source(File::from(path))
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;
        let config: Config = settings
            .try_deserialize()
            .context("deserializing config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every tunable. Returns the first violation found as
    /// `GossipError::InvalidConfig`.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(GossipError::InvalidConfig("node_id must not be empty".into()));
        }
        if self.gossip_interval_ms == 0 {
            return Err(GossipError::InvalidConfig(
                "gossip_interval_ms must be > 0".into(),
            ));
        }
        if self.fanout < 1 || self.fanout > 50 {
            return Err(GossipError::InvalidConfig("fanout must be in [1, 50]".into()));
        }
        if self.gossip_timeout_ms <= self.gossip_interval_ms {
            return Err(GossipError::InvalidConfig(
                "gossip_timeout_ms must be greater than gossip_interval_ms".into(),
            ));
        }
        if self.max_events_per_message == 0 {
            return Err(GossipError::InvalidConfig(
                "max_events_per_message must be > 0".into(),
            ));
        }
        if self.max_message_size_bytes == 0 {
            return Err(GossipError::InvalidConfig(
                "max_message_size_bytes must be > 0".into(),
            ));
        }
        if self.enable_anti_entropy && self.anti_entropy_interval_ms == 0 {
            return Err(GossipError::InvalidConfig(
                "anti_entropy_interval_ms must be > 0 when anti-entropy is enabled".into(),
            ));
        }
        if self.max_event_age_ms == 0 {
            return Err(GossipError::InvalidConfig("max_event_age_ms must be > 0".into()));
        }
        if self.enable_duplicate_detection && self.duplicate_cache_size == 0 {
            return Err(GossipError::InvalidConfig(
                "duplicate_cache_size must be > 0 when duplicate detection is enabled".into(),
            ));
        }
        if self.peer_discovery_interval_ms == 0 {
            return Err(GossipError::InvalidConfig(
                "peer_discovery_interval_ms must be > 0".into(),
            ));
        }
        if self.enable_vector_clock_gc && self.node_expiration_age_ms == 0 {
            return Err(GossipError::InvalidConfig(
                "node_expiration_age_ms must be > 0 when vector clock GC is enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn gossip_timeout(&self) -> Duration {
        Duration::from_millis(self.gossip_timeout_ms)
    }

    pub fn anti_entropy_interval(&self) -> Duration {
        Duration::from_millis(self.anti_entropy_interval_ms)
    }

    pub fn peer_discovery_interval(&self) -> Duration {
        Duration::from_millis(self.peer_discovery_interval_ms)
    }

    pub fn max_event_age(&self) -> Duration {
        Duration::from_millis(self.max_event_age_ms)
    }

    pub fn node_expiration_age(&self) -> Duration {
        Duration::from_millis(self.node_expiration_age_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn default_config_is_valid_once_node_id_is_set() {
        let config = Config::new("node-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_node_id_is_rejected() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(GossipError::InvalidConfig(_))
        ));
    }

    #[test]
    fn fanout_out_of_range_is_rejected() {
        let mut config = Config::new("node-1");
        config.fanout = 0;
        assert!(config.validate().is_err());
        config.fanout = 51;
        assert!(config.validate().is_err());
        config.fanout = 50;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn timeout_must_exceed_interval() {
        let mut config = Config::new("node-1");
        config.gossip_interval_ms = 1000;
        config.gossip_timeout_ms = 1000;
        assert!(config.validate().is_err());
        config.gossip_timeout_ms = 1001;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_cache_size_required_only_when_enabled() {
        let mut config = Config::new("node-1");
        config.enable_duplicate_detection = false;
        config.duplicate_cache_size = 0;
        assert!(config.validate().is_ok());
        config.enable_duplicate_detection = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
node_id = "node-1"
gossip_interval_ms = 2000
fanout = 5
peer_selection_strategy = "round_robin"
"#
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.node_id, "node-1");
        assert_eq!(config.gossip_interval_ms, 2000);
        assert_eq!(config.fanout, 5);
        assert_eq!(
            config.peer_selection_strategy,
            PeerSelectionStrategy::RoundRobin
        );
    }
}
