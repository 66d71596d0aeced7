//! Coordinator configuration

use crate::types::{MP_PARTITION_ID, PartitionId, SiteId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a duplicate counter does with a response from a site that is no longer expected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateResponsePolicy {
    /// Log, count and drop the response
    #[default]
    Discard,
    /// Treat the response as a protocol invariant violation
    Fatal,
}

/// Per-partition coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Partition this coordinator serves
    pub partition: PartitionId,

    /// Local site id
    pub site: SiteId,

    /// Repair-log entries carried per repair response page
    pub repair_page_size: usize,

    /// Statement hashes tracked per transaction before the determinism check saturates
    pub max_tracked_hashes: usize,

    /// Soft liveness timeout while collecting multi-partition fragment responses
    pub mp_soft_timeout_ms: u64,

    /// Capacity of the partition actor's delivery queue
    pub mailbox_capacity: usize,

    /// Handling of responses from sites dropped out of a counter's expected set
    pub late_response_policy: LateResponsePolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            partition: 0,
            site: SiteId::new(0, 0),
            repair_page_size: 64,
            max_tracked_hashes: 1024,
            mp_soft_timeout_ms: 30_000,
            mailbox_capacity: 10_000,
            late_response_policy: LateResponsePolicy::Discard,
        }
    }
}

impl CoordinatorConfig {
    /// Configuration for one partition served from one site
    pub fn new(partition: PartitionId, site: SiteId) -> Self {
        Self {
            partition,
            site,
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::config(format!("Invalid coordinator config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set repair page size
    pub fn with_repair_page_size(mut self, size: usize) -> Self {
        self.repair_page_size = size;
        self
    }

    /// Set the tracked statement hash limit
    pub fn with_max_tracked_hashes(mut self, limit: usize) -> Self {
        self.max_tracked_hashes = limit;
        self
    }

    /// Set the multi-partition soft liveness timeout
    pub fn with_mp_soft_timeout(mut self, timeout: Duration) -> Self {
        self.mp_soft_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the late-response policy
    pub fn with_late_response_policy(mut self, policy: LateResponsePolicy) -> Self {
        self.late_response_policy = policy;
        self
    }

    /// Multi-partition soft liveness timeout
    pub fn mp_soft_timeout(&self) -> Duration {
        Duration::from_millis(self.mp_soft_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.partition > MP_PARTITION_ID {
            return Err(Error::config(format!(
                "partition {} does not fit in a handle",
                self.partition
            )));
        }
        if self.repair_page_size == 0 {
            return Err(Error::config("repair_page_size must be at least 1"));
        }
        if self.max_tracked_hashes == 0 {
            return Err(Error::config("max_tracked_hashes must be at least 1"));
        }
        if self.mp_soft_timeout_ms == 0 {
            return Err(Error::config("mp_soft_timeout_ms must be at least 1"));
        }
        if self.mailbox_capacity == 0 {
            return Err(Error::config("mailbox_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// One partition's placement as written in a topology file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// Partition id
    pub id: PartitionId,
    /// Leader site, `host:index`
    pub leader: String,
    /// Every replicating site, leader included, `host:index`
    pub replicas: Vec<String>,
}

/// Static cluster topology, loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Partition placements
    pub partitions: Vec<PartitionSpec>,
    /// Live sites; every replica is considered live when omitted
    pub live_sites: Option<Vec<String>>,
}

impl TopologyConfig {
    /// Parse a topology from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::config(format!("Invalid topology: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a topology file
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Validate partition ids and site syntax
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for entry in &self.partitions {
            if entry.id >= MP_PARTITION_ID {
                return Err(Error::config(format!("partition {} is reserved", entry.id)));
            }
            if !seen.insert(entry.id) {
                return Err(Error::config(format!("partition {} listed twice", entry.id)));
            }
            let leader: SiteId = entry.leader.parse()?;
            let replicas = entry
                .replicas
                .iter()
                .map(|s| s.parse::<SiteId>())
                .collect::<Result<Vec<_>>>()?;
            if !replicas.contains(&leader) {
                return Err(Error::config(format!(
                    "partition {} leader {} is not one of its replicas",
                    entry.id, leader
                )));
            }
        }
        for site in self.live_sites.iter().flatten() {
            site.parse::<SiteId>()?;
        }
        Ok(())
    }
}
