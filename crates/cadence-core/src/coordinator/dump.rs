//! Side-effect-free diagnostic view of a coordinator

use crate::duplicate_counter::CounterDump;
use crate::migration::MigrationState;
use crate::promotion::PromotionDump;
use crate::types::{PartitionId, PartitionRole, SiteId, TxnHandle};
use serde::Serialize;

/// Coordinator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Work accepted as leader
    pub accepted: u64,
    /// Work applied as replica
    pub replicated: u64,
    /// Read-only work answered without replication
    pub short_circuit_reads: u64,
    /// Duplicate counters resolved
    pub settled: u64,
    /// Counters resolved MISMATCH or ABORT
    pub nondeterministic: u64,
    /// Work or protocol messages bounced as misrouted
    pub misrouted: u64,
    /// Repair messages dropped because the handle was already applied
    pub repairs_skipped: u64,
    /// Responses not counted (duplicates, dropped sites, stale)
    pub ignored_responses: u64,
    /// Counters that resolved with no response at all
    pub empty_resolutions: u64,
}

/// JSON-serializable snapshot of coordinator state
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorDump {
    /// Partition
    pub partition: PartitionId,
    /// Local site
    pub site: SiteId,
    /// Local role
    pub role: PartitionRole,
    /// Installed replica set
    pub replicas: Vec<SiteId>,
    /// Highest handle applied or observed
    pub max_seen: TxnHandle,
    /// Last handle the allocator produced or observed
    pub last_allocated: TxnHandle,
    /// Clock regression offset
    pub clock_offset_ms: i64,
    /// Repair-log truncation point
    pub truncation: TxnHandle,
    /// Repair-log entries retained
    pub repair_log_len: usize,
    /// Open duplicate counters in key order
    pub counters: Vec<CounterDump>,
    /// Handles accepted but not yet settled
    pub inflight: Vec<TxnHandle>,
    /// Leader-migration state
    pub migration: MigrationState,
    /// Candidate waiting for a drain notice
    pub awaiting_drain: bool,
    /// Promotion in progress
    pub promotion: Option<PromotionDump>,
    /// Command-log replay finished
    pub replay_complete: bool,
    /// Non-determinism was detected on this partition
    pub reduced_safety: bool,
    /// Counters
    pub stats: CoordinatorStats,
}

impl CoordinatorDump {
    /// Pretty JSON rendering
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::internal(format!("dump serialization failed: {}", e)))
    }
}
