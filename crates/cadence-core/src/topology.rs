//! Partition topology directory
//!
//! Maps partitions to their leader and replica sites and is the core's view of
//! the external coordination service. Changes are pushed to subscribers as full
//! replacement placements, never as diffs.

use crate::config::TopologyConfig;
use crate::types::{PartitionId, ReplicaSet, SiteId};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast;

/// Capacity of the topology change channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Where one partition lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionPlacement {
    /// Partition id
    pub partition: PartitionId,
    /// Current leader; `None` between a leader failure and the next promotion
    pub leader: Option<SiteId>,
    /// Every replicating site, leader included
    pub replicas: ReplicaSet,
}

/// Full-replacement change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyEvent {
    /// New placement of the partition
    pub placement: PartitionPlacement,
}

/// Leadership move suggested to rebalance leaders across hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    /// Partition to move
    pub partition: PartitionId,
    /// Current leader
    pub from: SiteId,
    /// Replica that should take over
    pub to: SiteId,
}

/// Interface the core consumes from the cluster coordination service
pub trait CoordinationService: Send + Sync {
    /// Atomically record `leader` as the partition's current leader
    fn publish_leader(&self, partition: PartitionId, leader: SiteId) -> Result<()>;

    /// Sites currently believed alive
    fn live_sites(&self) -> BTreeSet<SiteId>;

    /// Current placement of a partition
    fn placement(&self, partition: PartitionId) -> Option<PartitionPlacement>;

    /// Subscribe to placement changes
    fn subscribe(&self) -> broadcast::Receiver<TopologyEvent>;
}

#[derive(Debug, Default)]
struct DirectoryState {
    placements: BTreeMap<PartitionId, PartitionPlacement>,
    live: BTreeSet<SiteId>,
}

/// In-process coordination service
#[derive(Debug)]
pub struct ClusterDirectory {
    state: RwLock<DirectoryState>,
    events: broadcast::Sender<TopologyEvent>,
}

impl Default for ClusterDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterDirectory {
    /// Empty directory
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(DirectoryState::default()),
            events,
        }
    }

    /// Directory populated from a topology file
    pub fn from_config(config: &TopologyConfig) -> Result<Self> {
        config.validate()?;
        let directory = Self::new();
        let mut all_sites = BTreeSet::new();
        for entry in &config.partitions {
            let leader: SiteId = entry.leader.parse()?;
            let replicas = entry
                .replicas
                .iter()
                .map(|s| s.parse::<SiteId>())
                .collect::<Result<ReplicaSet>>()?;
            all_sites.extend(replicas.iter().copied());
            directory.state.write().placements.insert(
                entry.id,
                PartitionPlacement {
                    partition: entry.id,
                    leader: Some(leader),
                    replicas,
                },
            );
        }
        let live = match &config.live_sites {
            Some(sites) => sites
                .iter()
                .map(|s| s.parse::<SiteId>())
                .collect::<Result<BTreeSet<_>>>()?,
            None => all_sites,
        };
        directory.set_live_sites(live);
        Ok(directory)
    }

    /// Install a placement, replacing any previous one
    pub fn install(&self, placement: PartitionPlacement) -> Result<()> {
        if let Some(leader) = placement.leader {
            if !placement.replicas.contains(leader) {
                return Err(Error::config(format!(
                    "partition {} leader {} is not a replica",
                    placement.partition, leader
                )));
            }
        }
        self.state
            .write()
            .placements
            .insert(placement.partition, placement.clone());
        self.notify(placement);
        Ok(())
    }

    /// Replace the live-site set
    pub fn set_live_sites(&self, sites: impl IntoIterator<Item = SiteId>) {
        self.state.write().live = sites.into_iter().collect();
    }

    /// Record a site failure: it leaves the live set and every replica set.
    ///
    /// Returns the partitions whose placement changed.
    pub fn mark_site_failed(&self, site: SiteId) -> Vec<PartitionId> {
        let changed: Vec<PartitionPlacement> = {
            let mut state = self.state.write();
            state.live.remove(&site);
            let mut changed = Vec::new();
            for placement in state.placements.values_mut() {
                if !placement.replicas.contains(site) {
                    continue;
                }
                placement.replicas = ReplicaSet::new(placement.replicas.others(site));
                if placement.leader == Some(site) {
                    placement.leader = None;
                }
                changed.push(placement.clone());
            }
            changed
        };
        tracing::warn!(%site, partitions = changed.len(), "Site failed");
        changed
            .into_iter()
            .map(|placement| {
                let partition = placement.partition;
                self.notify(placement);
                partition
            })
            .collect()
    }

    /// Leader of a partition
    pub fn leader_of(&self, partition: PartitionId) -> Option<SiteId> {
        self.state
            .read()
            .placements
            .get(&partition)
            .and_then(|p| p.leader)
    }

    /// Snapshot of every placement
    pub fn placements(&self) -> Vec<PartitionPlacement> {
        self.state.read().placements.values().cloned().collect()
    }

    /// Suggest one leadership move when leaders are unevenly spread over hosts.
    ///
    /// The busiest host must lead at least two more partitions than the idlest
    /// live host, and the moved partition must already replicate to that host.
    pub fn migration_target(&self) -> Option<MigrationPlan> {
        let state = self.state.read();
        let mut leaders_per_host: BTreeMap<u32, usize> =
            state.live.iter().map(|s| (s.host(), 0)).collect();
        for placement in state.placements.values() {
            if let Some(leader) = placement.leader {
                *leaders_per_host.entry(leader.host()).or_default() += 1;
            }
        }
        let (&max_host, &max_count) = leaders_per_host.iter().max_by_key(|(h, c)| (**c, std::cmp::Reverse(**h)))?;
        let (&min_host, &min_count) = leaders_per_host.iter().min_by_key(|(h, c)| (**c, **h))?;
        if max_count <= min_count + 1 {
            return None;
        }
        state.placements.values().find_map(|placement| {
            let from = placement.leader.filter(|l| l.host() == max_host)?;
            let to = placement
                .replicas
                .iter()
                .copied()
                .find(|s| s.host() == min_host && state.live.contains(s))?;
            Some(MigrationPlan {
                partition: placement.partition,
                from,
                to,
            })
        })
    }

    fn notify(&self, placement: PartitionPlacement) {
        // No subscribers is fine.
        let _ = self.events.send(TopologyEvent { placement });
    }
}

impl CoordinationService for ClusterDirectory {
    fn publish_leader(&self, partition: PartitionId, leader: SiteId) -> Result<()> {
        let placement = {
            let mut state = self.state.write();
            let live = state.live.contains(&leader);
            let placement = state
                .placements
                .get_mut(&partition)
                .ok_or_else(|| Error::config(format!("unknown partition {}", partition)))?;
            if !placement.replicas.contains(leader) {
                return Err(Error::invariant(format!(
                    "partition {} leader {} is not a replica",
                    partition, leader
                )));
            }
            if !live {
                return Err(Error::transient(format!(
                    "partition {} leader {} is not live",
                    partition, leader
                )));
            }
            placement.leader = Some(leader);
            placement.clone()
        };
        tracing::info!(partition, %leader, "Published partition leader");
        self.notify(placement);
        Ok(())
    }

    fn live_sites(&self) -> BTreeSet<SiteId> {
        self.state.read().live.clone()
    }

    fn placement(&self, partition: PartitionId) -> Option<PartitionPlacement> {
        self.state.read().placements.get(&partition).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }
}
