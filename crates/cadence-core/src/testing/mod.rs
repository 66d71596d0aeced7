//! Test doubles and an in-process cluster harness
//!
//! [`LocalCluster`] wires several [`PartitionCoordinator`]s of one partition
//! together over a single FIFO queue and pumps messages synchronously, so a
//! failure scenario replays identically on every run. It is also what the
//! `cadence simulate` command drives.

use crate::config::CoordinatorConfig;
use crate::coordinator::{ClientResponse, ClusterEvent, Mailbox, PartitionCoordinator};
use crate::engine::{
    CommandLog, Dependency, ExecutionEngine, ExecutionHash, ExecutionRequest, ExecutionResult, FaultRecord,
};
use crate::promotion::PromotionHandle;
use crate::protocol::{InitiateTask, Message, Origin, WorkUnit};
use crate::topology::{ClusterDirectory, CoordinationService, PartitionPlacement, TopologyEvent};
use crate::types::{ClientHandle, PartitionId, PartitionRole, ReplicaSet, SiteId, TxnHandle};
use crate::unique_id::ManualClock;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;

pub use crate::unique_id::EPOCH_MS;

/// Pseudo-site standing in for every client interface
pub const CLIENT_SITE: SiteId = SiteId::from_raw(1000 << 32);

/// Upper bound on messages one [`LocalCluster::pump`] may deliver
const MAX_STEPS: usize = 100_000;

/// Catalog version reported by [`DeterministicEngine`]
const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Default)]
struct EngineState {
    applied: Vec<TxnHandle>,
    completed: Vec<(TxnHandle, bool)>,
    salt: Option<u32>,
}

/// Execution engine whose result depends only on the payload.
///
/// Each `;`-separated statement hashes separately. A payload starting with
/// `abort` aborts. Setting a salt makes the engine disagree with its peers.
/// Clones share state, so a test keeps one copy and hands the other to a
/// coordinator.
#[derive(Debug, Clone, Default)]
pub struct DeterministicEngine {
    state: Arc<Mutex<EngineState>>,
}

impl DeterministicEngine {
    /// Fresh engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Salt every statement hash; `None` restores determinism
    pub fn set_salt(&self, salt: Option<u32>) {
        self.state.lock().salt = salt;
    }

    /// Handles of read-write work executed, in order
    pub fn applied(&self) -> Vec<TxnHandle> {
        self.state.lock().applied.clone()
    }

    /// Multi-partition completions: (txn id, committed)
    pub fn completed(&self) -> Vec<(TxnHandle, bool)> {
        self.state.lock().completed.clone()
    }
}

impl ExecutionEngine for DeterministicEngine {
    fn execute(&mut self, handle: TxnHandle, request: ExecutionRequest<'_>) -> ExecutionResult {
        let (payload, read_only, output_deps): (&[u8], bool, &[u32]) = match request {
            ExecutionRequest::Procedure(work) => (work.payload.as_slice(), work.read_only, &[][..]),
            ExecutionRequest::Fragment(task) => {
                (task.payload.as_slice(), task.read_only, task.output_deps.as_slice())
            }
        };
        let salt = {
            let mut state = self.state.lock();
            if !read_only {
                state.applied.push(handle);
            }
            state.salt
        };
        let statements: Vec<Vec<u8>> = payload
            .split(|b| *b == b';')
            .map(|statement| {
                let mut statement = statement.to_vec();
                if let Some(salt) = salt {
                    statement.extend_from_slice(&salt.to_le_bytes());
                }
                statement
            })
            .collect();
        let hash = ExecutionHash::from_statements(CATALOG_VERSION, statements.iter().map(Vec::as_slice), 1024);

        let mut result = if payload.starts_with(b"abort") {
            ExecutionResult::aborted(hash, payload.to_vec())
        } else {
            ExecutionResult::committed(hash, payload.to_vec())
        };
        result.dependencies = output_deps
            .iter()
            .map(|id| Dependency {
                id: *id,
                data: payload.to_vec(),
            })
            .collect();
        result
    }

    fn complete(&mut self, txn_id: TxnHandle, commit: bool) {
        self.state.lock().completed.push((txn_id, commit));
    }
}

#[derive(Debug, Default)]
struct LogState {
    logged: Vec<TxnHandle>,
    faults: Vec<FaultRecord>,
    mp_faults: Vec<TxnHandle>,
}

/// Command log kept in memory; clones share state
#[derive(Debug, Clone, Default)]
pub struct MemoryCommandLog {
    state: Arc<Mutex<LogState>>,
}

impl MemoryCommandLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles journaled, in order
    pub fn logged(&self) -> Vec<TxnHandle> {
        self.state.lock().logged.clone()
    }

    /// Fault records written
    pub fn faults(&self) -> Vec<FaultRecord> {
        self.state.lock().faults.clone()
    }

    /// Multi-partition transactions rolled back for a fault
    pub fn mp_faults(&self) -> Vec<TxnHandle> {
        self.state.lock().mp_faults.clone()
    }
}

impl CommandLog for MemoryCommandLog {
    fn log(&mut self, handle: TxnHandle, _work: &WorkUnit) -> Result<()> {
        self.state.lock().logged.push(handle);
        Ok(())
    }

    fn log_fault(&mut self, record: FaultRecord) -> Result<()> {
        self.state.lock().faults.push(record);
        Ok(())
    }

    fn log_mp_fault(&mut self, txn_id: TxnHandle) -> Result<()> {
        self.state.lock().mp_faults.push(txn_id);
        Ok(())
    }
}

/// Mailbox that records everything it is handed
#[derive(Debug, Default)]
pub struct RecordingMailbox {
    sent: Mutex<Vec<(SiteId, Message)>>,
    responses: Mutex<Vec<ClientResponse>>,
    events: Mutex<Vec<ClusterEvent>>,
}

impl RecordingMailbox {
    /// Empty mailbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return sent messages
    pub fn take_sent(&self) -> Vec<(SiteId, Message)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Client responses so far
    pub fn responses(&self) -> Vec<ClientResponse> {
        self.responses.lock().clone()
    }

    /// Cluster events so far
    pub fn events(&self) -> Vec<ClusterEvent> {
        self.events.lock().clone()
    }
}

impl Mailbox for RecordingMailbox {
    fn send(&self, to: SiteId, message: Message) {
        self.sent.lock().push((to, message));
    }

    fn respond(&self, response: ClientResponse) {
        self.responses.lock().push(response);
    }

    fn report(&self, event: ClusterEvent) {
        self.events.lock().push(event);
    }
}

#[derive(Debug, Default)]
struct Wire {
    queue: Mutex<VecDeque<(SiteId, SiteId, Message)>>,
    responses: Mutex<Vec<ClientResponse>>,
    events: Mutex<Vec<ClusterEvent>>,
    unrouted: Mutex<Vec<(SiteId, Message)>>,
}

struct WireMailbox {
    site: SiteId,
    wire: Arc<Wire>,
}

impl Mailbox for WireMailbox {
    fn send(&self, to: SiteId, message: Message) {
        self.wire.queue.lock().push_back((self.site, to, message));
    }

    fn respond(&self, response: ClientResponse) {
        self.wire.responses.lock().push(response);
    }

    fn report(&self, event: ClusterEvent) {
        self.wire.events.lock().push(event);
    }
}

/// One site of a [`LocalCluster`]
pub struct LocalNode {
    /// The site's coordinator
    pub coordinator: PartitionCoordinator,
    /// Shared view of its engine
    pub engine: DeterministicEngine,
    /// Shared view of its command log
    pub log: MemoryCommandLog,
}

/// Several replicas of one partition on an in-memory FIFO transport
pub struct LocalCluster {
    partition: PartitionId,
    directory: Arc<ClusterDirectory>,
    topology: broadcast::Receiver<TopologyEvent>,
    nodes: BTreeMap<SiteId, LocalNode>,
    wire: Arc<Wire>,
    failed: BTreeSet<SiteId>,
    parked: Vec<WorkUnit>,
    next_client: u64,
}

impl LocalCluster {
    /// `sites` replicas on hosts `0..sites`; host 0 leads
    pub fn new(partition: PartitionId, sites: u32) -> Result<Self> {
        Self::with_config(partition, sites, |config| config)
    }

    /// Like [`Self::new`], with each site's config passed through `tune`
    pub fn with_config(
        partition: PartitionId,
        sites: u32,
        tune: impl Fn(CoordinatorConfig) -> CoordinatorConfig,
    ) -> Result<Self> {
        if sites == 0 {
            return Err(Error::config("a cluster needs at least one site"));
        }
        let members: Vec<SiteId> = (0..sites).map(|host| SiteId::new(host, 0)).collect();
        let replicas = ReplicaSet::new(members.iter().copied());
        let directory = Arc::new(ClusterDirectory::new());
        directory.set_live_sites(members.iter().copied());
        directory.install(PartitionPlacement {
            partition,
            leader: Some(members[0]),
            replicas: replicas.clone(),
        })?;
        let topology = directory.subscribe();
        let wire = Arc::new(Wire::default());
        let clock = ManualClock::new(EPOCH_MS + 1_000);

        let mut nodes = BTreeMap::new();
        for (i, site) in members.iter().enumerate() {
            let engine = DeterministicEngine::new();
            let log = MemoryCommandLog::new();
            let role = if i == 0 {
                PartitionRole::Leader
            } else {
                PartitionRole::Replica
            };
            let coordinator = PartitionCoordinator::new(
                tune(CoordinatorConfig::new(partition, *site)),
                role,
                replicas.clone(),
                Box::new(engine.clone()),
                Arc::new(WireMailbox {
                    site: *site,
                    wire: wire.clone(),
                }),
                directory.clone(),
            )?
            .with_command_log(Box::new(log.clone()))
            .with_clock(Box::new(clock.clone()), 0);
            nodes.insert(
                *site,
                LocalNode {
                    coordinator,
                    engine,
                    log,
                },
            );
        }

        Ok(Self {
            partition,
            directory,
            topology,
            nodes,
            wire,
            failed: BTreeSet::new(),
            parked: Vec::new(),
            next_client: 0,
        })
    }

    /// Site id of host `host`
    pub fn site(host: u32) -> SiteId {
        SiteId::new(host, 0)
    }

    /// Partition replicated
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// The shared directory
    pub fn directory(&self) -> &Arc<ClusterDirectory> {
        &self.directory
    }

    /// Current published leader
    pub fn leader(&self) -> Option<SiteId> {
        self.directory.leader_of(self.partition)
    }

    /// A node, failed or not
    pub fn node(&self, site: SiteId) -> Result<&LocalNode> {
        self.nodes
            .get(&site)
            .ok_or_else(|| Error::config(format!("no site {}", site)))
    }

    /// A node, mutably
    pub fn node_mut(&mut self, site: SiteId) -> Result<&mut LocalNode> {
        self.nodes
            .get_mut(&site)
            .ok_or_else(|| Error::config(format!("no site {}", site)))
    }

    /// Sites not failed
    pub fn live_sites(&self) -> Vec<SiteId> {
        self.nodes
            .keys()
            .copied()
            .filter(|s| !self.failed.contains(s))
            .collect()
    }

    /// Handles applied at `site`, in order
    pub fn applied(&self, site: SiteId) -> Result<Vec<TxnHandle>> {
        Ok(self.node(site)?.engine.applied())
    }

    /// Client responses delivered so far
    pub fn responses(&self) -> Vec<ClientResponse> {
        self.wire.responses.lock().clone()
    }

    /// Cluster events reported so far
    pub fn events(&self) -> Vec<ClusterEvent> {
        self.wire.events.lock().clone()
    }

    /// Messages addressed to the client pseudo-site that were not resubmissions
    pub fn unrouted(&self) -> Vec<(SiteId, Message)> {
        self.wire.unrouted.lock().clone()
    }

    /// Messages waiting on the wire
    pub fn in_flight(&self) -> usize {
        self.wire.queue.lock().len()
    }

    /// Queue read-write work for the current leader
    pub fn submit(&mut self, payload: &str) -> ClientHandle {
        self.next_client += 1;
        let client = ClientHandle(self.next_client);
        let work = WorkUnit::write("proc", client, CLIENT_SITE, payload.as_bytes().to_vec());
        self.route(work);
        client
    }

    /// Queue read-only work for the current leader
    pub fn submit_read(&mut self, payload: &str) -> ClientHandle {
        self.next_client += 1;
        let client = ClientHandle(self.next_client);
        let work = WorkUnit::read("read", client, CLIENT_SITE, payload.as_bytes().to_vec());
        self.route(work);
        client
    }

    /// Deliver one queued message. False when the wire is empty.
    pub fn step(&mut self) -> Result<bool> {
        self.apply_topology()?;
        let next = self.wire.queue.lock().pop_front();
        let Some((from, to, message)) = next else {
            return Ok(false);
        };
        if to == CLIENT_SITE {
            self.client_receive(from, message);
            return Ok(true);
        }
        if self.failed.contains(&to) || self.failed.contains(&from) {
            tracing::debug!(%from, %to, kind = ?message.message_type(), "Dropping message for failed site");
            return Ok(true);
        }
        match self.nodes.get_mut(&to) {
            Some(node) => node.coordinator.deliver(from, message)?,
            None => self.wire.unrouted.lock().push((to, message)),
        }
        Ok(true)
    }

    /// Deliver until the wire is empty; returns messages delivered
    pub fn pump(&mut self) -> Result<usize> {
        let mut steps = 0;
        loop {
            if self.step()? {
                steps += 1;
                if steps >= MAX_STEPS {
                    return Err(Error::internal("cluster did not quiesce"));
                }
                continue;
            }
            if self.parked.is_empty() || self.leader().is_none() {
                return Ok(steps);
            }
            for work in std::mem::take(&mut self.parked) {
                self.route(work);
            }
        }
    }

    /// Fail `site`: its traffic is dropped and it leaves every replica set
    pub fn fail_site(&mut self, site: SiteId) -> Result<()> {
        self.failed.insert(site);
        self.directory.mark_site_failed(site);
        self.apply_topology()
    }

    /// Evict `site` from the replica set while its traffic keeps flowing
    pub fn remove_replica(&mut self, site: SiteId) -> Result<()> {
        self.directory.mark_site_failed(site);
        self.apply_topology()
    }

    /// Start promotion at `site`
    pub fn promote(&mut self, site: SiteId, drain_guaranteed: bool) -> Result<PromotionHandle> {
        self.node_mut(site)?.coordinator.begin_promotion(drain_guaranteed)
    }

    /// Ask the current leader to hand over to `target`
    pub fn migrate(&mut self, target: SiteId) -> Result<()> {
        let leader = self
            .leader()
            .ok_or_else(|| Error::transient("partition has no leader"))?;
        self.node_mut(leader)?.coordinator.request_migration(target)
    }

    /// Deliver a migration reset to `site`
    pub fn reset_migration(&mut self, site: SiteId) -> Result<()> {
        let partition = self.partition;
        self.node_mut(site)?
            .coordinator
            .deliver(CLIENT_SITE, Message::MigrationReset { partition })
    }

    fn route(&mut self, work: WorkUnit) {
        match self.leader() {
            Some(leader) => self.wire.queue.lock().push_back((
                CLIENT_SITE,
                leader,
                Message::Initiate(InitiateTask {
                    handle: TxnHandle::MIN,
                    truncation: TxnHandle::MIN,
                    origin: Origin::Client,
                    work,
                }),
            )),
            None => self.parked.push(work),
        }
    }

    fn client_receive(&mut self, from: SiteId, message: Message) {
        match message {
            Message::Misrouted { original, .. } => match *original {
                Message::Initiate(task) => {
                    tracing::debug!(%from, client = %task.work.client, "Resubmitting bounced work");
                    self.parked.push(task.work);
                }
                other => self.wire.unrouted.lock().push((from, other)),
            },
            other => self.wire.unrouted.lock().push((from, other)),
        }
    }

    fn apply_topology(&mut self) -> Result<()> {
        loop {
            let event = match self.topology.try_recv() {
                Ok(event) => event,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Topology events lagged");
                    continue;
                }
                Err(_) => return Ok(()),
            };
            if event.placement.partition != self.partition {
                continue;
            }
            let replicas = event.placement.replicas;
            for (site, node) in self.nodes.iter_mut() {
                if self.failed.contains(site) || node.coordinator.replicas() == &replicas {
                    continue;
                }
                node.coordinator.on_membership_change(replicas.clone())?;
            }
        }
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("partition", &self.partition)
            .field("sites", &self.nodes.keys().collect::<Vec<_>>())
            .field("failed", &self.failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ResponseStatus;

    #[test]
    fn test_engine_hash_tracks_statements() {
        let mut engine = DeterministicEngine::new();
        let work = WorkUnit::write("p", ClientHandle(1), CLIENT_SITE, b"a;b;c".to_vec());
        let a = engine.execute(TxnHandle::from_raw(1), ExecutionRequest::Procedure(&work));
        assert_eq!(a.hash.statements.len(), 3);

        engine.set_salt(Some(9));
        let b = engine.execute(TxnHandle::from_raw(2), ExecutionRequest::Procedure(&work));
        assert!(a.hash.first_divergence(&b.hash).is_some());
        assert_eq!(engine.applied().len(), 2);
    }

    #[test]
    fn test_cluster_commits_on_every_site() {
        let mut cluster = LocalCluster::new(1, 3).unwrap();
        cluster.submit("insert 1");
        cluster.submit("insert 2");
        cluster.pump().unwrap();

        let responses = cluster.responses();
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r.status == ResponseStatus::Committed));
        let on_leader = cluster.applied(LocalCluster::site(0)).unwrap();
        for host in 1..3 {
            assert_eq!(cluster.applied(LocalCluster::site(host)).unwrap(), on_leader);
        }
    }
}
