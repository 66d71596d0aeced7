//! Multi-partition transaction coordinator
//!
//! Sends fragments to partition leaders, collects their deduplicated fragment
//! responses, and finishes each transaction with a completion message. The
//! wait for responses has no hard limit: a slow partition only produces a
//! periodic "possible deadlock" warning. The wait ends early on an explicit
//! poison, an aborted fragment, or a leader change on a partition that still
//! owes a response.

use crate::coordinator::Mailbox;
use crate::engine::Dependency;
use crate::protocol::{CompleteTransaction, FragmentResponse, FragmentTask, Message, Origin};
use crate::types::{MP_PARTITION_ID, PartitionId, SiteId, TxnHandle};
use crate::unique_id::UniqueIdGenerator;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Inbound events for the multi-partition coordinator
#[derive(Debug, Clone)]
pub enum MpEvent {
    /// A partition leader answered a fragment
    Response(FragmentResponse),
    /// Terminate a transaction
    Poison {
        /// Transaction to terminate
        txn_id: TxnHandle,
        /// Reason
        reason: String,
    },
    /// A partition has a new leader
    LeaderChanged {
        /// Partition
        partition: PartitionId,
        /// New leader
        site: SiteId,
    },
}

impl MpEvent {
    /// Extract the event carried by a protocol message, if any
    pub fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::FragmentResponse(response) => Some(Self::Response(response)),
            Message::Poison { txn_id, reason } => Some(Self::Poison { txn_id, reason }),
            _ => None,
        }
    }
}

/// Outstanding responses and collected dependencies of one fragment round
#[derive(Debug, Clone)]
pub struct DependencyTracker {
    txn_id: TxnHandle,
    outstanding: BTreeMap<PartitionId, SiteId>,
    collected: BTreeMap<u32, Vec<Dependency>>,
}

impl DependencyTracker {
    /// Track one response from each partition in `outstanding`
    pub fn new(txn_id: TxnHandle, outstanding: impl IntoIterator<Item = (PartitionId, SiteId)>) -> Self {
        Self {
            txn_id,
            outstanding: outstanding.into_iter().collect(),
            collected: BTreeMap::new(),
        }
    }

    /// Transaction tracked
    pub fn txn_id(&self) -> TxnHandle {
        self.txn_id
    }

    /// Partitions still owing a response
    pub fn outstanding(&self) -> Vec<PartitionId> {
        self.outstanding.keys().copied().collect()
    }

    /// Whether `partition` still owes a response
    pub fn awaits(&self, partition: PartitionId) -> bool {
        self.outstanding.contains_key(&partition)
    }

    /// Record a response; true once every partition has answered
    pub fn offer(&mut self, response: FragmentResponse) -> bool {
        let partition = self
            .outstanding
            .iter()
            .find(|(_, site)| **site == response.site)
            .map(|(partition, _)| *partition);
        match partition {
            Some(partition) => {
                self.outstanding.remove(&partition);
                for dependency in response.result.dependencies {
                    self.collected.entry(dependency.id).or_default().push(dependency);
                }
            }
            None => tracing::debug!(txn_id = %self.txn_id, site = %response.site, "Unexpected fragment response"),
        }
        self.outstanding.is_empty()
    }

    /// Dependencies by id
    pub fn into_dependencies(self) -> BTreeMap<u32, Vec<Dependency>> {
        self.collected
    }
}

/// Coordinator of multi-partition transactions
pub struct MultipartCoordinator {
    local: SiteId,
    leaders: BTreeMap<PartitionId, SiteId>,
    soft_timeout: Duration,
    mailbox: Arc<dyn Mailbox>,
    ids: UniqueIdGenerator,
    inbox_tx: Sender<MpEvent>,
    inbox: Receiver<MpEvent>,
}

impl MultipartCoordinator {
    /// Create a coordinator at `local` over the given partition leaders
    pub fn new(
        local: SiteId,
        leaders: impl IntoIterator<Item = (PartitionId, SiteId)>,
        soft_timeout: Duration,
        mailbox: Arc<dyn Mailbox>,
    ) -> Self {
        let (inbox_tx, inbox) = unbounded();
        Self {
            local,
            leaders: leaders.into_iter().collect(),
            soft_timeout,
            mailbox,
            ids: UniqueIdGenerator::new(MP_PARTITION_ID),
            inbox_tx,
            inbox,
        }
    }

    /// Sender the transport uses to deliver events
    pub fn inbox(&self) -> Sender<MpEvent> {
        self.inbox_tx.clone()
    }

    /// Current leader of `partition`
    pub fn leader_of(&self, partition: PartitionId) -> Option<SiteId> {
        self.leaders.get(&partition).copied()
    }

    /// Record a new leader for `partition`
    pub fn update_leader(&mut self, partition: PartitionId, site: SiteId) {
        self.leaders.insert(partition, site);
    }

    /// Allocate a transaction id and announce it to every involved leader
    pub fn begin(&mut self, partitions: &[PartitionId]) -> Result<TxnHandle> {
        let txn_id = self.ids.next()?;
        for partition in partitions {
            let leader = self.leader(*partition)?;
            self.mailbox.send(leader, Message::MultipartSentinel { txn_id });
        }
        Ok(txn_id)
    }

    /// Send one fragment to each partition's leader and start tracking the round
    pub fn send_fragments(
        &self,
        txn_id: TxnHandle,
        partitions: &[PartitionId],
        output_dep: u32,
        payload: &[u8],
        read_only: bool,
    ) -> Result<DependencyTracker> {
        let mut outstanding = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let leader = self.leader(*partition)?;
            self.mailbox.send(
                leader,
                Message::Fragment(FragmentTask {
                    txn_id,
                    handle: TxnHandle::MIN,
                    coordinator: self.local,
                    origin: Origin::Client,
                    truncation: TxnHandle::MIN,
                    read_only,
                    output_deps: vec![output_dep],
                    payload: payload.to_vec(),
                }),
            );
            outstanding.push((*partition, leader));
        }
        Ok(DependencyTracker::new(txn_id, outstanding))
    }

    /// Block until every partition in `tracker` answers
    pub fn wait_for(&mut self, mut tracker: DependencyTracker) -> Result<BTreeMap<u32, Vec<Dependency>>> {
        let mut waited = Duration::ZERO;
        loop {
            match self.inbox.recv_timeout(self.soft_timeout) {
                Ok(MpEvent::Response(response)) if response.txn_id == tracker.txn_id() => {
                    if !response.result.is_committed() {
                        return Err(Error::terminated(format!(
                            "fragment of {} aborted at {}",
                            tracker.txn_id(),
                            response.site
                        )));
                    }
                    if tracker.offer(response) {
                        return Ok(tracker.into_dependencies());
                    }
                }
                Ok(MpEvent::Response(response)) => {
                    tracing::debug!(txn_id = %response.txn_id, site = %response.site, "Response for another transaction");
                }
                Ok(MpEvent::Poison { txn_id, reason }) if txn_id == tracker.txn_id() => {
                    return Err(Error::terminated(format!("{}: {}", txn_id, reason)));
                }
                Ok(MpEvent::Poison { txn_id, .. }) => {
                    tracing::debug!(%txn_id, "Poison for another transaction");
                }
                Ok(MpEvent::LeaderChanged { partition, site }) => {
                    self.update_leader(partition, site);
                    if tracker.awaits(partition) {
                        return Err(Error::transient(format!(
                            "partition {} changed leader to {} during {}",
                            partition,
                            site,
                            tracker.txn_id()
                        )));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    waited += self.soft_timeout;
                    tracing::warn!(
                        txn_id = %tracker.txn_id(),
                        waited_ms = waited.as_millis() as u64,
                        outstanding = ?tracker.outstanding(),
                        "Multi-partition transaction still waiting on fragment responses, possible deadlock"
                    );
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::channel_closed("multi-partition inbox"));
                }
            }
        }
    }

    /// Finish `txn_id` on every involved partition
    pub fn complete(
        &self,
        txn_id: TxnHandle,
        partitions: &[PartitionId],
        rollback: bool,
        rollback_for_fault: bool,
    ) -> Result<()> {
        for partition in partitions {
            let leader = self.leader(*partition)?;
            self.mailbox.send(
                leader,
                Message::Complete(CompleteTransaction {
                    txn_id,
                    handle: TxnHandle::MIN,
                    coordinator: self.local,
                    rollback,
                    rollback_for_fault,
                    origin: Origin::Client,
                    truncation: TxnHandle::MIN,
                }),
            );
        }
        Ok(())
    }

    fn leader(&self, partition: PartitionId) -> Result<SiteId> {
        self.leaders
            .get(&partition)
            .copied()
            .ok_or_else(|| Error::transient(format!("partition {} has no leader", partition)))
    }
}

impl std::fmt::Debug for MultipartCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartCoordinator")
            .field("local", &self.local)
            .field("leaders", &self.leaders)
            .field("soft_timeout", &self.soft_timeout)
            .finish()
    }
}
