//! Per-partition transaction coordinator
//!
//! The coordinator owns all replication state of one partition on one site:
//! handle allocation, the repair log, open duplicate counters, the migration
//! state machine and any promotion in progress. It is driven by exactly one
//! caller at a time (see [`crate::actor`]) and never blocks.
//!
//! As leader it orders work, journals it, fans a copy out to every replica and
//! opens a duplicate counter expecting the whole replica set. As replica it
//! applies leader-ordered copies strictly by handle and answers the leader.

mod dump;
mod mailbox;
mod settlement;

pub use dump::{CoordinatorDump, CoordinatorStats};
pub use mailbox::{ClientResponse, ClusterEvent, Mailbox, ResponseStatus};

use crate::config::{CoordinatorConfig, LateResponsePolicy};
use crate::duplicate_counter::{CounterDump, CounterKey, CounterState, DuplicateCounter, IgnoreReason, Offer};
use crate::engine::{CommandLog, ExecutionEngine, ExecutionHash, ExecutionRequest, ExecutionResult, FaultRecord, NoopCommandLog};
use crate::migration::{LeaderMigration, MigrationState, ResetOutcome};
use crate::promotion::{Promotion, PromotionHandle, PromotionOutcome, RepairPlan};
use crate::protocol::{
    CompleteTransaction, FragmentResponse, FragmentTask, InitiateResponse, InitiateTask, Message, Origin, WorkUnit,
};
use crate::repair_log::{RepairLog, RepairLogEntry, RepairPayload};
use crate::replay_sequencer::{IgnoredMessage, ReplaySequencer, Sequenced};
use crate::topology::CoordinationService;
use crate::types::{ClientHandle, PartitionId, PartitionRole, ReplicaSet, SiteId, TxnHandle};
use crate::unique_id::{Clock, UniqueIdGenerator};
use crate::{Error, Result};
use settlement::Settlement;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where the deduplicated result of a counter goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseDestination {
    /// Terminal response to a client
    Client { client: ClientHandle, initiator: SiteId },
    /// Fragment response to the multi-partition coordinator
    Coordinator { coordinator: SiteId },
    /// Repair work; nobody is waiting
    Nobody,
}

/// Replicated work awaiting its duplicate counter
#[derive(Debug, Clone, Copy)]
struct PendingTransaction {
    destination: ResponseDestination,
    /// Settling the counter settles the handle for truncation
    settles: bool,
}

/// Replication coordinator for one partition on one site
pub struct PartitionCoordinator {
    config: CoordinatorConfig,
    role: PartitionRole,
    replicas: ReplicaSet,
    ids: UniqueIdGenerator,
    max_seen: TxnHandle,
    repair_log: RepairLog,
    counters: BTreeMap<CounterKey, DuplicateCounter<ExecutionResult>>,
    pending: BTreeMap<CounterKey, PendingTransaction>,
    /// Multi-partition transaction id -> handle of its first fragment here
    mp_first_fragment: BTreeMap<TxnHandle, TxnHandle>,
    settlement: Settlement,
    migration: LeaderMigration,
    promotion: Option<Promotion>,
    next_request_id: u64,
    sequencer: ReplaySequencer,
    replay_complete: bool,
    reduced_safety: bool,
    engine: Box<dyn ExecutionEngine>,
    command_log: Box<dyn CommandLog>,
    mailbox: Arc<dyn Mailbox>,
    coordination: Arc<dyn CoordinationService>,
    stats: CoordinatorStats,
}

impl PartitionCoordinator {
    /// Create a coordinator in `role` over `replicas`
    pub fn new(
        config: CoordinatorConfig,
        role: PartitionRole,
        replicas: ReplicaSet,
        engine: Box<dyn ExecutionEngine>,
        mailbox: Arc<dyn Mailbox>,
        coordination: Arc<dyn CoordinationService>,
    ) -> Result<Self> {
        config.validate()?;
        let partition = config.partition;
        Ok(Self {
            ids: UniqueIdGenerator::new(partition),
            repair_log: RepairLog::new(config.repair_page_size),
            migration: LeaderMigration::new(partition),
            config,
            role,
            replicas,
            max_seen: TxnHandle::MIN,
            counters: BTreeMap::new(),
            pending: BTreeMap::new(),
            mp_first_fragment: BTreeMap::new(),
            settlement: Settlement::default(),
            promotion: None,
            next_request_id: 0,
            sequencer: ReplaySequencer::new(),
            replay_complete: true,
            reduced_safety: false,
            engine,
            command_log: Box::new(NoopCommandLog),
            mailbox,
            coordination,
            stats: CoordinatorStats::default(),
        })
    }

    /// Use a durable command log
    pub fn with_command_log(mut self, command_log: Box<dyn CommandLog>) -> Self {
        self.command_log = command_log;
        self
    }

    /// Allocate handles from `clock`, resuming a persisted offset
    pub fn with_clock(mut self, clock: Box<dyn Clock>, offset_ms: i64) -> Self {
        self.ids = UniqueIdGenerator::with_clock(self.config.partition, clock).with_offset(offset_ms);
        self
    }

    /// Start in command-log replay; fault records are withheld until [`Self::finish_replay`]
    pub fn with_replay_pending(mut self) -> Self {
        self.replay_complete = false;
        self
    }

    /// Configuration in force
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Partition served
    pub fn partition(&self) -> PartitionId {
        self.config.partition
    }

    /// Local site
    pub fn site(&self) -> SiteId {
        self.config.site
    }

    /// Local role
    pub fn role(&self) -> PartitionRole {
        self.role
    }

    /// Installed replica set
    pub fn replicas(&self) -> &ReplicaSet {
        &self.replicas
    }

    /// Highest handle applied or observed
    pub fn max_seen(&self) -> TxnHandle {
        self.max_seen
    }

    /// The repair log
    pub fn repair_log(&self) -> &RepairLog {
        &self.repair_log
    }

    /// Migration progress
    pub fn migration_state(&self) -> MigrationState {
        self.migration.state()
    }

    /// Non-determinism was detected on this partition
    pub fn is_reduced_safety(&self) -> bool {
        self.reduced_safety
    }

    /// Counters
    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    pub(crate) fn mailbox(&self) -> Arc<dyn Mailbox> {
        self.mailbox.clone()
    }

    pub(crate) fn set_mailbox(&mut self, mailbox: Arc<dyn Mailbox>) {
        self.mailbox = mailbox;
    }

    fn is_leader(&self) -> bool {
        self.role == PartitionRole::Leader
    }

    /// Accept client work. The single terminal response goes out through the mailbox.
    pub fn accept(&mut self, work: WorkUnit) -> Result<()> {
        if work.read_only {
            return self.short_circuit_read(work);
        }
        let is_leader = self.is_leader();
        if !self.migration.admits_leader_work(is_leader) {
            if is_leader {
                self.migration.on_premature_work();
            }
            let initiator = work.initiator;
            return self.bounce(initiator, Message::Initiate(client_task(work)));
        }
        self.migration.on_work_admitted();

        let handle = self.assign_handle(work.replay_handle)?;
        self.command_log.log(handle, &work)?;
        let key = CounterKey::single(handle);
        self.open_counter(
            key,
            PendingTransaction {
                destination: ResponseDestination::Client {
                    client: work.client,
                    initiator: work.initiator,
                },
                settles: true,
            },
        )?;
        self.repair_log
            .append(RepairLogEntry::single_partition(handle, work.clone()));
        self.settlement.begin(handle);

        let others = self.replicas.others(self.site());
        if !others.is_empty() {
            let copy = Message::Initiate(InitiateTask {
                handle,
                truncation: self.repair_log.truncation(),
                origin: Origin::Leader,
                work: work.clone(),
            });
            self.mailbox.send_many(&others, &copy);
        }
        self.stats.accepted += 1;

        let result = self
            .engine
            .execute(handle, ExecutionRequest::Procedure(&work));
        self.record_response(key, self.site(), result)
    }

    /// Handle one protocol message from `from`
    pub fn deliver(&mut self, from: SiteId, message: Message) -> Result<()> {
        match message {
            Message::Initiate(task) => match task.origin {
                Origin::Client => self.accept(task.work),
                Origin::Leader | Origin::Repair => self.apply_initiate(from, task),
            },
            Message::InitiateResponse(response) => {
                self.record_response(CounterKey::single(response.handle), response.site, response.result)
            }
            Message::Fragment(task) => match task.origin {
                Origin::Client => self.lead_fragment(from, task),
                Origin::Leader | Origin::Repair => self.apply_fragment(from, task),
            },
            Message::FragmentResponse(response) => self.record_response(
                CounterKey {
                    txn_id: response.txn_id,
                    handle: response.handle,
                },
                response.site,
                response.result,
            ),
            Message::Complete(complete) => match complete.origin {
                Origin::Client => self.lead_complete(from, complete),
                Origin::Leader | Origin::Repair => self.apply_complete(from, complete),
            },
            Message::MultipartSentinel { txn_id } => {
                if self.is_leader() {
                    let others = self.replicas.others(self.site());
                    self.mailbox
                        .send_many(&others, &Message::MultipartSentinel { txn_id });
                }
                Ok(())
            }
            Message::RepairLogRequest { request_id, requester } => {
                for page in self.repair_log.contents(request_id, self.site()) {
                    self.reply(requester, Message::RepairLogResponse(page))?;
                }
                Ok(())
            }
            Message::RepairLogResponse(page) => {
                let plan = match self.promotion.as_mut() {
                    Some(promotion) => promotion.on_page(page),
                    None => {
                        tracing::warn!(
                            partition = self.partition(),
                            from = %page.site,
                            request_id = page.request_id,
                            "Repair log page with no promotion in progress"
                        );
                        None
                    }
                };
                match plan {
                    Some(plan) => self.execute_plan(plan),
                    None => Ok(()),
                }
            }
            Message::LogFault { handle } => self.apply_log_fault(handle),
            Message::MigrateLeader { target, .. } => {
                if target == self.site() {
                    self.appoint_by_migration();
                    Ok(())
                } else {
                    self.request_migration(target)
                }
            }
            Message::DrainNotice { checkpoint, .. } => {
                let acknowledge = self.migration.on_drain_notice(checkpoint)?;
                self.observe(checkpoint);
                if acknowledge {
                    self.mailbox.send(
                        from,
                        Message::DrainAck {
                            partition: self.partition(),
                            checkpoint,
                        },
                    );
                }
                Ok(())
            }
            Message::DrainAck { .. } => {
                self.migration.on_drain_ack(from);
                Ok(())
            }
            Message::MigrationReset { .. } => {
                self.reset_migration();
                Ok(())
            }
            Message::Misrouted { original, .. } => {
                tracing::warn!(
                    partition = self.partition(),
                    %from,
                    kind = ?original.message_type(),
                    "Work returned as misrouted"
                );
                Ok(())
            }
            Message::Poison { txn_id, reason } => {
                tracing::debug!(partition = self.partition(), %txn_id, %reason, "Poison for a transaction not coordinated here");
                Ok(())
            }
            message @ Message::EndOfLog { .. } => {
                if self.replay_complete {
                    Ok(())
                } else {
                    self.replay(TxnHandle::MIN, message)
                }
            }
        }
    }

    /// Install a new replica set and re-evaluate everything waiting on the old one
    pub fn on_membership_change(&mut self, replicas: ReplicaSet) -> Result<()> {
        tracing::info!(
            partition = self.partition(),
            site = %self.site(),
            replicas = ?replicas.as_slice(),
            "Installing replica set"
        );
        self.replicas = replicas;
        let members = self.replicas.as_slice().to_vec();

        let keys: Vec<CounterKey> = self.counters.keys().copied().collect();
        for key in keys {
            let resolved = self
                .counters
                .get_mut(&key)
                .is_some_and(|counter| counter.update_replicas(&members).is_terminal());
            if resolved {
                self.finish_counter(key)?;
            }
        }

        let plan = self
            .promotion
            .as_mut()
            .and_then(|promotion| promotion.update_survivors(&members));
        if let Some(plan) = plan {
            self.execute_plan(plan)?;
        }

        if let MigrationState::Started { target, .. } = self.migration.state() {
            if !self.replicas.contains(target) {
                tracing::warn!(partition = self.partition(), %target, "Migration target left the replica set");
                self.reset_migration();
            }
        }

        if self.is_leader() && !self.migration.awaiting_drain() && self.replay_complete {
            self.write_fault_log()?;
        }
        self.check_migration_drain();
        Ok(())
    }

    /// Begin promotion to leader. The handle resolves once repair finishes or is cancelled.
    pub fn begin_promotion(&mut self, drain_guaranteed: bool) -> Result<PromotionHandle> {
        if self.is_leader() && !self.migration.awaiting_drain() {
            return Err(Error::internal(format!(
                "partition {} is already led by {}",
                self.partition(),
                self.site()
            )));
        }
        if let Some(previous) = self.promotion.take() {
            tracing::warn!(
                partition = self.partition(),
                request_id = previous.request_id(),
                "Superseding unfinished promotion"
            );
        }
        self.next_request_id += 1;
        let (promotion, handle) = Promotion::start(
            self.partition(),
            self.site(),
            self.next_request_id,
            self.replicas.iter().copied(),
            drain_guaranteed,
        );
        let request = promotion.request();
        let others: Vec<SiteId> = promotion
            .survivors()
            .into_iter()
            .filter(|s| *s != self.site())
            .collect();
        self.promotion = Some(promotion);
        self.mailbox.send_many(&others, &request);
        self.deliver(self.site(), request)?;
        Ok(handle)
    }

    /// Hand leadership to `target`, a live member of the replica set
    pub fn request_migration(&mut self, target: SiteId) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::Misrouted {
                partition: self.partition(),
                site: self.site(),
            });
        }
        if target == self.site() || !self.replicas.contains(target) {
            return Err(Error::config(format!(
                "{} is not a replica of partition {}",
                target,
                self.partition()
            )));
        }
        if !self.coordination.live_sites().contains(&target) {
            return Err(Error::transient(format!("migration target {} is not live", target)));
        }
        self.migration.start(true, target, self.max_seen)?;
        if let Err(e) = self.coordination.publish_leader(self.partition(), target) {
            self.migration.reset();
            return Err(e);
        }
        self.mailbox.send(
            target,
            Message::MigrateLeader {
                partition: self.partition(),
                target,
            },
        );
        self.check_migration_drain();
        Ok(())
    }

    /// Feed one command-log replay message through the replay sequencer
    pub fn replay(&mut self, unique_id: TxnHandle, message: Message) -> Result<()> {
        if let Sequenced::Deliver(message) = self.sequencer.offer(unique_id, message) {
            self.deliver_replayed(message)?;
        }
        while let Some(next) = self.sequencer.poll() {
            self.deliver_replayed(next)?;
        }
        while let Some(IgnoredMessage(ignored)) = self.sequencer.drain() {
            self.answer_ignored(ignored);
        }
        Ok(())
    }

    /// Command-log replay is over; membership changes now write fault records
    pub fn finish_replay(&mut self) {
        if !self.replay_complete {
            tracing::info!(partition = self.partition(), max_seen = %self.max_seen, "Command log replay complete");
        }
        self.replay_complete = true;
    }

    /// Diagnostic snapshot; never mutates state
    pub fn dump(&self) -> CoordinatorDump {
        CoordinatorDump {
            partition: self.partition(),
            site: self.site(),
            role: self.role,
            replicas: self.replicas.as_slice().to_vec(),
            max_seen: self.max_seen,
            last_allocated: self.ids.last(),
            clock_offset_ms: self.ids.offset_ms(),
            truncation: self.repair_log.truncation(),
            repair_log_len: self.repair_log.len(),
            counters: self.counters.values().map(CounterDump::from).collect(),
            inflight: self.settlement.inflight().collect(),
            migration: self.migration.state(),
            awaiting_drain: self.migration.awaiting_drain(),
            promotion: self.promotion.as_ref().map(Promotion::dump),
            replay_complete: self.replay_complete,
            reduced_safety: self.reduced_safety,
            stats: self.stats.clone(),
        }
    }

    fn short_circuit_read(&mut self, work: WorkUnit) -> Result<()> {
        if self.is_leader() && !self.migration.admits_leader_work(true) {
            let initiator = work.initiator;
            return self.bounce(initiator, Message::Initiate(client_task(work)));
        }
        let handle = self.max_seen;
        let result = self
            .engine
            .execute(handle, ExecutionRequest::Procedure(&work));
        self.stats.short_circuit_reads += 1;
        self.mailbox.respond(ClientResponse {
            partition: self.partition(),
            client: work.client,
            initiator: work.initiator,
            handle,
            status: status_of(&result),
            payload: result.payload,
        });
        Ok(())
    }

    fn apply_initiate(&mut self, from: SiteId, task: InitiateTask) -> Result<()> {
        if !self.accepts_replicated_work() {
            return self.bounce(from, Message::Initiate(task));
        }
        if task.handle <= self.max_seen {
            return self.skip_applied(task.origin, task.handle);
        }
        self.observe(task.handle);
        self.repair_log.truncate(task.truncation);
        self.command_log.log(task.handle, &task.work)?;
        self.repair_log
            .append(RepairLogEntry::single_partition(task.handle, task.work.clone()));
        self.stats.replicated += 1;

        let result = self
            .engine
            .execute(task.handle, ExecutionRequest::Procedure(&task.work));
        self.reply(
            from,
            Message::InitiateResponse(InitiateResponse {
                handle: task.handle,
                site: self.site(),
                client: task.work.client,
                result,
            }),
        )
    }

    fn lead_fragment(&mut self, from: SiteId, mut task: FragmentTask) -> Result<()> {
        let is_leader = self.is_leader();
        let in_progress = self.mp_first_fragment.contains_key(&task.txn_id);
        let draining_own = is_leader && !self.migration.awaiting_drain() && in_progress;
        if !self.migration.admits_leader_work(is_leader) && !draining_own {
            if is_leader {
                self.migration.on_premature_work();
            }
            return self.bounce(from, Message::Fragment(task));
        }

        if task.read_only {
            let handle = self.max_seen;
            let result = self.engine.execute(handle, ExecutionRequest::Fragment(&task));
            self.stats.short_circuit_reads += 1;
            return self.reply(
                task.coordinator,
                Message::FragmentResponse(FragmentResponse {
                    txn_id: task.txn_id,
                    handle,
                    site: self.site(),
                    result,
                }),
            );
        }

        // A fragment replayed from the command log carries its logged handle.
        let replayed = (task.handle != TxnHandle::MIN).then_some(task.handle);
        let handle = self.assign_handle(replayed)?;
        task.handle = handle;
        task.truncation = self.repair_log.truncation();
        let key = CounterKey {
            txn_id: task.txn_id,
            handle,
        };
        self.open_counter(
            key,
            PendingTransaction {
                destination: ResponseDestination::Coordinator {
                    coordinator: task.coordinator,
                },
                settles: false,
            },
        )?;
        if !in_progress {
            self.mp_first_fragment.insert(task.txn_id, handle);
            self.repair_log.append(RepairLogEntry::fragment(task.clone()));
            self.settlement.begin(handle);
        }

        let others = self.replicas.others(self.site());
        if !others.is_empty() {
            let copy = Message::Fragment(FragmentTask {
                origin: Origin::Leader,
                ..task.clone()
            });
            self.mailbox.send_many(&others, &copy);
        }
        self.stats.accepted += 1;

        let result = self.engine.execute(handle, ExecutionRequest::Fragment(&task));
        self.record_response(key, self.site(), result)
    }

    fn apply_fragment(&mut self, from: SiteId, task: FragmentTask) -> Result<()> {
        if !self.accepts_replicated_work() {
            return self.bounce(from, Message::Fragment(task));
        }
        if task.handle <= self.max_seen {
            return self.skip_applied(task.origin, task.handle);
        }
        self.observe(task.handle);
        self.repair_log.truncate(task.truncation);
        if !self.mp_first_fragment.contains_key(&task.txn_id) {
            self.mp_first_fragment.insert(task.txn_id, task.handle);
            self.repair_log.append(RepairLogEntry::fragment(task.clone()));
        }
        self.stats.replicated += 1;

        let result = self.engine.execute(task.handle, ExecutionRequest::Fragment(&task));
        self.reply(
            from,
            Message::FragmentResponse(FragmentResponse {
                txn_id: task.txn_id,
                handle: task.handle,
                site: self.site(),
                result,
            }),
        )
    }

    fn lead_complete(&mut self, from: SiteId, mut complete: CompleteTransaction) -> Result<()> {
        if !self.is_leader() || self.migration.awaiting_drain() {
            return self.bounce(from, Message::Complete(complete));
        }
        let Some(first) = self.mp_first_fragment.remove(&complete.txn_id) else {
            // Nothing was replicated here for this transaction.
            self.engine.complete(complete.txn_id, !complete.rollback);
            return Ok(());
        };
        complete.handle = first;
        complete.truncation = self.repair_log.truncation();
        self.finish_multipart(&complete)?;

        let others = self.replicas.others(self.site());
        if !others.is_empty() {
            let copy = Message::Complete(CompleteTransaction {
                origin: Origin::Leader,
                ..complete.clone()
            });
            self.mailbox.send_many(&others, &copy);
        }
        if let Some(point) = self.settlement.settle(first) {
            self.repair_log.truncate(point);
        }
        self.check_migration_drain();
        Ok(())
    }

    fn apply_complete(&mut self, from: SiteId, complete: CompleteTransaction) -> Result<()> {
        if !self.accepts_replicated_work() {
            return self.bounce(from, Message::Complete(complete));
        }
        let applied = complete.handle < self.repair_log.truncation()
            || self
                .repair_log
                .get(complete.handle)
                .is_some_and(RepairLogEntry::is_terminal);
        if applied {
            return self.skip_applied(complete.origin, complete.handle);
        }
        self.mp_first_fragment.remove(&complete.txn_id);
        self.repair_log.truncate(complete.truncation);
        self.finish_multipart(&complete)
    }

    fn finish_multipart(&mut self, complete: &CompleteTransaction) -> Result<()> {
        self.engine.complete(complete.txn_id, !complete.rollback);
        if complete.rollback_for_fault {
            self.command_log.log_mp_fault(complete.txn_id)?;
        }
        self.repair_log.append(RepairLogEntry::complete(complete.clone()));
        Ok(())
    }

    fn apply_log_fault(&mut self, handle: TxnHandle) -> Result<()> {
        if handle <= self.max_seen {
            tracing::debug!(partition = self.partition(), %handle, "Fault marker already covered");
            return Ok(());
        }
        self.observe(handle);
        self.command_log.log_fault(FaultRecord {
            site: self.site(),
            replicas: self.replicas.as_slice().to_vec(),
            partition: self.partition(),
            handle,
        })
    }

    fn write_fault_log(&mut self) -> Result<()> {
        let handle = self.assign_handle(None)?;
        self.repair_log.observe(handle);
        self.command_log.log_fault(FaultRecord {
            site: self.site(),
            replicas: self.replicas.as_slice().to_vec(),
            partition: self.partition(),
            handle,
        })?;
        let others = self.replicas.others(self.site());
        self.mailbox.send_many(&others, &Message::LogFault { handle });
        Ok(())
    }

    fn record_response(&mut self, key: CounterKey, site: SiteId, result: ExecutionResult) -> Result<()> {
        let policy = self.config.late_response_policy;
        let partition = self.partition();
        let Some(counter) = self.counters.get_mut(&key) else {
            self.stats.ignored_responses += 1;
            if policy == LateResponsePolicy::Fatal && !self.replicas.contains(site) {
                return Err(Error::invariant(format!(
                    "partition {} response from departed site {} for {}",
                    partition, site, key.handle
                )));
            }
            tracing::debug!(partition, %site, handle = %key.handle, "Response for a settled transaction");
            return Ok(());
        };

        let hash = result.hash.clone();
        let status = result.status;
        match counter.offer(site, hash, status, result) {
            Offer::Counted(CounterState::Waiting) => Ok(()),
            Offer::Counted(_) => self.finish_counter(key),
            Offer::Ignored(reason) => {
                self.stats.ignored_responses += 1;
                let departed = matches!(reason, IgnoreReason::Dropped | IgnoreReason::NotExpected);
                if departed && policy == LateResponsePolicy::Fatal {
                    return Err(Error::invariant(format!(
                        "partition {} response from {} not expected for {} ({:?})",
                        partition, site, key.handle, reason
                    )));
                }
                tracing::warn!(partition, %site, handle = %key.handle, ?reason, "Response not counted");
                Ok(())
            }
        }
    }

    fn finish_counter(&mut self, key: CounterKey) -> Result<()> {
        let Some(counter) = self.counters.remove(&key) else {
            return Ok(());
        };
        let pending = self.pending.remove(&key);
        self.stats.settled += 1;

        let state = counter.state();
        if matches!(state, CounterState::Mismatch | CounterState::Abort) {
            self.stats.nondeterministic += 1;
            self.reduced_safety = true;
            let divergence = counter.divergence();
            tracing::error!(
                partition = self.partition(),
                handle = %key.handle,
                ?state,
                ?divergence,
                "Replicas disagree on transaction result"
            );
            self.mailbox.report(ClusterEvent::Nondeterminism {
                partition: self.partition(),
                handle: key.handle,
                state,
                divergence,
            });
        }
        if counter.resolved_empty() {
            self.stats.empty_resolutions += 1;
            tracing::warn!(
                partition = self.partition(),
                handle = %key.handle,
                "Transaction resolved with no responses after replica set change"
            );
        }
        let response = counter.into_response();

        let Some(pending) = pending else {
            return Ok(());
        };
        if pending.settles {
            if let Some(point) = self.settlement.settle(key.handle) {
                self.repair_log.truncate(point);
            }
        }
        match pending.destination {
            ResponseDestination::Client { client, initiator } => {
                let (status, payload) = match response {
                    Some(result) => (status_of(&result), result.payload),
                    None => (ResponseStatus::Ignored, Vec::new()),
                };
                self.mailbox.respond(ClientResponse {
                    partition: self.partition(),
                    client,
                    initiator,
                    handle: key.handle,
                    status,
                    payload,
                });
            }
            ResponseDestination::Coordinator { coordinator } => match response {
                Some(result) => self.mailbox.send(
                    coordinator,
                    Message::FragmentResponse(FragmentResponse {
                        txn_id: key.txn_id,
                        handle: key.handle,
                        site: self.site(),
                        result,
                    }),
                ),
                None => tracing::warn!(
                    partition = self.partition(),
                    txn_id = %key.txn_id,
                    "Fragment resolved without a result to forward"
                ),
            },
            ResponseDestination::Nobody => {}
        }
        self.check_migration_drain();
        Ok(())
    }

    fn execute_plan(&mut self, plan: RepairPlan) -> Result<()> {
        let Some(mut promotion) = self.promotion.take() else {
            return Ok(());
        };
        if !promotion.begin_sending() {
            promotion.resolve(Err(Error::cancelled(format!(
                "promotion {} cancelled before repair",
                plan.request_id
            ))));
            return Ok(());
        }

        let local = self.site();
        let others: Vec<SiteId> = plan
            .survivors
            .iter()
            .copied()
            .filter(|s| *s != local)
            .collect();
        let mut repaired = 0;
        for planned in &plan.repairs {
            let messages = planned.entry.repair_messages(self.repair_log.truncation());
            for message in &messages {
                self.mailbox.send_many(&others, message);
            }
            if let Some(key) = repair_counter_key(&planned.entry) {
                if !planned.needs_repair.is_empty() && !self.counters.contains_key(&key) {
                    let settles = matches!(planned.entry.payload, RepairPayload::SinglePartition(_));
                    self.counters.insert(
                        key,
                        DuplicateCounter::new(key, local, planned.needs_repair.iter().copied()),
                    );
                    self.pending.insert(
                        key,
                        PendingTransaction {
                            destination: ResponseDestination::Nobody,
                            settles,
                        },
                    );
                    if settles {
                        self.settlement.begin(planned.entry.handle);
                    }
                }
            }
            if planned.needs_repair.contains(&local) {
                for message in messages {
                    self.deliver(local, message)?;
                }
            }
            repaired += 1;
        }

        self.observe(plan.max_handle);
        self.role = PartitionRole::Leader;
        if let Err(e) = self.coordination.publish_leader(self.partition(), local) {
            self.role = PartitionRole::Replica;
            promotion.resolve(Err(e));
            return Ok(());
        }
        let outcome = PromotionOutcome {
            request_id: plan.request_id,
            max_handle: self.max_seen,
            repaired,
        };
        self.mailbox.report(ClusterEvent::LeaderPromoted {
            partition: self.partition(),
            site: local,
            max_handle: outcome.max_handle,
        });
        promotion.resolve(Ok(outcome));
        if self.replay_complete {
            self.write_fault_log()?;
        }
        Ok(())
    }

    fn appoint_by_migration(&mut self) {
        tracing::info!(partition = self.partition(), site = %self.site(), "Appointed leader by migration");
        self.role = PartitionRole::Leader;
        self.migration.expect_drain();
    }

    fn reset_migration(&mut self) {
        match self.migration.reset() {
            ResetOutcome::ReinstateLeader => {
                self.role = PartitionRole::Leader;
                if let Err(e) = self.coordination.publish_leader(self.partition(), self.site()) {
                    tracing::warn!(partition = self.partition(), error = %e, "Could not republish leader after reset");
                }
            }
            ResetOutcome::AbandonCandidacy => self.role = PartitionRole::Replica,
            ResetOutcome::Idle => {}
        }
    }

    fn check_migration_drain(&mut self) {
        if let Some((target, checkpoint)) = self.migration.check_drained(self.settlement.min_inflight()) {
            self.role = PartitionRole::Replica;
            self.mailbox.send(
                target,
                Message::DrainNotice {
                    partition: self.partition(),
                    checkpoint,
                },
            );
        }
    }

    fn deliver_replayed(&mut self, message: Message) -> Result<()> {
        let from = match &message {
            Message::Fragment(task) => task.coordinator,
            Message::Complete(complete) => complete.coordinator,
            _ => self.site(),
        };
        self.deliver(from, message)
    }

    fn answer_ignored(&mut self, message: Message) {
        match message {
            Message::Initiate(task) => self.mailbox.respond(ClientResponse {
                partition: self.partition(),
                client: task.work.client,
                initiator: task.work.initiator,
                handle: TxnHandle::MIN,
                status: ResponseStatus::Ignored,
                payload: Vec::new(),
            }),
            Message::Fragment(task) => self.mailbox.send(
                task.coordinator,
                Message::FragmentResponse(FragmentResponse {
                    txn_id: task.txn_id,
                    handle: TxnHandle::MIN,
                    site: self.site(),
                    result: ExecutionResult::aborted(ExecutionHash::default(), Vec::new()),
                }),
            ),
            other => {
                tracing::debug!(partition = self.partition(), kind = ?other.message_type(), "Dropping unordered replay message")
            }
        }
    }

    fn accepts_replicated_work(&self) -> bool {
        !self.is_leader() || self.migration.awaiting_drain()
    }

    fn assign_handle(&mut self, replayed: Option<TxnHandle>) -> Result<TxnHandle> {
        let handle = match replayed {
            Some(handle) => {
                self.ids.observe(handle);
                handle
            }
            None => self.ids.next()?,
        };
        if handle <= self.max_seen {
            return Err(Error::invariant(format!(
                "partition {} handle {} is not above {}",
                self.partition(),
                handle,
                self.max_seen
            )));
        }
        self.max_seen = handle;
        Ok(handle)
    }

    fn observe(&mut self, handle: TxnHandle) {
        if handle > self.max_seen {
            self.max_seen = handle;
        }
        self.ids.observe(handle);
        self.repair_log.observe(handle);
    }

    fn open_counter(&mut self, key: CounterKey, pending: PendingTransaction) -> Result<()> {
        if self.counters.contains_key(&key) {
            return Err(Error::invariant(format!(
                "partition {} tracking key collision at {}/{}",
                self.partition(),
                key.txn_id,
                key.handle
            )));
        }
        let mut expected = self.replicas.as_slice().to_vec();
        if !expected.contains(&self.site()) {
            expected.push(self.site());
        }
        self.counters
            .insert(key, DuplicateCounter::new(key, self.site(), expected));
        self.pending.insert(key, pending);
        Ok(())
    }

    fn skip_applied(&mut self, origin: Origin, handle: TxnHandle) -> Result<()> {
        match origin {
            Origin::Repair => {
                self.stats.repairs_skipped += 1;
                tracing::debug!(partition = self.partition(), %handle, "Repair for an applied handle");
                Ok(())
            }
            Origin::Leader | Origin::Client => Err(Error::invariant(format!(
                "partition {} received {} at or below last seen {}",
                self.partition(),
                handle,
                self.max_seen
            ))),
        }
    }

    fn reply(&mut self, to: SiteId, message: Message) -> Result<()> {
        if to == self.site() {
            self.deliver(to, message)
        } else {
            self.mailbox.send(to, message);
            Ok(())
        }
    }

    fn bounce(&mut self, to: SiteId, original: Message) -> Result<()> {
        self.stats.misrouted += 1;
        tracing::debug!(
            partition = self.partition(),
            %to,
            kind = ?original.message_type(),
            "Returning misrouted work"
        );
        self.mailbox.send(
            to,
            Message::Misrouted {
                partition: self.partition(),
                original: Box::new(original),
            },
        );
        Ok(())
    }
}

impl std::fmt::Debug for PartitionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionCoordinator")
            .field("partition", &self.config.partition)
            .field("site", &self.config.site)
            .field("role", &self.role)
            .field("max_seen", &self.max_seen)
            .field("open_counters", &self.counters.len())
            .finish()
    }
}

fn client_task(work: WorkUnit) -> InitiateTask {
    InitiateTask {
        handle: TxnHandle::MIN,
        truncation: TxnHandle::MIN,
        origin: Origin::Client,
        work,
    }
}

fn status_of(result: &ExecutionResult) -> ResponseStatus {
    if result.is_committed() {
        ResponseStatus::Committed
    } else {
        ResponseStatus::Aborted
    }
}

fn repair_counter_key(entry: &RepairLogEntry) -> Option<CounterKey> {
    match &entry.payload {
        RepairPayload::SinglePartition(_) => Some(CounterKey::single(entry.handle)),
        RepairPayload::Fragment(task) => Some(CounterKey {
            txn_id: task.txn_id,
            handle: entry.handle,
        }),
        RepairPayload::Complete { .. } => None,
    }
}
