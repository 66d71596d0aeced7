//! Single-queue runtime for a partition coordinator
//!
//! [`spawn`] moves a [`PartitionCoordinator`] into a tokio task. Everything
//! that touches it (client work, protocol messages, membership changes,
//! promotion, dumps) goes through one mpsc queue, so state is only ever
//! mutated by one message handler at a time.
//!
//! ```text
//!   PartitionHandle ──► mpsc ──► actor task ──► PartitionCoordinator
//!        ▲                                         │
//!        └──── oneshot (ClientResponse) ◄── ResponseRouter (Mailbox)
//! ```

use crate::coordinator::{
    ClientResponse, ClusterEvent, CoordinatorDump, Mailbox, PartitionCoordinator, ResponseStatus,
};
use crate::promotion::PromotionHandle;
use crate::protocol::{Message, WorkUnit};
use crate::types::{ClientHandle, PartitionId, ReplicaSet, SiteId, TxnHandle};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::thread::ThreadId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Owners {
    partitions: HashMap<PartitionId, ThreadId>,
    threads: HashMap<ThreadId, PartitionId>,
}

/// Shared record of which thread is executing which partition.
///
/// Passed explicitly to every actor that should be checked together, so
/// independent clusters in one process do not interfere.
#[derive(Debug, Clone, Default)]
pub struct OwnerRegistry {
    owners: Arc<Mutex<Owners>>,
}

impl OwnerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `partition` for the current thread until the guard drops
    pub fn enter(&self, partition: PartitionId) -> Result<OwnerGuard> {
        let thread = std::thread::current().id();
        let mut owners = self.owners.lock();
        if let Some(holder) = owners.partitions.get(&partition) {
            return Err(Error::invariant(format!(
                "partition {} already executing on {:?}",
                partition, holder
            )));
        }
        if let Some(other) = owners.threads.get(&thread) {
            return Err(Error::invariant(format!(
                "thread {:?} entering partition {} while executing partition {}",
                thread, partition, other
            )));
        }
        owners.partitions.insert(partition, thread);
        owners.threads.insert(thread, partition);
        Ok(OwnerGuard {
            owners: self.owners.clone(),
            partition,
            thread,
        })
    }

    /// Partitions currently executing
    pub fn active(&self) -> Vec<PartitionId> {
        self.owners.lock().partitions.keys().copied().collect()
    }
}

/// Releases a partition claim on drop
#[derive(Debug)]
pub struct OwnerGuard {
    owners: Arc<Mutex<Owners>>,
    partition: PartitionId,
    thread: ThreadId,
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        let mut owners = self.owners.lock();
        owners.partitions.remove(&self.partition);
        owners.threads.remove(&self.thread);
    }
}

/// Client handles are only unique per initiating site
type WaiterKey = (SiteId, ClientHandle);

/// Mailbox wrapper that hands client responses back to waiting callers
struct ResponseRouter {
    inner: Arc<dyn Mailbox>,
    waiting: Mutex<HashMap<WaiterKey, oneshot::Sender<ClientResponse>>>,
}

impl ResponseRouter {
    fn new(inner: Arc<dyn Mailbox>) -> Self {
        Self {
            inner,
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Register `reply` for `work`. Hands `reply` back when the same client is already waiting.
    fn wait(
        &self,
        work: &WorkUnit,
        reply: oneshot::Sender<ClientResponse>,
    ) -> std::result::Result<(), oneshot::Sender<ClientResponse>> {
        match self.waiting.lock().entry((work.initiator, work.client)) {
            Entry::Occupied(_) => Err(reply),
            Entry::Vacant(slot) => {
                slot.insert(reply);
                Ok(())
            }
        }
    }

    fn fail(&self, partition: PartitionId, work: &WorkUnit, error: &Error) {
        self.respond(aborted(partition, work, error));
    }
}

fn aborted(partition: PartitionId, work: &WorkUnit, error: &Error) -> ClientResponse {
    ClientResponse {
        partition,
        client: work.client,
        initiator: work.initiator,
        handle: TxnHandle::MIN,
        status: ResponseStatus::Aborted,
        payload: error.to_string().into_bytes(),
    }
}

impl Mailbox for ResponseRouter {
    fn send(&self, to: SiteId, message: Message) {
        if let Message::Misrouted { partition, original } = &message {
            if let Message::Initiate(task) = original.as_ref() {
                let waiter = self
                    .waiting
                    .lock()
                    .remove(&(task.work.initiator, task.work.client));
                if let Some(reply) = waiter {
                    let _ = reply.send(ClientResponse {
                        partition: *partition,
                        client: task.work.client,
                        initiator: task.work.initiator,
                        handle: TxnHandle::MIN,
                        status: ResponseStatus::Restart,
                        payload: Vec::new(),
                    });
                    return;
                }
            }
        }
        self.inner.send(to, message);
    }

    fn respond(&self, response: ClientResponse) {
        let waiter = self
            .waiting
            .lock()
            .remove(&(response.initiator, response.client));
        match waiter {
            Some(reply) => {
                let _ = reply.send(response);
            }
            None => self.inner.respond(response),
        }
    }

    fn report(&self, event: ClusterEvent) {
        self.inner.report(event);
    }
}

enum Envelope {
    Accept {
        work: WorkUnit,
        reply: oneshot::Sender<ClientResponse>,
    },
    Deliver {
        from: SiteId,
        message: Message,
    },
    UpdateReplicas {
        replicas: ReplicaSet,
        reply: oneshot::Sender<Result<()>>,
    },
    BeginPromotion {
        drain_guaranteed: bool,
        reply: oneshot::Sender<Result<PromotionHandle>>,
    },
    RequestMigration {
        target: SiteId,
        reply: oneshot::Sender<Result<()>>,
    },
    Replay {
        unique_id: TxnHandle,
        message: Message,
    },
    Dump {
        reply: oneshot::Sender<CoordinatorDump>,
    },
    Shutdown,
}

/// Cloneable front door of a running partition actor
#[derive(Clone)]
pub struct PartitionHandle {
    partition: PartitionId,
    tx: mpsc::Sender<Envelope>,
}

impl PartitionHandle {
    /// Partition served
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Submit client work; resolves with its single terminal response
    pub async fn accept(&self, work: WorkUnit) -> Result<ClientResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Envelope::Accept { work, reply }).await?;
        rx.await
            .map_err(|_| Error::channel_closed("partition actor dropped the response"))
    }

    /// Deliver a protocol message
    pub async fn deliver(&self, from: SiteId, message: Message) -> Result<()> {
        self.send(Envelope::Deliver { from, message }).await
    }

    /// Install a new replica set
    pub async fn update_replicas(&self, replicas: ReplicaSet) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Envelope::UpdateReplicas { replicas, reply }).await?;
        Self::answer(rx).await?
    }

    /// Begin promotion to leader
    pub async fn begin_promotion(&self, drain_guaranteed: bool) -> Result<PromotionHandle> {
        let (reply, rx) = oneshot::channel();
        self.send(Envelope::BeginPromotion {
            drain_guaranteed,
            reply,
        })
        .await?;
        Self::answer(rx).await?
    }

    /// Hand leadership to `target`
    pub async fn request_migration(&self, target: SiteId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Envelope::RequestMigration { target, reply }).await?;
        Self::answer(rx).await?
    }

    /// Feed one command-log replay message
    pub async fn replay(&self, unique_id: TxnHandle, message: Message) -> Result<()> {
        self.send(Envelope::Replay { unique_id, message }).await
    }

    /// Diagnostic snapshot
    pub async fn dump(&self) -> Result<CoordinatorDump> {
        let (reply, rx) = oneshot::channel();
        self.send(Envelope::Dump { reply }).await?;
        Self::answer(rx).await
    }

    /// Stop the actor after queued work
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Envelope::Shutdown).await
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| Error::channel_closed(format!("partition {} actor stopped", self.partition)))
    }

    async fn answer<T>(rx: oneshot::Receiver<T>) -> Result<T> {
        rx.await
            .map_err(|_| Error::channel_closed("partition actor dropped the reply"))
    }
}

impl std::fmt::Debug for PartitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionHandle")
            .field("partition", &self.partition)
            .finish()
    }
}

/// Run `coordinator` as a tokio task. The task ends on shutdown, when every
/// handle is dropped, or with the error that made it stop.
pub fn spawn(
    mut coordinator: PartitionCoordinator,
    registry: OwnerRegistry,
) -> (PartitionHandle, JoinHandle<Result<()>>) {
    let partition = coordinator.partition();
    let (tx, rx) = mpsc::channel(coordinator.config().mailbox_capacity);
    let router = Arc::new(ResponseRouter::new(coordinator.mailbox()));
    coordinator.set_mailbox(router.clone());
    let task = tokio::spawn(run(coordinator, rx, registry, router));
    (PartitionHandle { partition, tx }, task)
}

async fn run(
    mut coordinator: PartitionCoordinator,
    mut rx: mpsc::Receiver<Envelope>,
    registry: OwnerRegistry,
    router: Arc<ResponseRouter>,
) -> Result<()> {
    let partition = coordinator.partition();
    let site = coordinator.site();
    tracing::info!(partition, %site, "Partition actor started");

    while let Some(envelope) = rx.recv().await {
        let outcome = registry
            .enter(partition)
            .and_then(|_owner| handle(&mut coordinator, &router, envelope));
        match outcome {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) if e.is_fatal() => {
                tracing::error!(partition, %site, error = %e, "Partition stopped on invariant violation");
                router.report(ClusterEvent::Fatal {
                    partition,
                    site,
                    error: e.to_string(),
                });
                return Err(e);
            }
            Err(e) => tracing::warn!(partition, %site, error = %e, "Message handling failed"),
        }
    }

    tracing::info!(partition, %site, "Partition actor stopped");
    Ok(())
}

/// Handle one envelope; false stops the actor
fn handle(coordinator: &mut PartitionCoordinator, router: &ResponseRouter, envelope: Envelope) -> Result<bool> {
    match envelope {
        Envelope::Accept { work, reply } => {
            if let Err(reply) = router.wait(&work, reply) {
                let e = Error::transient(format!(
                    "{} from {} already has work in flight",
                    work.client, work.initiator
                ));
                tracing::warn!(partition = coordinator.partition(), error = %e, "Rejecting duplicate client handle");
                let _ = reply.send(aborted(coordinator.partition(), &work, &e));
                return Ok(true);
            }
            let failed = work.clone();
            if let Err(e) = coordinator.accept(work) {
                router.fail(coordinator.partition(), &failed, &e);
                return Err(e);
            }
        }
        Envelope::Deliver { from, message } => coordinator.deliver(from, message)?,
        Envelope::UpdateReplicas { replicas, reply } => {
            reply_with(reply, coordinator.on_membership_change(replicas))?
        }
        Envelope::BeginPromotion {
            drain_guaranteed,
            reply,
        } => reply_with(reply, coordinator.begin_promotion(drain_guaranteed))?,
        Envelope::RequestMigration { target, reply } => {
            reply_with(reply, coordinator.request_migration(target))?
        }
        Envelope::Replay { unique_id, message } => coordinator.replay(unique_id, message)?,
        Envelope::Dump { reply } => {
            let _ = reply.send(coordinator.dump());
        }
        Envelope::Shutdown => return Ok(false),
    }
    Ok(true)
}

/// Answer the caller; a fatal error is also returned so the actor stops
fn reply_with<T>(reply: oneshot::Sender<Result<T>>, result: Result<T>) -> Result<()> {
    match result {
        Err(e) if e.is_fatal() => {
            let _ = reply.send(Err(Error::invariant(e.to_string())));
            Err(e)
        }
        other => {
            let _ = reply.send(other);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::engine::{ExecutionEngine, ExecutionRequest};
    use crate::protocol::InitiateResponse;
    use crate::testing::{DeterministicEngine, RecordingMailbox};
    use crate::topology::{ClusterDirectory, PartitionPlacement};
    use crate::types::PartitionRole;
    use std::time::Duration;

    fn site(n: u32) -> SiteId {
        SiteId::new(n, 0)
    }

    fn coordinator(local: u32, role: PartitionRole, members: &[u32]) -> (PartitionCoordinator, Arc<RecordingMailbox>) {
        let replicas: ReplicaSet = members.iter().map(|n| site(*n)).collect();
        let directory = Arc::new(ClusterDirectory::new());
        directory.set_live_sites(replicas.iter().copied());
        directory
            .install(PartitionPlacement {
                partition: 2,
                leader: Some(site(members[0])),
                replicas: replicas.clone(),
            })
            .unwrap();
        let mailbox = Arc::new(RecordingMailbox::new());
        let coordinator = PartitionCoordinator::new(
            CoordinatorConfig::new(2, site(local)),
            role,
            replicas,
            Box::new(DeterministicEngine::new()),
            mailbox.clone(),
            directory,
        )
        .unwrap();
        (coordinator, mailbox)
    }

    fn work(client: u64, payload: &str) -> WorkUnit {
        WorkUnit::write("proc", ClientHandle(client), site(100), payload.as_bytes().to_vec())
    }

    #[test]
    fn test_registry_single_owner() {
        let registry = OwnerRegistry::new();
        let guard = registry.enter(1).unwrap();
        assert!(registry.enter(1).unwrap_err().is_fatal());
        // Same thread may not hold two partitions at once.
        assert!(registry.enter(2).is_err());
        drop(guard);
        assert!(registry.enter(2).is_ok());
        assert!(registry.active().is_empty());
    }

    #[test]
    fn test_independent_registries_do_not_interfere() {
        let a = OwnerRegistry::new();
        let b = OwnerRegistry::new();
        let _ga = a.enter(1).unwrap();
        let _gb = b.enter(1).unwrap();
    }

    #[tokio::test]
    async fn test_single_site_accept_resolves() {
        let (coordinator, _mailbox) = coordinator(0, PartitionRole::Leader, &[0]);
        let (handle, task) = spawn(coordinator, OwnerRegistry::new());
        let response = handle.accept(work(1, "insert")).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Committed);
        assert_eq!(response.payload, b"insert".to_vec());

        let dump = handle.dump().await.unwrap();
        assert_eq!(dump.stats.accepted, 1);
        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_replica_bounce_becomes_restart() {
        let (coordinator, mailbox) = coordinator(1, PartitionRole::Replica, &[0, 1]);
        let (handle, _task) = spawn(coordinator, OwnerRegistry::new());
        let response = handle.accept(work(4, "w")).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Restart);
        assert!(mailbox.take_sent().is_empty());
    }

    #[tokio::test]
    async fn test_response_waits_for_replica() {
        let (coordinator, mailbox) = coordinator(0, PartitionRole::Leader, &[0, 1]);
        let (handle, _task) = spawn(coordinator, OwnerRegistry::new());
        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.accept(work(9, "x;y")).await })
        };

        let task = loop {
            let sent = mailbox.take_sent();
            if let Some((_, Message::Initiate(task))) = sent.into_iter().next() {
                break task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(!pending.is_finished());

        let mut engine = DeterministicEngine::new();
        let result = engine.execute(task.handle, ExecutionRequest::Procedure(&task.work));
        handle
            .deliver(
                site(1),
                Message::InitiateResponse(InitiateResponse {
                    handle: task.handle,
                    site: site(1),
                    client: task.work.client,
                    result,
                }),
            )
            .await
            .unwrap();
        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.status, ResponseStatus::Committed);
        assert_eq!(response.handle, task.handle);
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_client_handle_rejected() {
        let (coordinator, mailbox) = coordinator(0, PartitionRole::Leader, &[0, 1]);
        let (handle, _task) = spawn(coordinator, OwnerRegistry::new());
        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.accept(work(9, "a")).await })
        };
        let task = loop {
            if let Some((_, Message::Initiate(task))) = mailbox.take_sent().into_iter().next() {
                break task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        // Same handle from the same initiator while the first is still waiting.
        let second = handle.accept(work(9, "b")).await.unwrap();
        assert_eq!(second.status, ResponseStatus::Aborted);
        assert!(String::from_utf8_lossy(&second.payload).contains("in flight"));
        assert!(!first.is_finished());

        // Same handle from another initiator is a different caller.
        let mut other = work(9, "c");
        other.initiator = site(101);
        let other_pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.accept(other).await })
        };

        let mut engine = DeterministicEngine::new();
        let result = engine.execute(task.handle, ExecutionRequest::Procedure(&task.work));
        handle
            .deliver(
                site(1),
                Message::InitiateResponse(InitiateResponse {
                    handle: task.handle,
                    site: site(1),
                    client: task.work.client,
                    result,
                }),
            )
            .await
            .unwrap();
        let response = first.await.unwrap().unwrap();
        assert_eq!(response.status, ResponseStatus::Committed);
        assert_eq!(response.payload, b"a".to_vec());
        assert!(!other_pending.is_finished());
    }

    #[tokio::test]
    async fn test_fatal_error_stops_actor() {
        let (coordinator, mailbox) = coordinator(1, PartitionRole::Replica, &[0, 1]);
        let (handle, task) = spawn(coordinator, OwnerRegistry::new());
        let copy = |ts| {
            Message::Initiate(crate::protocol::InitiateTask {
                handle: TxnHandle::compose(ts, 0, 2),
                truncation: TxnHandle::MIN,
                origin: crate::protocol::Origin::Leader,
                work: work(1, "w"),
            })
        };
        handle.deliver(site(0), copy(10)).await.unwrap();
        handle.deliver(site(0), copy(5)).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(mailbox.events().as_slice(), [ClusterEvent::Fatal { .. }]));
        assert!(handle.dump().await.is_err());
    }
}
