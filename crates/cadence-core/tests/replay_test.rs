//! Command-log replay through the coordinator

use cadence_core::coordinator::ResponseStatus;
use cadence_core::protocol::{FragmentTask, InitiateTask, Origin};
use cadence_core::testing::{DeterministicEngine, EPOCH_MS, MemoryCommandLog, RecordingMailbox};
use cadence_core::topology::{ClusterDirectory, PartitionPlacement};
use cadence_core::types::MP_PARTITION_ID;
use cadence_core::unique_id::ManualClock;
use cadence_core::{
    ClientHandle, CoordinatorConfig, Message, PartitionCoordinator, PartitionRole, ReplicaSet, SiteId, TxnHandle,
    WorkUnit,
};
use std::sync::Arc;

const PARTITION: u16 = 2;

fn local() -> SiteId {
    SiteId::new(0, 0)
}

fn mp_coordinator() -> SiteId {
    SiteId::new(50, 0)
}

struct Replaying {
    coordinator: PartitionCoordinator,
    mailbox: Arc<RecordingMailbox>,
    engine: DeterministicEngine,
    log: MemoryCommandLog,
}

fn replaying_leader() -> Replaying {
    let replicas = ReplicaSet::new([local()]);
    let directory = Arc::new(ClusterDirectory::new());
    directory.set_live_sites([local()]);
    directory
        .install(PartitionPlacement {
            partition: PARTITION,
            leader: Some(local()),
            replicas: replicas.clone(),
        })
        .unwrap();
    let mailbox = Arc::new(RecordingMailbox::new());
    let engine = DeterministicEngine::new();
    let log = MemoryCommandLog::new();
    let coordinator = PartitionCoordinator::new(
        CoordinatorConfig::new(PARTITION, local()),
        PartitionRole::Leader,
        replicas,
        Box::new(engine.clone()),
        mailbox.clone(),
        directory,
    )
    .unwrap()
    .with_command_log(Box::new(log.clone()))
    .with_clock(Box::new(ManualClock::new(EPOCH_MS + 10_000)), 0)
    .with_replay_pending();
    Replaying {
        coordinator,
        mailbox,
        engine,
        log,
    }
}

fn h(ts: u64) -> TxnHandle {
    TxnHandle::compose(ts, 0, PARTITION)
}

fn txn(ts: u64) -> TxnHandle {
    TxnHandle::compose(ts, 0, MP_PARTITION_ID)
}

fn sentinel(ts: u64) -> Message {
    Message::MultipartSentinel { txn_id: txn(ts) }
}

fn logged_fragment(ts: u64, handle: TxnHandle) -> Message {
    Message::Fragment(FragmentTask {
        txn_id: txn(ts),
        handle,
        coordinator: mp_coordinator(),
        origin: Origin::Client,
        truncation: TxnHandle::MIN,
        read_only: false,
        output_deps: vec![1],
        payload: b"update mp".to_vec(),
    })
}

fn logged_work(client: u64, handle: TxnHandle) -> Message {
    Message::Initiate(InitiateTask {
        handle: TxnHandle::MIN,
        truncation: TxnHandle::MIN,
        origin: Origin::Client,
        work: WorkUnit::write("proc", ClientHandle(client), SiteId::new(100, 0), b"insert".to_vec())
            .replayed_at(handle),
    })
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_work_behind_sentinel_waits_for_fragment() {
    let mut r = replaying_leader();
    r.coordinator.replay(txn(1), sentinel(1)).unwrap();
    r.coordinator.replay(h(200), logged_work(1, h(200))).unwrap();
    assert!(r.engine.applied().is_empty());

    r.coordinator.replay(txn(1), logged_fragment(1, h(100))).unwrap();
    assert_eq!(r.engine.applied(), vec![h(100), h(200)]);
    assert_eq!(r.coordinator.max_seen(), h(200));

    let responses = r.mailbox.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].handle, h(200));
    assert_eq!(responses[0].status, ResponseStatus::Committed);
    let sent = r.mailbox.take_sent();
    assert!(matches!(
        sent.as_slice(),
        [(to, Message::FragmentResponse(resp))] if *to == mp_coordinator() && resp.handle == h(100)
    ));
}

#[test]
fn test_fragment_read_before_sentinel() {
    let mut r = replaying_leader();
    r.coordinator.replay(txn(1), logged_fragment(1, h(100))).unwrap();
    assert!(r.engine.applied().is_empty());
    r.coordinator.replay(txn(1), sentinel(1)).unwrap();
    r.coordinator.replay(h(200), logged_work(1, h(200))).unwrap();
    assert_eq!(r.engine.applied(), vec![h(100), h(200)]);
}

#[test]
fn test_unpaired_sentinel_at_end_of_log_answers_ignored() {
    let mut r = replaying_leader();
    r.coordinator.replay(h(50), logged_work(1, h(50))).unwrap();
    r.coordinator.replay(txn(2), sentinel(2)).unwrap();
    r.coordinator.replay(h(300), logged_work(2, h(300))).unwrap();

    r.coordinator
        .deliver(mp_coordinator(), Message::EndOfLog { partition: PARTITION })
        .unwrap();

    assert_eq!(r.engine.applied(), vec![h(50)]);
    let statuses: Vec<(ClientHandle, ResponseStatus)> =
        r.mailbox.responses().iter().map(|resp| (resp.client, resp.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (ClientHandle(1), ResponseStatus::Committed),
            (ClientHandle(2), ResponseStatus::Ignored),
        ]
    );
}

// ============================================================================
// Fault records
// ============================================================================

#[test]
fn test_fault_records_withheld_until_replay_finishes() {
    let mut r = replaying_leader();
    r.coordinator.replay(h(50), logged_work(1, h(50))).unwrap();
    r.coordinator
        .on_membership_change(ReplicaSet::new([local()]))
        .unwrap();
    assert!(r.log.faults().is_empty());
    assert!(!r.coordinator.dump().replay_complete);

    r.coordinator.finish_replay();
    r.coordinator
        .on_membership_change(ReplicaSet::new([local()]))
        .unwrap();
    let faults = r.log.faults();
    assert_eq!(faults.len(), 1);
    assert!(faults[0].handle > h(50));

    // Live work resumes above everything replayed.
    r.coordinator
        .accept(WorkUnit::write("proc", ClientHandle(9), SiteId::new(100, 0), b"live".to_vec()))
        .unwrap();
    let applied = r.engine.applied();
    assert_eq!(applied.len(), 2);
    assert!(applied[1] > faults[0].handle);
}
