//! Leader failure, repair-log collection and promotion

use cadence_core::coordinator::{ClusterEvent, ResponseStatus};
use cadence_core::protocol::{InitiateTask, Origin};
use cadence_core::testing::LocalCluster;
use cadence_core::{ClientHandle, Error, Message, PartitionRole, SiteId, TxnHandle, WorkUnit};

const PARTITION: u16 = 8;

fn site(host: u32) -> SiteId {
    LocalCluster::site(host)
}

/// Two writes; R1 applies both, R2 only the first, then the leader dies.
fn cluster_with_lagging_replica() -> LocalCluster {
    let mut cluster = LocalCluster::new(PARTITION, 3).unwrap();
    cluster.submit("w1");
    cluster.submit("w2");
    cluster.step().unwrap(); // leader accepts w1
    cluster.step().unwrap(); // leader accepts w2
    cluster.step().unwrap(); // R1 applies w1
    cluster.step().unwrap(); // R2 applies w1
    cluster.step().unwrap(); // R1 applies w2
    cluster.fail_site(site(0)).unwrap();
    assert_eq!(cluster.leader(), None);
    assert_eq!(cluster.applied(site(1)).unwrap().len(), 2);
    assert_eq!(cluster.applied(site(2)).unwrap().len(), 1);
    cluster
}

#[test]
fn test_promoted_laggard_repairs_itself() {
    let mut cluster = cluster_with_lagging_replica();
    let mut promotion = cluster.promote(site(2), false).unwrap();
    cluster.pump().unwrap();

    let outcome = promotion.try_outcome().expect("resolved").unwrap();
    assert_eq!(outcome.repaired, 2);
    assert_eq!(cluster.leader(), Some(site(2)));
    assert_eq!(
        cluster.node(site(2)).unwrap().coordinator.role(),
        PartitionRole::Leader
    );
    assert_eq!(cluster.applied(site(1)).unwrap(), cluster.applied(site(2)).unwrap());
    assert_eq!(
        cluster.node(site(1)).unwrap().coordinator.stats().repairs_skipped,
        2
    );
    assert!(cluster.events().iter().any(|e| matches!(
        e,
        ClusterEvent::LeaderPromoted { site: s, max_handle, .. } if *s == site(2) && *max_handle == outcome.max_handle
    )));

    // New work is ordered after everything repaired.
    cluster.submit("w3");
    cluster.pump().unwrap();
    let responses = cluster.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, ResponseStatus::Committed);
    let applied = cluster.applied(site(2)).unwrap();
    assert_eq!(applied.len(), 3);
    assert!(responses[0].handle > outcome.max_handle);
    assert_eq!(applied, cluster.applied(site(1)).unwrap());
}

#[test]
fn test_promoted_leader_repairs_survivors() {
    let mut cluster = cluster_with_lagging_replica();
    let mut promotion = cluster.promote(site(1), false).unwrap();
    cluster.pump().unwrap();

    assert!(promotion.try_outcome().expect("resolved").is_ok());
    assert_eq!(cluster.applied(site(2)).unwrap(), cluster.applied(site(1)).unwrap());
    // The repaired handle settled, so nothing stays in flight on the new leader.
    let dump = cluster.node(site(1)).unwrap().coordinator.dump();
    assert!(dump.inflight.is_empty());
    assert!(dump.counters.is_empty());
}

#[test]
fn test_cancelled_promotion_sends_nothing() {
    let mut cluster = cluster_with_lagging_replica();
    let mut promotion = cluster.promote(site(2), false).unwrap();
    assert!(promotion.cancel());
    cluster.pump().unwrap();

    assert!(matches!(promotion.try_outcome(), Some(Err(Error::Cancelled(_)))));
    assert_eq!(cluster.leader(), None);
    assert_eq!(
        cluster.node(site(2)).unwrap().coordinator.role(),
        PartitionRole::Replica
    );
    assert_eq!(cluster.applied(site(2)).unwrap().len(), 1);

    // A fresh attempt elsewhere still converges.
    let mut retry = cluster.promote(site(1), false).unwrap();
    cluster.pump().unwrap();
    assert!(retry.try_outcome().expect("resolved").is_ok());
    assert_eq!(cluster.applied(site(2)).unwrap(), cluster.applied(site(1)).unwrap());
}

#[test]
fn test_cancel_after_send_is_too_late() {
    let mut cluster = cluster_with_lagging_replica();
    let mut promotion = cluster.promote(site(1), false).unwrap();
    cluster.pump().unwrap();
    assert!(!promotion.cancel());
    assert!(promotion.try_outcome().expect("resolved").is_ok());
}

#[test]
fn test_survivor_loss_during_collection() {
    let mut cluster = cluster_with_lagging_replica();
    let mut promotion = cluster.promote(site(2), false).unwrap();
    // R1 dies before answering; collection completes from the remaining survivor.
    cluster.fail_site(site(1)).unwrap();
    cluster.pump().unwrap();
    let outcome = promotion.try_outcome().expect("resolved").unwrap();
    assert_eq!(outcome.repaired, 1);
    assert_eq!(cluster.leader(), Some(site(2)));
}

#[test]
fn test_repair_of_applied_handle_changes_nothing() {
    let mut cluster = cluster_with_lagging_replica();
    let _promotion = cluster.promote(site(1), false).unwrap();
    cluster.pump().unwrap();

    let node = cluster.node_mut(site(2)).unwrap();
    let applied = node.engine.applied();
    let before = node.coordinator.dump();
    let handle = applied[0];
    node.coordinator
        .deliver(
            site(1),
            Message::Initiate(InitiateTask {
                handle,
                truncation: TxnHandle::MIN,
                origin: Origin::Repair,
                work: WorkUnit::write("proc", ClientHandle(1), SiteId::new(1000, 0), b"w1".to_vec()),
            }),
        )
        .unwrap();
    let after = node.coordinator.dump();

    assert_eq!(node.engine.applied(), applied);
    assert_eq!(after.max_seen, before.max_seen);
    assert_eq!(after.repair_log_len, before.repair_log_len);
    assert_eq!(after.truncation, before.truncation);
    assert_eq!(after.stats.repairs_skipped, before.stats.repairs_skipped + 1);
    assert_eq!(cluster.in_flight(), 0);
}
