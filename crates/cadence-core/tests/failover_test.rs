//! Replica failure while work is in flight, and the late-response policy

use cadence_core::coordinator::{ClusterEvent, ResponseStatus};
use cadence_core::testing::LocalCluster;
use cadence_core::{LateResponsePolicy, PartitionRole, ReplicaSet};

const PARTITION: u16 = 5;

fn leader() -> cadence_core::SiteId {
    LocalCluster::site(0)
}

fn r1() -> cadence_core::SiteId {
    LocalCluster::site(1)
}

fn r2() -> cadence_core::SiteId {
    LocalCluster::site(2)
}

// ============================================================================
// Replica failure
// ============================================================================

#[test]
fn test_failed_replica_is_not_waited_for() {
    let mut cluster = LocalCluster::new(PARTITION, 3).unwrap();
    cluster.submit("insert w");
    assert!(cluster.step().unwrap()); // leader accepts and replicates
    assert!(cluster.step().unwrap()); // R1 applies

    cluster.fail_site(r2()).unwrap();
    let dump = cluster.node(leader()).unwrap().coordinator.dump();
    assert_eq!(dump.counters.len(), 1);
    assert_eq!(dump.replicas, vec![leader(), r1()]);

    cluster.pump().unwrap();
    let responses = cluster.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, ResponseStatus::Committed);

    let dump = cluster.node(leader()).unwrap().coordinator.dump();
    assert!(dump.counters.is_empty());
    assert!(dump.inflight.is_empty());
    assert_eq!(
        cluster.applied(leader()).unwrap(),
        cluster.applied(r1()).unwrap()
    );
}

#[test]
fn test_membership_change_resolves_waiting_counter_immediately() {
    let mut cluster = LocalCluster::new(PARTITION, 3).unwrap();
    cluster.submit("insert w");
    cluster.step().unwrap(); // leader accepts
    cluster.step().unwrap(); // R1 applies
    cluster.step().unwrap(); // R2 applies, its ack is now queued
    cluster.step().unwrap(); // R1's ack reaches the leader
    assert!(cluster.responses().is_empty());

    // R2 dies before its ack is delivered.
    cluster.fail_site(r2()).unwrap();
    let responses = cluster.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, ResponseStatus::Committed);

    cluster.pump().unwrap();
    assert_eq!(cluster.responses().len(), 1);
}

#[test]
fn test_fault_record_written_and_replicated() {
    let mut cluster = LocalCluster::new(PARTITION, 3).unwrap();
    cluster.submit("a");
    cluster.pump().unwrap();
    let before = cluster.node(r1()).unwrap().coordinator.max_seen();

    cluster.fail_site(r2()).unwrap();
    cluster.pump().unwrap();

    let faults = cluster.node(leader()).unwrap().log.faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].replicas, vec![leader(), r1()]);

    let replica_faults = cluster.node(r1()).unwrap().log.faults();
    assert_eq!(replica_faults.len(), 1);
    assert_eq!(replica_faults[0].handle, faults[0].handle);
    assert!(cluster.node(r1()).unwrap().coordinator.max_seen() > before);

    // Later work sorts after the fault handle.
    cluster.submit("b");
    cluster.pump().unwrap();
    let applied = cluster.applied(r1()).unwrap();
    assert!(applied.last().copied().unwrap() > faults[0].handle);
}

#[test]
fn test_nondeterministic_replica_reported() {
    let mut cluster = LocalCluster::new(PARTITION, 3).unwrap();
    cluster.node(r2()).unwrap().engine.set_salt(Some(42));
    cluster.submit("update x;update y");
    cluster.pump().unwrap();

    let events = cluster.events();
    assert!(events.iter().any(|e| matches!(
        e,
        ClusterEvent::Nondeterminism { partition: PARTITION, divergence: Some((site, _)), .. } if *site == r2()
    )));
    assert!(cluster.node(leader()).unwrap().coordinator.is_reduced_safety());

    // The client still sees exactly one committed answer.
    let responses = cluster.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, ResponseStatus::Committed);
}

#[test]
fn test_aborts_are_deterministic_too() {
    let mut cluster = LocalCluster::new(PARTITION, 2).unwrap();
    cluster.submit("abort: constraint");
    cluster.pump().unwrap();
    assert_eq!(cluster.responses()[0].status, ResponseStatus::Aborted);
    assert!(cluster.events().is_empty());
}

#[test]
fn test_reads_are_not_replicated() {
    let mut cluster = LocalCluster::new(PARTITION, 3).unwrap();
    cluster.submit("w");
    cluster.submit_read("r");
    cluster.pump().unwrap();
    assert_eq!(cluster.responses().len(), 2);
    assert_eq!(cluster.applied(r1()).unwrap().len(), 1);
    let stats = cluster.node(leader()).unwrap().coordinator.stats().clone();
    assert_eq!(stats.short_circuit_reads, 1);
    assert_eq!(stats.accepted, 1);
}

// ============================================================================
// Late responses from evicted replicas
// ============================================================================

/// Leader replicates; R1 applies; R1 is evicted before its ack is delivered.
fn evict_r1_mid_flight(policy: LateResponsePolicy) -> LocalCluster {
    let mut cluster =
        LocalCluster::with_config(PARTITION, 3, |config| config.with_late_response_policy(policy)).unwrap();
    cluster.submit("w");
    cluster.step().unwrap();
    cluster.step().unwrap();
    cluster.remove_replica(r1()).unwrap();
    assert_eq!(
        cluster.node(leader()).unwrap().coordinator.replicas(),
        &ReplicaSet::new([leader(), r2()])
    );
    cluster
}

#[test]
fn test_late_response_discarded_by_default() {
    let mut cluster = evict_r1_mid_flight(LateResponsePolicy::Discard);
    cluster.pump().unwrap();

    let responses = cluster.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, ResponseStatus::Committed);
    let coordinator = &cluster.node(leader()).unwrap().coordinator;
    assert_eq!(coordinator.stats().ignored_responses, 1);
    assert_eq!(coordinator.role(), PartitionRole::Leader);
}

#[test]
fn test_late_response_fatal_policy_stops_partition() {
    let mut cluster = evict_r1_mid_flight(LateResponsePolicy::Fatal);
    let err = cluster.pump().unwrap_err();
    assert!(err.is_fatal());
    assert!(cluster.responses().is_empty());
}
