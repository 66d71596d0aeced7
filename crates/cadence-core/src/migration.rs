//! Leader-migration state machine
//!
//! Graceful hand-off of partition leadership between two live sites.
//!
//! ```text
//!  old leader:  NONE --start--> STARTED --work <= checkpoint settled--> STARTED (drained, replica)
//!               STARTED (drained) --drain ack--> NONE
//!  candidate:   NONE --drain notice--> TXN_DRAINED --first work--> NONE
//!               NONE --misrouted work--> TXN_RESTART --drain notice--> NONE
//!  either side: * --reset--> NONE (an unacknowledged old leader resumes leading)
//! ```
//!
//! While a site is neither `NONE`-and-leader nor a drained candidate, work it
//! receives as leader is returned to the sender unprocessed.

use crate::types::{PartitionId, SiteId, TxnHandle};
use crate::{Error, Result};
use serde::Serialize;

/// Migration progress on one site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationState {
    /// No migration in progress
    None,
    /// Old leader is draining work at or below `checkpoint` before handing off to `target`.
    /// Once `drained`, the drain notice is out and the old leader waits for the target's ack.
    Started {
        /// Site taking over
        target: SiteId,
        /// Last handle the old leader allocated
        checkpoint: TxnHandle,
        /// Drain notice sent
        drained: bool,
    },
    /// Candidate bounced client work before the drain notice arrived
    TxnRestart,
    /// Candidate received the drain notice and may process work
    TxnDrained,
}

/// What a reset undid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Nothing was in progress
    Idle,
    /// This site was the old leader and resumes leadership
    ReinstateLeader,
    /// This site was the candidate and steps back
    AbandonCandidacy,
}

/// Per-partition leader-migration state
#[derive(Debug, Clone)]
pub struct LeaderMigration {
    partition: PartitionId,
    state: MigrationState,
    awaiting_drain: bool,
}

impl LeaderMigration {
    /// Idle state machine for `partition`
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            state: MigrationState::None,
            awaiting_drain: false,
        }
    }

    /// Current state
    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// True on a candidate that became leader but has not seen the drain notice
    pub fn awaiting_drain(&self) -> bool {
        self.awaiting_drain
    }

    /// May a site in this state process work as leader?
    pub fn admits_leader_work(&self, is_leader: bool) -> bool {
        is_leader
            && !self.awaiting_drain
            && matches!(self.state, MigrationState::None | MigrationState::TxnDrained)
    }

    /// Old leader begins hand-off to `target` after recording `checkpoint`
    pub fn start(&mut self, is_leader: bool, target: SiteId, checkpoint: TxnHandle) -> Result<()> {
        if !is_leader {
            return Err(Error::invariant(format!(
                "partition {} migration requested on a non-leader",
                self.partition
            )));
        }
        if self.state != MigrationState::None || self.awaiting_drain {
            return Err(Error::invariant(format!(
                "partition {} migration requested in state {:?}",
                self.partition, self.state
            )));
        }
        tracing::info!(partition = self.partition, %target, %checkpoint, "Leader migration started");
        self.state = MigrationState::Started {
            target,
            checkpoint,
            drained: false,
        };
        Ok(())
    }

    /// Old leader: once nothing at or below the checkpoint is in flight, step down.
    /// Returns the target and checkpoint for the drain notice, at most once per migration.
    pub fn check_drained(&mut self, min_inflight: Option<TxnHandle>) -> Option<(SiteId, TxnHandle)> {
        let MigrationState::Started {
            target,
            checkpoint,
            drained: false,
        } = self.state
        else {
            return None;
        };
        if min_inflight.is_some_and(|h| h <= checkpoint) {
            return None;
        }
        tracing::info!(partition = self.partition, %target, %checkpoint, "Old leader drained");
        self.state = MigrationState::Started {
            target,
            checkpoint,
            drained: true,
        };
        Some((target, checkpoint))
    }

    /// Old leader: `from` confirmed it took over. Returns false for a stray ack.
    pub fn on_drain_ack(&mut self, from: SiteId) -> bool {
        match self.state {
            MigrationState::Started {
                target, drained: true, ..
            } if target == from => {
                tracing::info!(partition = self.partition, %target, "Leader migration complete");
                self.state = MigrationState::None;
                true
            }
            state => {
                tracing::warn!(partition = self.partition, %from, ?state, "Ignoring drain ack");
                false
            }
        }
    }

    /// Candidate: leadership was appointed by migration; hold work until drained
    pub fn expect_drain(&mut self) {
        self.awaiting_drain = true;
        self.state = MigrationState::None;
    }

    /// Candidate: client work arrived before the drain notice
    pub fn on_premature_work(&mut self) {
        if self.awaiting_drain && self.state == MigrationState::None {
            tracing::info!(partition = self.partition, "Work arrived before drain notice; restarting");
            self.state = MigrationState::TxnRestart;
        }
    }

    /// Candidate: the old leader flushed its in-flight work. Returns true when the
    /// notice completed a pending candidacy and should be acknowledged.
    pub fn on_drain_notice(&mut self, checkpoint: TxnHandle) -> Result<bool> {
        match self.state {
            MigrationState::Started { .. } => Err(Error::invariant(format!(
                "partition {} received drain notice while itself draining",
                self.partition
            ))),
            _ if !self.awaiting_drain => {
                tracing::warn!(partition = self.partition, %checkpoint, "Ignoring drain notice; no migration pending");
                Ok(false)
            }
            MigrationState::TxnRestart => {
                self.awaiting_drain = false;
                self.state = MigrationState::None;
                Ok(true)
            }
            MigrationState::None | MigrationState::TxnDrained => {
                self.awaiting_drain = false;
                self.state = MigrationState::TxnDrained;
                Ok(true)
            }
        }
    }

    /// Candidate: work was admitted after the drain; the migration is over
    pub fn on_work_admitted(&mut self) {
        if self.state == MigrationState::TxnDrained {
            self.state = MigrationState::None;
        }
    }

    /// Abandon any migration in progress
    pub fn reset(&mut self) -> ResetOutcome {
        let outcome = match self.state {
            MigrationState::Started { .. } => ResetOutcome::ReinstateLeader,
            _ if self.awaiting_drain => ResetOutcome::AbandonCandidacy,
            MigrationState::TxnRestart | MigrationState::TxnDrained => ResetOutcome::AbandonCandidacy,
            MigrationState::None => ResetOutcome::Idle,
        };
        if outcome != ResetOutcome::Idle {
            tracing::warn!(partition = self.partition, state = ?self.state, "Leader migration reset");
        }
        self.state = MigrationState::None;
        self.awaiting_drain = false;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(ts: u64) -> TxnHandle {
        TxnHandle::compose(ts, 0, 2)
    }

    #[test]
    fn test_old_leader_drains_then_hands_off() {
        let mut m = LeaderMigration::new(2);
        let target = SiteId::new(1, 0);
        m.start(true, target, h(10)).unwrap();
        assert!(!m.admits_leader_work(true));

        assert_eq!(m.check_drained(Some(h(9))), None);
        assert_eq!(m.check_drained(Some(h(10))), None);
        assert_eq!(m.check_drained(Some(h(11))), Some((target, h(10))));
        assert_eq!(m.check_drained(None), None);
        assert!(matches!(m.state(), MigrationState::Started { drained: true, .. }));
        assert!(!m.admits_leader_work(true));

        assert!(!m.on_drain_ack(SiteId::new(2, 0)));
        assert!(m.on_drain_ack(target));
        assert_eq!(m.state(), MigrationState::None);
    }

    #[test]
    fn test_reset_before_drain_ack_reinstates_old_leader() {
        let mut m = LeaderMigration::new(2);
        let target = SiteId::new(1, 0);
        m.start(true, target, h(10)).unwrap();
        assert!(m.check_drained(None).is_some());

        assert_eq!(m.reset(), ResetOutcome::ReinstateLeader);
        assert_eq!(m.state(), MigrationState::None);
        assert!(!m.on_drain_ack(target));
    }

    #[test]
    fn test_start_requires_idle_leader() {
        let mut m = LeaderMigration::new(2);
        assert!(m.start(false, SiteId::new(1, 0), h(1)).is_err());
        m.start(true, SiteId::new(1, 0), h(1)).unwrap();
        let err = m.start(true, SiteId::new(2, 0), h(2)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_candidate_drained_path() {
        let mut m = LeaderMigration::new(2);
        m.expect_drain();
        assert!(!m.admits_leader_work(true));
        assert!(m.on_drain_notice(h(10)).unwrap());
        assert_eq!(m.state(), MigrationState::TxnDrained);
        assert!(m.admits_leader_work(true));
        m.on_work_admitted();
        assert_eq!(m.state(), MigrationState::None);
    }

    #[test]
    fn test_candidate_restart_path() {
        let mut m = LeaderMigration::new(2);
        m.expect_drain();
        m.on_premature_work();
        assert_eq!(m.state(), MigrationState::TxnRestart);
        assert!(!m.admits_leader_work(true));
        m.on_premature_work();
        assert_eq!(m.state(), MigrationState::TxnRestart);

        assert!(m.on_drain_notice(h(10)).unwrap());
        assert_eq!(m.state(), MigrationState::None);
        assert!(m.admits_leader_work(true));
    }

    #[test]
    fn test_reset_reinstates_old_leader() {
        let mut m = LeaderMigration::new(2);
        m.start(true, SiteId::new(1, 0), h(10)).unwrap();
        assert_eq!(m.reset(), ResetOutcome::ReinstateLeader);
        assert_eq!(m.state(), MigrationState::None);
        assert!(m.admits_leader_work(true));
        assert_eq!(m.check_drained(None), None);
    }

    #[test]
    fn test_reset_on_candidate() {
        let mut m = LeaderMigration::new(2);
        m.expect_drain();
        m.on_premature_work();
        assert_eq!(m.reset(), ResetOutcome::AbandonCandidacy);
        assert!(!m.awaiting_drain());
        assert_eq!(m.reset(), ResetOutcome::Idle);
    }

    #[test]
    fn test_drain_notice_on_draining_leader_is_fatal() {
        let mut m = LeaderMigration::new(2);
        m.start(true, SiteId::new(1, 0), h(10)).unwrap();
        assert!(m.on_drain_notice(h(10)).unwrap_err().is_fatal());
    }

    #[test]
    fn test_stray_drain_notice_ignored() {
        let mut m = LeaderMigration::new(2);
        assert!(!m.on_drain_notice(h(3)).unwrap());
        assert_eq!(m.state(), MigrationState::None);
    }
}
