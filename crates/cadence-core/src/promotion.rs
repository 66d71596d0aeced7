//! Promotion and repair
//!
//! A site taking over leadership after a failure cannot know which of the old
//! leader's last messages reached which survivor. It asks every survivor
//! (itself included) for its repair log, merges the answers into one ordered
//! union and replays that union to everyone. Replicas drop repair work for
//! handles they already applied, so the replay is idempotent.
//!
//! The protocol is event driven: pages are fed in as they arrive and the
//! coordinator thread never blocks on a survivor. The outcome is reported once
//! through a [`PromotionHandle`].

use crate::protocol::{Message, RepairLogPage};
use crate::repair_log::{RepairLogEntry, merge_entry};
use crate::types::{PartitionId, SiteId, TxnHandle};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::oneshot;

const COLLECTING: u8 = 0;
const SENDING: u8 = 1;
const CANCELLED: u8 = 2;

/// What a finished promotion reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PromotionOutcome {
    /// Attempt that produced the outcome
    pub request_id: u64,
    /// Highest handle any survivor had seen; the new leader allocates above it
    pub max_handle: TxnHandle,
    /// Union entries replayed to survivors
    pub repaired: usize,
}

/// Cancels a promotion from any thread
#[derive(Debug, Clone)]
pub struct PromotionCanceller {
    state: Arc<AtomicU8>,
}

impl PromotionCanceller {
    /// Cancel unless repair sends already began. Returns true when cancelled.
    pub fn cancel(&self) -> bool {
        match self
            .state
            .compare_exchange(COLLECTING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == CANCELLED,
        }
    }

    /// True once cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

/// Resolves exactly once with the promotion's outcome
#[derive(Debug)]
pub struct PromotionHandle {
    request_id: u64,
    rx: oneshot::Receiver<Result<PromotionOutcome>>,
    canceller: PromotionCanceller,
}

impl PromotionHandle {
    /// Attempt this handle belongs to
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Canceller for this attempt
    pub fn canceller(&self) -> PromotionCanceller {
        self.canceller.clone()
    }

    /// Cancel the attempt; see [`PromotionCanceller::cancel`]
    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    /// Wait for the outcome
    pub async fn outcome(self) -> Result<PromotionOutcome> {
        self.rx
            .await
            .map_err(|_| Error::channel_closed("promotion dropped before resolving"))?
    }

    /// Outcome if already resolved, without waiting
    pub fn try_outcome(&mut self) -> Option<Result<PromotionOutcome>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(Error::channel_closed("promotion dropped before resolving")))
            }
        }
    }
}

/// One union entry and the survivors that have not seen it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRepair {
    /// Entry to replay
    pub entry: RepairLogEntry,
    /// Survivors whose highest seen handle is below the entry
    pub needs_repair: Vec<SiteId>,
}

/// Everything the new leader must replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairPlan {
    /// Attempt the plan belongs to
    pub request_id: u64,
    /// Highest handle any survivor reported
    pub max_handle: TxnHandle,
    /// Survivors at completion time
    pub survivors: Vec<SiteId>,
    /// Union entries in handle order
    pub repairs: Vec<PlannedRepair>,
    /// Drain was already guaranteed by migration; nothing needs replaying
    pub skip_replay: bool,
}

#[derive(Debug, Default, Clone, Serialize)]
struct Scoreboard {
    received: BTreeSet<u32>,
    expected: Option<u32>,
    max_handle: TxnHandle,
    /// Handles this survivor already holds as completed
    terminal: BTreeSet<TxnHandle>,
}

impl Scoreboard {
    fn is_complete(&self) -> bool {
        self.expected
            .is_some_and(|expected| self.received.len() as u32 >= expected)
    }
}

/// Serializable progress of a running promotion
#[derive(Debug, Clone, Serialize)]
pub struct PromotionDump {
    /// Attempt id
    pub request_id: u64,
    /// Survivors still being collected from: (site, pages received, pages expected)
    pub scoreboard: Vec<(SiteId, usize, Option<u32>)>,
    /// Entries merged so far
    pub union_len: usize,
    /// Cancel requested
    pub cancelled: bool,
}

/// Repair-log collection for one promotion attempt
#[derive(Debug)]
pub struct Promotion {
    partition: PartitionId,
    local: SiteId,
    request_id: u64,
    scoreboard: BTreeMap<SiteId, Scoreboard>,
    union: BTreeMap<TxnHandle, RepairLogEntry>,
    drain_guaranteed: bool,
    planned: bool,
    state: Arc<AtomicU8>,
    result_tx: Option<oneshot::Sender<Result<PromotionOutcome>>>,
}

impl Promotion {
    /// Begin collecting from `survivors` (the local site is always added)
    pub fn start(
        partition: PartitionId,
        local: SiteId,
        request_id: u64,
        survivors: impl IntoIterator<Item = SiteId>,
        drain_guaranteed: bool,
    ) -> (Self, PromotionHandle) {
        let mut scoreboard: BTreeMap<SiteId, Scoreboard> = survivors
            .into_iter()
            .map(|s| (s, Scoreboard::default()))
            .collect();
        scoreboard.entry(local).or_default();

        let state = Arc::new(AtomicU8::new(COLLECTING));
        let (tx, rx) = oneshot::channel();
        tracing::info!(
            partition,
            request_id,
            survivors = scoreboard.len(),
            drain_guaranteed,
            "Promotion started"
        );
        let promotion = Self {
            partition,
            local,
            request_id,
            scoreboard,
            union: BTreeMap::new(),
            drain_guaranteed,
            planned: false,
            state: state.clone(),
            result_tx: Some(tx),
        };
        let handle = PromotionHandle {
            request_id,
            rx,
            canceller: PromotionCanceller { state },
        };
        (promotion, handle)
    }

    /// Attempt id
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Survivors being collected from
    pub fn survivors(&self) -> Vec<SiteId> {
        self.scoreboard.keys().copied().collect()
    }

    /// Request broadcast to every survivor
    pub fn request(&self) -> Message {
        Message::RepairLogRequest {
            request_id: self.request_id,
            requester: self.local,
        }
    }

    /// Feed one page. Returns the repair plan once every survivor's log is in.
    pub fn on_page(&mut self, page: RepairLogPage) -> Option<RepairPlan> {
        if page.request_id != self.request_id {
            tracing::warn!(
                partition = self.partition,
                current = self.request_id,
                stale = page.request_id,
                from = %page.site,
                "Ignoring repair log page from another promotion attempt"
            );
            return None;
        }
        let Some(board) = self.scoreboard.get_mut(&page.site) else {
            tracing::debug!(partition = self.partition, from = %page.site, "Repair log page from non-survivor");
            return None;
        };
        if !board.received.insert(page.sequence) {
            return None;
        }
        board.expected = Some(page.of_total);
        board.max_handle = board.max_handle.max(page.max_handle);
        for entry in page.entries {
            if entry.is_terminal() {
                board.terminal.insert(entry.handle);
            }
            merge_entry(&mut self.union, entry);
        }
        self.try_plan()
    }

    /// Drop survivors that are no longer live. May complete the collection.
    pub fn update_survivors(&mut self, live: &[SiteId]) -> Option<RepairPlan> {
        let local = self.local;
        let before = self.scoreboard.len();
        self.scoreboard
            .retain(|site, _| *site == local || live.contains(site));
        if self.scoreboard.len() != before {
            tracing::info!(
                partition = self.partition,
                request_id = self.request_id,
                lost = before - self.scoreboard.len(),
                "Survivors lost during promotion"
            );
        }
        self.try_plan()
    }

    /// Canceller sharing this attempt's state
    pub fn canceller(&self) -> PromotionCanceller {
        PromotionCanceller {
            state: self.state.clone(),
        }
    }

    /// Claim the right to send repairs. False if cancelled first.
    pub fn begin_sending(&self) -> bool {
        self.state
            .compare_exchange(COLLECTING, SENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True once cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Report the outcome to the handle; later calls are no-ops
    pub fn resolve(&mut self, result: Result<PromotionOutcome>) {
        if let Some(tx) = self.result_tx.take() {
            match &result {
                Ok(outcome) => tracing::info!(
                    partition = self.partition,
                    request_id = self.request_id,
                    max_handle = %outcome.max_handle,
                    repaired = outcome.repaired,
                    "Promotion complete"
                ),
                Err(e) => tracing::warn!(
                    partition = self.partition,
                    request_id = self.request_id,
                    error = %e,
                    "Promotion failed"
                ),
            }
            let _ = tx.send(result);
        }
    }

    /// Diagnostic view
    pub fn dump(&self) -> PromotionDump {
        PromotionDump {
            request_id: self.request_id,
            scoreboard: self
                .scoreboard
                .iter()
                .map(|(site, board)| (*site, board.received.len(), board.expected))
                .collect(),
            union_len: self.union.len(),
            cancelled: self.is_cancelled(),
        }
    }

    fn try_plan(&mut self) -> Option<RepairPlan> {
        if self.planned || !self.scoreboard.values().all(Scoreboard::is_complete) {
            return None;
        }
        self.planned = true;

        let max_handle = self
            .scoreboard
            .values()
            .map(|b| b.max_handle)
            .chain(self.union.keys().copied())
            .max()
            .unwrap_or(TxnHandle::MIN);

        let repairs = if self.drain_guaranteed {
            Vec::new()
        } else {
            self.union
                .values()
                .map(|entry| PlannedRepair {
                    entry: entry.clone(),
                    needs_repair: self
                        .scoreboard
                        .iter()
                        .filter(|(_, board)| {
                            board.max_handle < entry.handle
                                || (entry.is_terminal() && !board.terminal.contains(&entry.handle))
                        })
                        .map(|(site, _)| *site)
                        .collect(),
                })
                .collect()
        };

        Some(RepairPlan {
            request_id: self.request_id,
            max_handle,
            survivors: self.survivors(),
            repairs,
            skip_replay: self.drain_guaranteed,
        })
    }
}

impl Drop for Promotion {
    fn drop(&mut self) {
        if self.result_tx.is_some() {
            self.resolve(Err(Error::cancelled(format!(
                "promotion {} abandoned",
                self.request_id
            ))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CompleteTransaction, FragmentTask, Origin, WorkUnit};
    use crate::repair_log::{RepairLog, RepairPayload};
    use crate::types::{ClientHandle, MP_PARTITION_ID};

    fn site(n: u32) -> SiteId {
        SiteId::new(n, 0)
    }

    fn h(ts: u64) -> TxnHandle {
        TxnHandle::compose(ts, 0, 4)
    }

    fn sp(ts: u64) -> RepairLogEntry {
        RepairLogEntry::single_partition(
            h(ts),
            WorkUnit::write("w", ClientHandle(ts), site(9), vec![]),
        )
    }

    fn frag(ts: u64) -> RepairLogEntry {
        RepairLogEntry::fragment(FragmentTask {
            txn_id: TxnHandle::compose(ts, 0, MP_PARTITION_ID),
            handle: h(ts),
            coordinator: site(9),
            origin: Origin::Leader,
            truncation: TxnHandle::MIN,
            read_only: false,
            output_deps: vec![],
            payload: vec![],
        })
    }

    fn done(ts: u64) -> RepairLogEntry {
        RepairLogEntry::complete(CompleteTransaction {
            txn_id: TxnHandle::compose(ts, 0, MP_PARTITION_ID),
            handle: h(ts),
            coordinator: site(9),
            rollback: false,
            rollback_for_fault: false,
            origin: Origin::Leader,
            truncation: TxnHandle::MIN,
        })
    }

    fn pages(request_id: u64, from: SiteId, entries: Vec<RepairLogEntry>) -> Vec<RepairLogPage> {
        let mut log = RepairLog::new(2);
        for entry in entries {
            log.append(entry);
        }
        log.contents(request_id, from)
    }

    #[test]
    fn test_union_terminal_wins() {
        let (mut promo, _handle) = Promotion::start(4, site(0), 1, [site(1), site(2)], false);
        let mut plan = None;
        for page in pages(1, site(0), vec![sp(5), frag(9)])
            .into_iter()
            .chain(pages(1, site(1), vec![sp(5), sp(7), done(9)]))
            .chain(pages(1, site(2), vec![frag(9), sp(12)]))
        {
            if let Some(p) = promo.on_page(page) {
                plan = Some(p);
            }
        }
        let plan = plan.expect("collection completes");
        let handles: Vec<_> = plan.repairs.iter().map(|r| r.entry.handle).collect();
        assert_eq!(handles, vec![h(5), h(7), h(9), h(12)]);
        assert!(matches!(
            plan.repairs[2].entry.payload,
            RepairPayload::Complete { .. }
        ));
        assert_eq!(plan.max_handle, h(12));
        // Site 0 saw only up to 9; it needs 12 replayed.
        assert!(plan.repairs[3].needs_repair.contains(&site(0)));
        assert!(!plan.repairs[0].needs_repair.contains(&site(1)));
        // Site 2 saw a later handle but never the completion of 9.
        assert!(plan.repairs[2].needs_repair.contains(&site(2)));
        assert!(!plan.repairs[2].needs_repair.contains(&site(1)));
    }

    #[test]
    fn test_stale_request_ignored() {
        let (mut promo, _handle) = Promotion::start(4, site(0), 2, [], false);
        assert!(promo.on_page(pages(1, site(0), vec![sp(5)]).remove(0)).is_none());
        let plan = promo.on_page(pages(2, site(0), vec![]).remove(0)).unwrap();
        assert!(plan.repairs.is_empty());
    }

    #[test]
    fn test_lost_survivor_pruned() {
        let (mut promo, _handle) = Promotion::start(4, site(0), 3, [site(1), site(2)], false);
        assert!(promo.on_page(pages(3, site(0), vec![sp(5)]).remove(0)).is_none());
        assert!(promo.on_page(pages(3, site(1), vec![sp(5)]).remove(0)).is_none());
        let plan = promo.update_survivors(&[site(0), site(1)]).unwrap();
        assert_eq!(plan.survivors, vec![site(0), site(1)]);
    }

    #[test]
    fn test_duplicate_page_not_double_counted() {
        let (mut promo, _handle) = Promotion::start(4, site(0), 3, [], false);
        let all = pages(3, site(0), vec![sp(1), sp(2), sp(3)]);
        assert_eq!(all.len(), 2);
        assert!(promo.on_page(all[0].clone()).is_none());
        assert!(promo.on_page(all[0].clone()).is_none());
        assert!(promo.on_page(all[1].clone()).is_some());
    }

    #[test]
    fn test_drain_guaranteed_skips_replay() {
        let (mut promo, _handle) = Promotion::start(4, site(0), 5, [], true);
        let plan = promo.on_page(pages(5, site(0), vec![sp(8)]).remove(0)).unwrap();
        assert!(plan.skip_replay);
        assert!(plan.repairs.is_empty());
        assert_eq!(plan.max_handle, h(8));
    }

    #[test]
    fn test_cancel_before_send_suppresses() {
        let (promo, handle) = Promotion::start(4, site(0), 6, [], false);
        assert!(handle.cancel());
        assert!(!promo.begin_sending());
        assert!(promo.is_cancelled());
    }

    #[test]
    fn test_cancel_after_send_is_too_late() {
        let (promo, handle) = Promotion::start(4, site(0), 6, [], false);
        assert!(promo.begin_sending());
        assert!(!handle.cancel());
        assert!(!handle.canceller().is_cancelled());
    }

    #[tokio::test]
    async fn test_handle_resolves_once() {
        let (mut promo, handle) = Promotion::start(4, site(0), 7, [], false);
        let outcome = PromotionOutcome {
            request_id: 7,
            max_handle: h(3),
            repaired: 0,
        };
        promo.resolve(Ok(outcome));
        promo.resolve(Err(Error::internal("second resolution")));
        assert_eq!(handle.outcome().await.unwrap(), outcome);
    }

    #[tokio::test]
    async fn test_dropped_promotion_resolves_cancelled() {
        let (promo, handle) = Promotion::start(4, site(0), 8, [], false);
        drop(promo);
        assert!(matches!(handle.outcome().await, Err(Error::Cancelled(_))));
    }
}
