//! Duplicate counter: per-transaction response scoreboard
//!
//! Every replicated transaction opens one counter on the leader. Each site in
//! the replica set reports its execution fingerprint exactly once; when every
//! still-expected site has answered, the fingerprints are compared against the
//! leader's:
//!
//! - `Done`: all commit statuses and statement hashes agree
//! - `Mismatch`: statuses agree but some statement hash differs
//! - `Abort`: sites disagree about committing
//!
//! Terminal states are final. Responses from sites that were never expected, or
//! were dropped from the replica set while the counter waited, are not counted.

use crate::engine::{Divergence, ExecutionHash, TxnStatus};
use crate::types::{SiteId, TxnHandle};
use serde::Serialize;
use std::collections::BTreeSet;

/// Counter lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CounterState {
    /// Still waiting on at least one expected site
    Waiting,
    /// Every response agreed
    Done,
    /// Statement hashes differ under agreeing commit status
    Mismatch,
    /// Commit status differs between sites
    Abort,
}

impl CounterState {
    /// Terminal states are never left
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Waiting)
    }
}

/// Tracking key: transaction id plus partition handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CounterKey {
    /// Transaction id (equals the handle for single-partition work)
    pub txn_id: TxnHandle,
    /// Partition ordering handle
    pub handle: TxnHandle,
}

impl CounterKey {
    /// Key for single-partition work
    pub fn single(handle: TxnHandle) -> Self {
        Self {
            txn_id: handle,
            handle,
        }
    }
}

/// Why an offered response was not counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IgnoreReason {
    /// Site was never in the expected set
    NotExpected,
    /// Site was dropped from the replica set while the counter waited
    Dropped,
    /// Site already responded
    Duplicate,
    /// Counter already reached a terminal state
    Settled,
}

/// Result of offering a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Response counted; the counter is now in this state
    Counted(CounterState),
    /// Response not counted
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone)]
struct Counted<R> {
    site: SiteId,
    hash: ExecutionHash,
    status: TxnStatus,
    response: R,
}

/// Response scoreboard for one transaction
#[derive(Debug, Clone)]
pub struct DuplicateCounter<R> {
    key: CounterKey,
    leader: SiteId,
    expected: BTreeSet<SiteId>,
    dropped: BTreeSet<SiteId>,
    responses: Vec<Counted<R>>,
    state: CounterState,
    divergence: Option<(SiteId, Divergence)>,
    ignored: u32,
}

impl<R> DuplicateCounter<R> {
    /// Counter expecting one response from each of `expected`; `leader`'s is the reference
    pub fn new(key: CounterKey, leader: SiteId, expected: impl IntoIterator<Item = SiteId>) -> Self {
        Self {
            key,
            leader,
            expected: expected.into_iter().collect(),
            dropped: BTreeSet::new(),
            responses: Vec::new(),
            state: CounterState::Waiting,
            divergence: None,
            ignored: 0,
        }
    }

    /// Tracking key
    pub fn key(&self) -> CounterKey {
        self.key
    }

    /// Current state
    pub fn state(&self) -> CounterState {
        self.state
    }

    /// Sites whose responses still count
    pub fn expected(&self) -> &BTreeSet<SiteId> {
        &self.expected
    }

    /// Sites that have responded, in arrival order
    pub fn responded(&self) -> Vec<SiteId> {
        self.responses.iter().map(|r| r.site).collect()
    }

    /// Responses offered but not counted
    pub fn ignored(&self) -> u32 {
        self.ignored
    }

    /// Site and position of the first divergence, once terminal
    pub fn divergence(&self) -> Option<(SiteId, Divergence)> {
        self.divergence
    }

    /// Record one site's response
    pub fn offer(&mut self, site: SiteId, hash: ExecutionHash, status: TxnStatus, response: R) -> Offer {
        let reason = if self.state.is_terminal() {
            Some(IgnoreReason::Settled)
        } else if self.dropped.contains(&site) {
            Some(IgnoreReason::Dropped)
        } else if !self.expected.contains(&site) {
            Some(IgnoreReason::NotExpected)
        } else if self.responses.iter().any(|r| r.site == site) {
            Some(IgnoreReason::Duplicate)
        } else {
            None
        };
        if let Some(reason) = reason {
            self.ignored += 1;
            return Offer::Ignored(reason);
        }

        self.responses.push(Counted {
            site,
            hash,
            status,
            response,
        });
        if self.outstanding() == 0 {
            self.evaluate();
        }
        Offer::Counted(self.state)
    }

    /// Install a new replica set. Sites no longer present stop being waited on.
    pub fn update_replicas(&mut self, replicas: &[SiteId]) -> CounterState {
        if self.state.is_terminal() {
            return self.state;
        }
        let gone: Vec<SiteId> = self
            .expected
            .iter()
            .copied()
            .filter(|s| !replicas.contains(s))
            .collect();
        for site in gone {
            self.expected.remove(&site);
            self.dropped.insert(site);
        }
        if self.outstanding() == 0 {
            self.evaluate();
        }
        self.state
    }

    /// The reference response: the leader's if it answered, otherwise the latest
    pub fn response(&self) -> Option<&R> {
        self.reference_index().map(|i| &self.responses[i].response)
    }

    /// Consume the counter, yielding the reference response
    pub fn into_response(mut self) -> Option<R> {
        let index = self.reference_index()?;
        Some(self.responses.swap_remove(index).response)
    }

    /// True when the counter resolved without a single response
    pub fn resolved_empty(&self) -> bool {
        self.state.is_terminal() && self.responses.is_empty()
    }

    fn outstanding(&self) -> usize {
        self.expected
            .iter()
            .filter(|s| !self.responses.iter().any(|r| r.site == **s))
            .count()
    }

    fn reference_index(&self) -> Option<usize> {
        self.responses
            .iter()
            .position(|r| r.site == self.leader)
            .or_else(|| self.responses.len().checked_sub(1))
    }

    fn evaluate(&mut self) {
        let Some(reference) = self.reference_index() else {
            self.state = CounterState::Done;
            return;
        };
        let reference = &self.responses[reference];

        let mut state = CounterState::Done;
        let mut divergence = None;
        for other in &self.responses {
            if other.site == reference.site {
                continue;
            }
            if other.status != reference.status {
                state = CounterState::Abort;
                divergence = reference
                    .hash
                    .first_divergence(&other.hash)
                    .map(|d| (other.site, d));
                break;
            }
            if let Some(d) = reference.hash.first_divergence(&other.hash) {
                if state == CounterState::Done {
                    state = CounterState::Mismatch;
                    divergence = Some((other.site, d));
                }
            }
        }
        self.state = state;
        self.divergence = divergence;
    }
}

/// Serializable view of a counter for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CounterDump {
    /// Tracking key
    pub key: CounterKey,
    /// Current state
    pub state: CounterState,
    /// Sites still expected
    pub expected: Vec<SiteId>,
    /// Sites that answered
    pub responded: Vec<SiteId>,
    /// Offers not counted
    pub ignored: u32,
}

impl<R> From<&DuplicateCounter<R>> for CounterDump {
    fn from(counter: &DuplicateCounter<R>) -> Self {
        Self {
            key: counter.key,
            state: counter.state,
            expected: counter.expected.iter().copied().collect(),
            responded: counter.responded(),
            ignored: counter.ignored,
        }
    }
}
