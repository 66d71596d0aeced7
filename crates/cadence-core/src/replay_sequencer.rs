//! Replay sequencer
//!
//! During command-log replay the multi-partition side and the partition's own
//! stream are read independently. A sentinel marks where a multi-partition
//! transaction sits in this partition's order; its first fragment arrives on a
//! different stream. The sequencer holds both halves until they pair, and holds
//! single-partition work that must not overtake a pending sentinel.
//!
//! Once the multi-partition side reports end-of-log while a sentinel here is
//! still unpaired, no legal ordering exists for what is buffered. `drain()` then
//! hands everything back to be answered with a synthetic "ignored" response.

use crate::protocol::Message;
use crate::types::TxnHandle;
use std::collections::{BTreeMap, VecDeque};

/// What `offer` did with a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequenced {
    /// Held until its ordering is known
    Buffered,
    /// Not subject to sequencing; execute it now
    Deliver(Message),
}

impl Sequenced {
    /// True when the sequencer kept the message
    pub fn is_buffered(&self) -> bool {
        matches!(self, Self::Buffered)
    }
}

/// A buffered message released by `drain()`, to be answered without execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredMessage(pub Message);

#[derive(Debug, Default)]
struct ReplayEntry {
    sentinel: bool,
    first_fragment: Option<Message>,
    blocked: VecDeque<Message>,
    served: bool,
}

impl ReplayEntry {
    fn is_ready(&self) -> bool {
        self.sentinel && (self.first_fragment.is_some() || self.served)
    }

    fn is_exhausted(&self) -> bool {
        self.served && self.blocked.is_empty()
    }
}

/// Pairs multi-partition sentinels with first fragments during replay
#[derive(Debug, Default)]
pub struct ReplaySequencer {
    entries: BTreeMap<TxnHandle, ReplayEntry>,
    last_polled_fragment: Option<TxnHandle>,
    mp_end_of_log: bool,
    draining: bool,
}

impl ReplaySequencer {
    /// Empty sequencer
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a replayed message. `unique_id` is the multi-partition transaction id
    /// for sentinels, fragments and completions, and the handle otherwise.
    pub fn offer(&mut self, unique_id: TxnHandle, message: Message) -> Sequenced {
        match message {
            Message::EndOfLog { .. } => {
                self.mp_end_of_log = true;
                Sequenced::Buffered
            }
            Message::MultipartSentinel { .. } => {
                self.entries.entry(unique_id).or_default().sentinel = true;
                Sequenced::Buffered
            }
            Message::Fragment(_) => {
                if self.last_polled_fragment == Some(unique_id) && !self.entries.contains_key(&unique_id) {
                    return Sequenced::Deliver(message);
                }
                let entry = self.entries.entry(unique_id).or_default();
                if entry.first_fragment.is_none() && !entry.served {
                    entry.first_fragment = Some(message);
                } else {
                    entry.blocked.push_back(message);
                }
                Sequenced::Buffered
            }
            Message::Complete(_) => match self.entries.get_mut(&unique_id) {
                Some(entry) => {
                    entry.blocked.push_back(message);
                    Sequenced::Buffered
                }
                None => Sequenced::Deliver(message),
            },
            Message::Initiate(_) => match self.entries.values_mut().next_back() {
                Some(last) if last.sentinel => {
                    last.blocked.push_back(message);
                    Sequenced::Buffered
                }
                _ => Sequenced::Deliver(message),
            },
            other => Sequenced::Deliver(other),
        }
    }

    /// Next message in replay order, `None` when blocked.
    ///
    /// Must not be called once `drain()` has started yielding.
    pub fn poll(&mut self) -> Option<Message> {
        if self.draining {
            return None;
        }
        loop {
            let (&key, head) = self.entries.iter_mut().next()?;
            if !head.is_ready() {
                return None;
            }
            if !head.served {
                head.served = true;
                self.last_polled_fragment = Some(key);
                if let Some(fragment) = head.first_fragment.take() {
                    return Some(fragment);
                }
            }
            if let Some(next) = head.blocked.pop_front() {
                return Some(next);
            }
            if head.is_exhausted() {
                self.entries.remove(&key);
            }
        }
    }

    /// Once no legal order remains, release buffered messages one at a time
    pub fn drain(&mut self) -> Option<IgnoredMessage> {
        if !self.draining {
            let head_unpaired = self
                .entries
                .values()
                .next()
                .is_some_and(|head| head.sentinel && head.first_fragment.is_none() && !head.served);
            if !(self.mp_end_of_log && head_unpaired) {
                return None;
            }
            tracing::warn!(buffered = self.entries.len(), "Replay cannot be ordered past end of log; draining");
            self.draining = true;
        }
        loop {
            let (&key, head) = self.entries.iter_mut().next()?;
            if let Some(fragment) = head.first_fragment.take() {
                return Some(IgnoredMessage(fragment));
            }
            if let Some(next) = head.blocked.pop_front() {
                return Some(IgnoredMessage(next));
            }
            self.entries.remove(&key);
        }
    }

    /// True once drain mode is active
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
