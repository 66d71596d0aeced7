//! Settlement tracking for repair-log truncation
//!
//! Handles settle out of order (a replica may answer a later transaction first).
//! The truncation point may only move up to the highest settled handle that has
//! no unsettled handle below it.

use crate::types::TxnHandle;
use std::collections::BTreeSet;

#[derive(Debug, Default, Clone)]
pub(crate) struct Settlement {
    inflight: BTreeSet<TxnHandle>,
    settled: BTreeSet<TxnHandle>,
}

impl Settlement {
    pub(crate) fn begin(&mut self, handle: TxnHandle) {
        self.inflight.insert(handle);
    }

    /// Mark `handle` settled; returns the new truncation point if it moved.
    pub(crate) fn settle(&mut self, handle: TxnHandle) -> Option<TxnHandle> {
        if !self.inflight.remove(&handle) {
            return None;
        }
        self.settled.insert(handle);
        let point = match self.inflight.first() {
            Some(floor) => self.settled.range(..*floor).next_back().copied(),
            None => self.settled.last().copied(),
        }?;
        self.settled = self.settled.split_off(&point);
        self.settled.remove(&point);
        Some(point)
    }

    pub(crate) fn min_inflight(&self) -> Option<TxnHandle> {
        self.inflight.first().copied()
    }

    pub(crate) fn inflight(&self) -> impl Iterator<Item = TxnHandle> + '_ {
        self.inflight.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(ts: u64) -> TxnHandle {
        TxnHandle::compose(ts, 0, 1)
    }

    #[test]
    fn test_in_order_settlement_advances() {
        let mut s = Settlement::default();
        s.begin(h(1));
        s.begin(h(2));
        assert_eq!(s.settle(h(1)), Some(h(1)));
        assert_eq!(s.settle(h(2)), Some(h(2)));
        assert_eq!(s.min_inflight(), None);
    }

    #[test]
    fn test_out_of_order_settlement_waits_for_gap() {
        let mut s = Settlement::default();
        for ts in 1..=3 {
            s.begin(h(ts));
        }
        assert_eq!(s.settle(h(3)), None);
        assert_eq!(s.settle(h(2)), None);
        assert_eq!(s.settle(h(1)), Some(h(3)));
    }

    #[test]
    fn test_unknown_handle_ignored() {
        let mut s = Settlement::default();
        assert_eq!(s.settle(h(9)), None);
    }
}
