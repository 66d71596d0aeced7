//! Repair log
//!
//! A bounded, per-partition journal of recent work. Every site appends the work
//! it applies; the leader piggybacks its truncation handle on replicated work so
//! replicas trim in step. A newly promoted leader collects the logs of all
//! survivors and replays their union so nobody misses work the old leader sent
//! to only some of them.

use crate::protocol::{CompleteTransaction, FragmentTask, InitiateTask, Message, Origin, RepairLogPage, WorkUnit};
use crate::types::{SiteId, TxnHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// What a repair-log entry records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairPayload {
    /// Single-partition work; terminal
    SinglePartition(WorkUnit),
    /// First fragment of a multi-partition transaction; not terminal
    Fragment(FragmentTask),
    /// Multi-partition completion, folded with its fragment when known; terminal
    Complete {
        complete: CompleteTransaction,
        fragment: Option<FragmentTask>,
    },
}

/// One journaled piece of work, keyed by handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairLogEntry {
    /// Ordering handle
    pub handle: TxnHandle,
    /// Recorded work
    pub payload: RepairPayload,
}

impl RepairLogEntry {
    /// Entry for single-partition work
    pub fn single_partition(handle: TxnHandle, work: WorkUnit) -> Self {
        Self {
            handle,
            payload: RepairPayload::SinglePartition(work),
        }
    }

    /// Entry for a multi-partition fragment
    pub fn fragment(task: FragmentTask) -> Self {
        Self {
            handle: task.handle,
            payload: RepairPayload::Fragment(task),
        }
    }

    /// Entry for a multi-partition completion
    pub fn complete(complete: CompleteTransaction) -> Self {
        Self {
            handle: complete.handle,
            payload: RepairPayload::Complete {
                complete,
                fragment: None,
            },
        }
    }

    /// Terminal entries supersede fragments recorded under the same handle
    pub fn is_terminal(&self) -> bool {
        !matches!(self.payload, RepairPayload::Fragment(_))
    }

    /// Messages that re-apply this entry on a survivor missing it
    pub fn repair_messages(&self, truncation: TxnHandle) -> Vec<Message> {
        match &self.payload {
            RepairPayload::SinglePartition(work) => vec![Message::Initiate(InitiateTask {
                handle: self.handle,
                truncation,
                origin: Origin::Repair,
                work: work.clone(),
            })],
            RepairPayload::Fragment(task) => vec![Message::Fragment(as_repair_fragment(task, truncation))],
            RepairPayload::Complete { complete, fragment } => {
                let mut out = Vec::with_capacity(2);
                if let Some(task) = fragment {
                    out.push(Message::Fragment(as_repair_fragment(task, truncation)));
                }
                out.push(Message::Complete(CompleteTransaction {
                    origin: Origin::Repair,
                    truncation,
                    ..complete.clone()
                }));
                out
            }
        }
    }
}

fn as_repair_fragment(task: &FragmentTask, truncation: TxnHandle) -> FragmentTask {
    FragmentTask {
        origin: Origin::Repair,
        truncation,
        ..task.clone()
    }
}

/// Merge `entry` into an ordered union.
///
/// A terminal entry replaces a fragment with the same handle (absorbing the
/// fragment so the repair can re-run it); otherwise the first entry seen wins.
/// Returns true if the union changed.
pub fn merge_entry(union: &mut BTreeMap<TxnHandle, RepairLogEntry>, entry: RepairLogEntry) -> bool {
    match union.entry(entry.handle) {
        Entry::Vacant(slot) => {
            slot.insert(entry);
            true
        }
        Entry::Occupied(mut slot) => {
            if slot.get().is_terminal() || !entry.is_terminal() {
                return false;
            }
            let mut entry = entry;
            if let (
                RepairPayload::Fragment(existing),
                RepairPayload::Complete { fragment, .. },
            ) = (&slot.get().payload, &mut entry.payload)
            {
                if fragment.is_none() {
                    *fragment = Some(existing.clone());
                }
            }
            slot.insert(entry);
            true
        }
    }
}

/// Per-partition journal of recent work
#[derive(Debug, Clone)]
pub struct RepairLog {
    entries: BTreeMap<TxnHandle, RepairLogEntry>,
    truncation: TxnHandle,
    max_handle: TxnHandle,
    page_size: usize,
}

impl RepairLog {
    /// Empty log paginating `page_size` entries per response page
    pub fn new(page_size: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            truncation: TxnHandle::MIN,
            max_handle: TxnHandle::MIN,
            page_size: page_size.max(1),
        }
    }

    /// Record an entry. Entries below the truncation handle are ignored.
    pub fn append(&mut self, entry: RepairLogEntry) -> bool {
        if entry.handle < self.truncation {
            tracing::debug!(handle = %entry.handle, truncation = %self.truncation, "Ignoring repair-log entry below truncation point");
            return false;
        }
        self.max_handle = self.max_handle.max(entry.handle);
        merge_entry(&mut self.entries, entry)
    }

    /// Note a handle seen without journaling it (reads, fault markers)
    pub fn observe(&mut self, handle: TxnHandle) {
        self.max_handle = self.max_handle.max(handle);
    }

    /// Drop everything strictly below `handle`. The truncation point never moves back.
    pub fn truncate(&mut self, handle: TxnHandle) {
        if handle <= self.truncation {
            return;
        }
        self.truncation = handle;
        self.entries = self.entries.split_off(&handle);
    }

    /// Snapshot of the log as response pages for promotion attempt `request_id`.
    ///
    /// An empty log still yields one (empty) page so the requester can detect completion.
    pub fn contents(&self, request_id: u64, site: SiteId) -> Vec<RepairLogPage> {
        let entries: Vec<RepairLogEntry> = self.entries.values().cloned().collect();
        let chunks: Vec<Vec<RepairLogEntry>> = if entries.is_empty() {
            vec![Vec::new()]
        } else {
            entries.chunks(self.page_size).map(|c| c.to_vec()).collect()
        };
        let of_total = chunks.len() as u32;
        chunks
            .into_iter()
            .enumerate()
            .map(|(sequence, entries)| RepairLogPage {
                request_id,
                site,
                sequence: sequence as u32,
                of_total,
                max_handle: self.max_handle,
                entries,
            })
            .collect()
    }

    /// Current truncation handle
    pub fn truncation(&self) -> TxnHandle {
        self.truncation
    }

    /// Highest handle appended or observed
    pub fn max_handle(&self) -> TxnHandle {
        self.max_handle
    }

    /// Entry at `handle`
    pub fn get(&self, handle: TxnHandle) -> Option<&RepairLogEntry> {
        self.entries.get(&handle)
    }

    /// Entries in handle order
    pub fn iter(&self) -> impl Iterator<Item = &RepairLogEntry> {
        self.entries.values()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is retained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
