//! Seams to the execution engine and the command log
//!
//! The core never interprets transaction payloads. It hands work to an
//! [`ExecutionEngine`] and inspects only the returned [`ExecutionHash`] and
//! [`TxnStatus`]. Durability is delegated to a [`CommandLog`], invoked before
//! work is admitted to replication.

use crate::Result;
use crate::protocol::{FragmentTask, WorkUnit};
use crate::types::{PartitionId, SiteId, TxnHandle};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Commit outcome reported by the execution engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    /// Transaction committed
    Committed,
    /// Transaction rolled back
    Aborted,
}

/// First position at which two executions disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Divergence {
    /// Hash of the statement at this index differs
    Statement(usize),
    /// The divergence lies beyond the tracked statement window
    TooManyStatements,
    /// The executions ran against different catalog versions
    CatalogVersionSkew,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Statement(index) => write!(f, "statement {}", index),
            Self::TooManyStatements => write!(f, "beyond tracked statements"),
            Self::CatalogVersionSkew => write!(f, "catalog version skew"),
        }
    }
}

/// Determinism fingerprint of one execution: one hash per executed statement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHash {
    /// Catalog version the work executed against
    pub catalog_version: u32,
    /// Per-statement content hashes, in execution order
    pub statements: Vec<u32>,
    /// More statements ran than were tracked
    pub saturated: bool,
}

impl ExecutionHash {
    /// Fingerprint statement outputs, keeping at most `max_tracked` hashes
    pub fn from_statements<'a>(
        catalog_version: u32,
        statements: impl IntoIterator<Item = &'a [u8]>,
        max_tracked: usize,
    ) -> Self {
        let mut hashes = Vec::new();
        let mut saturated = false;
        for statement in statements {
            if hashes.len() == max_tracked {
                saturated = true;
                break;
            }
            hashes.push(crc32fast::hash(statement));
        }
        Self {
            catalog_version,
            statements: hashes,
            saturated,
        }
    }

    /// Compare position by position; `None` when the executions agree
    pub fn first_divergence(&self, other: &ExecutionHash) -> Option<Divergence> {
        if self.catalog_version != other.catalog_version {
            return Some(Divergence::CatalogVersionSkew);
        }
        let common = self.statements.len().min(other.statements.len());
        if let Some(index) = (0..common).find(|&i| self.statements[i] != other.statements[i]) {
            return Some(Divergence::Statement(index));
        }
        if self.statements.len() != other.statements.len() {
            return Some(Divergence::Statement(common));
        }
        if self.saturated != other.saturated {
            return Some(Divergence::TooManyStatements);
        }
        None
    }
}

/// Output dependency produced by a fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Dependency id the coordinator waits on
    pub id: u32,
    /// Serialized result table
    pub data: Vec<u8>,
}

/// What the execution engine reports for one unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Commit or abort
    pub status: TxnStatus,
    /// Determinism fingerprint
    pub hash: ExecutionHash,
    /// Opaque result payload returned to the client
    pub payload: Vec<u8>,
    /// Fragment output dependencies, empty for single-partition work
    pub dependencies: Vec<Dependency>,
}

impl ExecutionResult {
    /// Committed result with no fragment output
    pub fn committed(hash: ExecutionHash, payload: Vec<u8>) -> Self {
        Self {
            status: TxnStatus::Committed,
            hash,
            payload,
            dependencies: Vec::new(),
        }
    }

    /// Aborted result with no fragment output
    pub fn aborted(hash: ExecutionHash, payload: Vec<u8>) -> Self {
        Self {
            status: TxnStatus::Aborted,
            hash,
            payload,
            dependencies: Vec::new(),
        }
    }

    /// True when the engine committed the work
    pub fn is_committed(&self) -> bool {
        self.status == TxnStatus::Committed
    }
}

/// Work handed to the execution engine
#[derive(Debug, Clone, Copy)]
pub enum ExecutionRequest<'a> {
    /// A single-partition procedure
    Procedure(&'a WorkUnit),
    /// One fragment of a multi-partition transaction
    Fragment(&'a FragmentTask),
}

/// Deterministic executor for one partition's data
pub trait ExecutionEngine: Send {
    /// Execute work at `handle`
    fn execute(&mut self, handle: TxnHandle, request: ExecutionRequest<'_>) -> ExecutionResult;

    /// Finish a multi-partition transaction after its last fragment
    fn complete(&mut self, txn_id: TxnHandle, commit: bool);
}

/// Viable replay set written to the command log after membership changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Site writing the record
    pub site: SiteId,
    /// Replica set in force at `handle`
    pub replicas: Vec<SiteId>,
    /// Partition the record belongs to
    pub partition: PartitionId,
    /// Fault handle allocated by the leader
    pub handle: TxnHandle,
}

/// Durable command log collaborator
pub trait CommandLog: Send {
    /// Durably record work before it is admitted to replication
    fn log(&mut self, handle: TxnHandle, work: &WorkUnit) -> Result<()>;

    /// Record the viable replay set after a membership change
    fn log_fault(&mut self, record: FaultRecord) -> Result<()>;

    /// Record a multi-partition transaction rolled back because of a fault
    fn log_mp_fault(&mut self, txn_id: TxnHandle) -> Result<()>;
}

/// Command log that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCommandLog;

impl CommandLog for NoopCommandLog {
    fn log(&mut self, _handle: TxnHandle, _work: &WorkUnit) -> Result<()> {
        Ok(())
    }

    fn log_fault(&mut self, _record: FaultRecord) -> Result<()> {
        Ok(())
    }

    fn log_mp_fault(&mut self, _txn_id: TxnHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(statements: &[&str]) -> ExecutionHash {
        ExecutionHash::from_statements(1, statements.iter().map(|s| s.as_bytes()), 8)
    }

    #[test]
    fn test_identical_hashes_agree() {
        assert_eq!(hash(&["a", "b"]).first_divergence(&hash(&["a", "b"])), None);
    }

    #[test]
    fn test_first_differing_statement_reported() {
        let left = hash(&["a", "b", "c"]);
        let right = hash(&["a", "x", "y"]);
        assert_eq!(left.first_divergence(&right), Some(Divergence::Statement(1)));
    }

    #[test]
    fn test_length_difference_reported_at_end_of_common_prefix() {
        let left = hash(&["a", "b"]);
        let right = hash(&["a"]);
        assert_eq!(left.first_divergence(&right), Some(Divergence::Statement(1)));
    }

    #[test]
    fn test_catalog_skew_sentinel() {
        let left = hash(&["a"]);
        let mut right = hash(&["a"]);
        right.catalog_version = 2;
        assert_eq!(
            left.first_divergence(&right),
            Some(Divergence::CatalogVersionSkew)
        );
    }

    #[test]
    fn test_saturation_sentinel() {
        let statements: Vec<&[u8]> = vec![&b"a"[..], &b"b"[..], &b"c"[..]];
        let left = ExecutionHash::from_statements(1, statements.clone(), 2);
        assert!(left.saturated);
        let mut right = left.clone();
        right.saturated = false;
        assert_eq!(
            left.first_divergence(&right),
            Some(Divergence::TooManyStatements)
        );
    }
}
