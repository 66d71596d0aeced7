//! Cadence Core - Partition Replication and Recovery
//!
//! Each partition of a partitioned transactional store has one leader and a set
//! of replicas. This crate keeps them in lock-step:
//! - Monotonic per-partition ordering handles (clock-regression safe)
//! - Leader-ordered replication with duplicate counters that compare
//!   replica results and flag non-determinism
//! - A bounded repair log per site, merged by a newly promoted leader to
//!   bring every survivor to the same state
//! - Graceful leader migration with a drain handshake
//! - Ordering of command-log replay around multi-partition sentinels
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        actor (one queue per partition)      │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │            PartitionCoordinator             │
//! │  unique_id · duplicate_counter · migration  │
//! │  repair_log · promotion · replay_sequencer  │
//! └──────┬───────────────┬───────────────┬──────┘
//!        │               │               │
//! ┌──────┴─────┐  ┌──────┴──────┐  ┌─────┴──────┐
//! │  engine    │  │  Mailbox    │  │  topology  │
//! │ (execute,  │  │ (protocol   │  │ (leaders,  │
//! │  cmd log)  │  │  messages)  │  │  replicas) │
//! └────────────┘  └─────────────┘  └────────────┘
//! ```

#![warn(clippy::all)]

pub mod actor;
pub mod config;
pub mod coordinator;
pub mod duplicate_counter;
pub mod engine;
pub mod error;
pub mod migration;
pub mod multipart;
pub mod promotion;
pub mod protocol;
pub mod repair_log;
pub mod replay_sequencer;
pub mod testing;
pub mod topology;
pub mod types;
pub mod unique_id;

pub use config::{CoordinatorConfig, LateResponsePolicy, TopologyConfig};
pub use coordinator::{ClientResponse, ClusterEvent, CoordinatorDump, Mailbox, PartitionCoordinator, ResponseStatus};
pub use error::{Error, Result};
pub use protocol::{Message, WorkUnit};
pub use types::{ClientHandle, PartitionId, PartitionRole, ReplicaSet, SiteId, TxnHandle};
