//! Outbound seam of a partition coordinator
//!
//! The coordinator never touches the network. Everything it emits goes through
//! a [`Mailbox`]: protocol messages to other sites, terminal responses to
//! clients, and cluster-visible events.

use crate::duplicate_counter::CounterState;
use crate::engine::Divergence;
use crate::protocol::Message;
use crate::types::{ClientHandle, PartitionId, SiteId, TxnHandle};
use serde::{Deserialize, Serialize};

/// Terminal status reported to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Work committed
    Committed,
    /// Work rolled back
    Aborted,
    /// Work could not be ordered during replay and was skipped
    Ignored,
    /// Work was bounced during a leadership change; resubmit to the current leader
    Restart,
}

/// The one terminal response a client receives for a unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    /// Partition that handled the work
    pub partition: PartitionId,
    /// Caller's handle
    pub client: ClientHandle,
    /// Client-interface site to route to
    pub initiator: SiteId,
    /// Handle the work ran at; `TxnHandle::MIN` if it never ran
    pub handle: TxnHandle,
    /// Outcome
    pub status: ResponseStatus,
    /// Result payload
    pub payload: Vec<u8>,
}

/// Cluster-visible events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClusterEvent {
    /// Sites disagreed about a transaction's result; the partition runs with reduced safety
    Nondeterminism {
        /// Partition that diverged
        partition: PartitionId,
        /// Divergent transaction
        handle: TxnHandle,
        /// Mismatch or abort
        state: CounterState,
        /// Site disagreeing with the leader, and where
        divergence: Option<(SiteId, Divergence)>,
    },
    /// A site finished promotion and leads the partition
    LeaderPromoted {
        /// Partition
        partition: PartitionId,
        /// New leader
        site: SiteId,
        /// Allocation floor learned from survivors
        max_handle: TxnHandle,
    },
    /// A protocol invariant broke; the partition stopped on this site
    Fatal {
        /// Partition
        partition: PartitionId,
        /// Site that stopped
        site: SiteId,
        /// Error text
        error: String,
    },
}

/// Outbound channel of one coordinator
pub trait Mailbox: Send + Sync {
    /// Send a protocol message to a site
    fn send(&self, to: SiteId, message: Message);

    /// Send the same message to several sites
    fn send_many(&self, to: &[SiteId], message: &Message) {
        for site in to {
            self.send(*site, message.clone());
        }
    }

    /// Deliver a terminal client response
    fn respond(&self, response: ClientResponse);

    /// Publish a cluster-visible event
    fn report(&self, event: ClusterEvent);
}
