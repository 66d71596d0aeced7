//! Error types for Cadence Core

use crate::types::{PartitionId, SiteId, TxnHandle};
use thiserror::Error;

/// Result type alias using Cadence Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replication core
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from the wire codec
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire encode/decode errors (bad frame, CRC mismatch, unknown type)
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Retryable errors (a survivor disconnecting mid-fetch, a busy queue)
    #[error("Transient error: {0}")]
    Transient(String),

    /// Replicas produced different results for the same transaction
    #[error("Non-determinism on partition {partition} for {handle}: {detail}")]
    Nondeterminism {
        /// Partition that diverged
        partition: PartitionId,
        /// Handle of the divergent transaction
        handle: TxnHandle,
        /// Human readable divergence summary
        detail: String,
    },

    /// Protocol invariant violations; the local partition must stop
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Work delivered to a site that may not process it right now
    #[error("Misrouted work for partition {partition} at site {site}")]
    Misrouted {
        /// Partition the work was addressed to
        partition: PartitionId,
        /// Site that bounced the work
        site: SiteId,
    },

    /// Promotion cancelled before it could resolve
    #[error("Promotion cancelled: {0}")]
    Cancelled(String),

    /// Multi-partition transaction terminated by an explicit poison message
    #[error("Transaction terminated: {0}")]
    Terminated(String),

    /// The peer end of an internal channel went away
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a termination error
    pub fn terminated(msg: impl Into<String>) -> Self {
        Self::Terminated(msg.into())
    }

    /// Create a channel-closed error
    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Self::ChannelClosed(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Errors after which the local partition must not keep processing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// Errors the caller may retry after the cluster settles.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Misrouted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::invariant("duplicate tracking key").is_fatal());
        assert!(!Error::transient("survivor went away").is_fatal());
        assert!(Error::transient("survivor went away").is_retryable());
        assert!(
            Error::Misrouted {
                partition: 3,
                site: SiteId::new(1, 2),
            }
            .is_retryable()
        );
        assert!(!Error::cancelled("superseded").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Nondeterminism {
            partition: 7,
            handle: TxnHandle::from_raw(42),
            detail: "statement 2 differs".into(),
        };
        let text = err.to_string();
        assert!(text.contains("partition 7"));
        assert!(text.contains("statement 2 differs"));
    }
}
