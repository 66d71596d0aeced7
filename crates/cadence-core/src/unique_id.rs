//! Unique-ID allocator
//!
//! Mints strictly increasing [`TxnHandle`]s for one partition. Handles pack a
//! millisecond timestamp (relative to [`EPOCH_MS`]), a 9-bit counter and the
//! partition id. Wall-clock regressions are absorbed by an additive offset that
//! only ever grows and can be persisted by the host through
//! [`UniqueIdGenerator::offset_ms`] / [`UniqueIdGenerator::with_offset`].

use crate::types::{MAX_COUNTER, MAX_TIMESTAMP, PartitionId, TxnHandle};
use crate::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Allocator epoch: 2008-01-01T00:00:00Z in unix milliseconds
pub const EPOCH_MS: i64 = 1_199_145_600_000;

/// Source of wall-clock time in unix milliseconds
pub trait Clock: Send + Sync {
    /// Current time in unix milliseconds
    fn now_ms(&self) -> i64;
}

/// Wall clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually driven clock, shared between clones
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock reading `now_ms`
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now_ms)),
        }
    }

    /// Set the reading
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Move the reading by `delta_ms`, which may be negative
    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Monotonic handle allocator for a single partition
pub struct UniqueIdGenerator {
    partition: PartitionId,
    clock: Box<dyn Clock>,
    /// Added to every clock reading; grows on regression, never shrinks
    offset_ms: i64,
    /// Highest adjusted clock reading seen
    clock_high_water: u64,
    last_timestamp: u64,
    counter: u64,
    last: TxnHandle,
}

impl UniqueIdGenerator {
    /// Allocator for `partition` reading the system clock
    pub fn new(partition: PartitionId) -> Self {
        Self::with_clock(partition, Box::new(SystemClock))
    }

    /// Allocator for `partition` reading `clock`
    pub fn with_clock(partition: PartitionId, clock: Box<dyn Clock>) -> Self {
        Self {
            partition,
            clock,
            offset_ms: 0,
            clock_high_water: 0,
            last_timestamp: 0,
            counter: 0,
            last: TxnHandle::MIN,
        }
    }

    /// Restore a previously persisted offset
    pub fn with_offset(mut self, offset_ms: i64) -> Self {
        self.offset_ms = offset_ms.max(0);
        self
    }

    /// Current additive clock offset
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    /// Partition the allocator serves
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Last handle allocated or observed
    pub fn last(&self) -> TxnHandle {
        self.last
    }

    /// Allocate the next handle
    pub fn next(&mut self) -> Result<TxnHandle> {
        let reading = self.adjusted_reading()?;

        let mut timestamp = reading.max(self.last_timestamp);
        let counter = if timestamp == self.last_timestamp {
            if self.counter >= MAX_COUNTER {
                // Counter exhausted: borrow the next millisecond.
                timestamp += 1;
                0
            } else {
                self.counter + 1
            }
        } else {
            0
        };

        if timestamp > MAX_TIMESTAMP {
            return Err(Error::invariant(format!(
                "partition {} handle timestamp overflow",
                self.partition
            )));
        }

        let handle = TxnHandle::compose(timestamp, counter, self.partition);
        if handle <= self.last {
            return Err(Error::invariant(format!(
                "partition {} re-allocated handle {} (last {})",
                self.partition, handle, self.last
            )));
        }

        self.last_timestamp = timestamp;
        self.counter = counter;
        self.last = handle;
        Ok(handle)
    }

    /// Make sure every future allocation sorts after `handle`.
    ///
    /// Used when a replica adopts leader handles, when command-log replay supplies
    /// handles, and after promotion learns the highest repaired handle.
    pub fn observe(&mut self, handle: TxnHandle) {
        if handle <= self.last {
            return;
        }
        self.last = handle;
        let timestamp = handle.timestamp();
        if timestamp > self.last_timestamp {
            self.last_timestamp = timestamp;
            self.counter = handle.counter();
        } else if timestamp == self.last_timestamp {
            self.counter = self.counter.max(handle.counter());
        }
    }

    /// Unix milliseconds encoded in a handle
    pub fn unix_millis(handle: TxnHandle) -> i64 {
        handle.timestamp() as i64 + EPOCH_MS
    }

    fn adjusted_reading(&mut self) -> Result<u64> {
        let raw = self.clock.now_ms() - EPOCH_MS + self.offset_ms;
        if raw < 0 {
            return Err(Error::invariant(format!(
                "clock reads before the allocator epoch ({} ms)",
                raw
            )));
        }
        let mut reading = raw as u64;
        if reading < self.clock_high_water {
            let regression = self.clock_high_water - reading;
            self.offset_ms += regression as i64;
            tracing::warn!(
                partition = self.partition,
                regression_ms = regression,
                offset_ms = self.offset_ms,
                "Clock moved backwards; compensating with offset"
            );
            reading = self.clock_high_water;
        }
        self.clock_high_water = reading;
        Ok(reading)
    }
}

impl std::fmt::Debug for UniqueIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniqueIdGenerator")
            .field("partition", &self.partition)
            .field("offset_ms", &self.offset_ms)
            .field("last", &self.last)
            .finish()
    }
}
