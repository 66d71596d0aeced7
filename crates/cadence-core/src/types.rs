//! Identifier types shared by every component of the core

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Partition identifier. Only the low 14 bits are representable in a handle.
pub type PartitionId = u16;

/// Bits of a handle holding the millisecond timestamp
pub const TIMESTAMP_BITS: u32 = 40;
/// Bits of a handle holding the per-millisecond counter
pub const COUNTER_BITS: u32 = 9;
/// Bits of a handle holding the partition id
pub const PARTITION_BITS: u32 = 14;

/// Largest partition id; reserved for the cluster-wide multi-partition coordinator
pub const MP_PARTITION_ID: PartitionId = (1 << PARTITION_BITS) - 1;
/// Largest counter value before the timestamp must move forward
pub const MAX_COUNTER: u64 = (1 << COUNTER_BITS) - 1;
/// Largest representable timestamp offset
pub const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;

const COUNTER_SHIFT: u32 = PARTITION_BITS;
const TIMESTAMP_SHIFT: u32 = PARTITION_BITS + COUNTER_BITS;
const PARTITION_MASK: u64 = (1 << PARTITION_BITS) - 1;

/// Composite ordering handle: `{timestamp:40, counter:9, partition:14}`.
///
/// Handles compare as plain integers, so a later timestamp always sorts after an
/// earlier one and the counter breaks ties inside a millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnHandle(u64);

impl TxnHandle {
    /// Sorts before every allocated handle
    pub const MIN: TxnHandle = TxnHandle(0);

    /// Compose a handle from its parts
    pub fn compose(timestamp: u64, counter: u64, partition: PartitionId) -> Self {
        debug_assert!(timestamp <= MAX_TIMESTAMP);
        debug_assert!(counter <= MAX_COUNTER);
        Self(
            (timestamp << TIMESTAMP_SHIFT)
                | (counter << COUNTER_SHIFT)
                | (partition as u64 & PARTITION_MASK),
        )
    }

    /// Wrap a raw handle value
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw integer value
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Timestamp component, milliseconds since the allocator epoch
    pub fn timestamp(self) -> u64 {
        self.0 >> TIMESTAMP_SHIFT
    }

    /// Counter component
    pub fn counter(self) -> u64 {
        (self.0 >> COUNTER_SHIFT) & MAX_COUNTER
    }

    /// Partition component
    pub fn partition(self) -> PartitionId {
        (self.0 & PARTITION_MASK) as PartitionId
    }

    /// True for handles minted by the multi-partition coordinator
    pub fn is_multi_partition(self) -> bool {
        self.partition() == MP_PARTITION_ID
    }
}

impl fmt::Display for TxnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.timestamp(),
            self.counter(),
            self.partition()
        )
    }
}

/// Site identifier: host id in the high word, local site index in the low word
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(u64);

impl SiteId {
    /// Build a site id from host and local index
    pub fn new(host: u32, index: u32) -> Self {
        Self(((host as u64) << 32) | index as u64)
    }

    /// Wrap a raw site id
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw integer value
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Host the site runs on
    pub fn host(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Site index within its host
    pub fn index(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.index())
    }
}

impl FromStr for SiteId {
    type Err = crate::Error;

    /// Parse `host:index`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, index) = s
            .split_once(':')
            .ok_or_else(|| crate::Error::config(format!("site id '{}' is not host:index", s)))?;
        let host = host
            .trim()
            .parse()
            .map_err(|_| crate::Error::config(format!("bad host in site id '{}'", s)))?;
        let index = index
            .trim()
            .parse()
            .map_err(|_| crate::Error::config(format!("bad index in site id '{}'", s)))?;
        Ok(Self::new(host, index))
    }
}

/// Client-interface handle used to route a terminal response back to its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientHandle(pub u64);

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Role a site plays for one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionRole {
    /// Authoritative site: allocates handles and replicates
    Leader,
    /// Passive mirror applying leader-ordered work
    Replica,
}

/// Ordered list of sites replicating a partition, the leader included.
///
/// A replica set is never patched in place: membership changes install a new one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet(Vec<SiteId>);

impl ReplicaSet {
    /// Build a replica set, dropping duplicate entries but keeping order
    pub fn new(sites: impl IntoIterator<Item = SiteId>) -> Self {
        let mut out: Vec<SiteId> = Vec::new();
        for site in sites {
            if !out.contains(&site) {
                out.push(site);
            }
        }
        Self(out)
    }

    /// Is the site a member
    pub fn contains(&self, site: SiteId) -> bool {
        self.0.contains(&site)
    }

    /// Members other than `local`, in set order
    pub fn others(&self, local: SiteId) -> Vec<SiteId> {
        self.0.iter().copied().filter(|s| *s != local).collect()
    }

    /// Members as a slice
    pub fn as_slice(&self) -> &[SiteId] {
        &self.0
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no members
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate members
    pub fn iter(&self) -> impl Iterator<Item = &SiteId> {
        self.0.iter()
    }
}

impl FromIterator<SiteId> for ReplicaSet {
    fn from_iter<I: IntoIterator<Item = SiteId>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_components() {
        let handle = TxnHandle::compose(123_456, 17, 42);
        assert_eq!(handle.timestamp(), 123_456);
        assert_eq!(handle.counter(), 17);
        assert_eq!(handle.partition(), 42);
        assert!(!handle.is_multi_partition());
        assert_eq!(handle.to_string(), "123456:17:42");
    }

    #[test]
    fn test_handle_ordering_follows_time_then_counter() {
        let early = TxnHandle::compose(10, MAX_COUNTER, 5);
        let late = TxnHandle::compose(11, 0, 0);
        assert!(early < late);
        assert!(TxnHandle::compose(10, 1, 0) < TxnHandle::compose(10, 2, 0));
    }

    #[test]
    fn test_mp_partition_reserved() {
        let handle = TxnHandle::compose(1, 0, MP_PARTITION_ID);
        assert!(handle.is_multi_partition());
    }

    #[test]
    fn test_site_id_parts() {
        let site = SiteId::new(3, 9);
        assert_eq!(site.host(), 3);
        assert_eq!(site.index(), 9);
        assert_eq!(site.to_string(), "3:9");
        assert!(SiteId::new(1, 100) < SiteId::new(2, 0));
        assert_eq!("3:9".parse::<SiteId>().unwrap(), site);
        assert!("39".parse::<SiteId>().is_err());
    }

    #[test]
    fn test_replica_set_dedup_and_others() {
        let a = SiteId::new(0, 0);
        let b = SiteId::new(1, 0);
        let set = ReplicaSet::new([a, b, a]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.others(a), vec![b]);
        assert!(set.contains(b));
    }
}
