//! # taglog-types: Core types for the taglog coordinator
//!
//! This crate contains the shared vocabulary of the tag-partitioned
//! transaction log system:
//! - Log positions ([`Version`]) and shard identifiers ([`Tag`])
//! - Stable endpoint identity ([`Uid`]) and addressing ([`NetworkAddress`])
//! - Placement metadata ([`LocalityData`])
//! - Epoch counters ([`LogEpoch`])
//! - Quorum arithmetic ([`write_quorum`], [`read_quorum`], [`peek_quorum`])

use std::fmt::{Debug, Display};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Version - Copy (8-byte value)
// ============================================================================

/// A position in the global transaction log.
///
/// Versions are produced by the sequencer and increase monotonically. A
/// commit's version identifies its place in the total order; an epoch is a
/// contiguous range of versions served by one log server set.
///
/// # Invariants
///
/// - Versions are totally ordered across the cluster
/// - A version is never reused once assigned
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Version(u64);

impl Version {
    /// The initial version (before any commit).
    pub const ZERO: Version = Version(0);

    /// The largest representable version, used as an unbounded upper limit.
    pub const MAX: Version = Version(u64::MAX);

    /// Creates a version from a raw value.
    pub fn new(v: u64) -> Self {
        Self(v)
    }

    /// Returns the version as a `u64`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Version(self.0.saturating_add(1))
    }

    /// Returns this version lowered by `delta`, floored at zero.
    pub fn saturating_back(&self, delta: u64) -> Self {
        Version(self.0.saturating_sub(delta))
    }

    /// Returns true if this is version zero.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<Version> for u64 {
    fn from(v: Version) -> Self {
        v.0
    }
}

// ============================================================================
// Tag - Copy (4-byte value)
// ============================================================================

/// Identifier of a logical shard of the log stream.
///
/// The set of tags attached to a commit determines which log servers receive
/// a copy. A tag's primary location in a set of `n` servers is `tag % n`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Tag(u32);

impl Tag {
    /// Creates a tag from a raw value.
    pub fn new(tag: u32) -> Self {
        Self(tag)
    }

    /// Returns the tag as a `u32`.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the tag as a `usize` for location arithmetic.
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl From<u32> for Tag {
    fn from(tag: u32) -> Self {
        Self(tag)
    }
}

impl From<Tag> for u32 {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

// ============================================================================
// Uid - Copy (16-byte value)
// ============================================================================

/// Length of a [`Uid`] in bytes.
pub const UID_LENGTH: usize = 16;

/// Stable unique identifier.
///
/// Used for log server identity, recruitment rounds, and debug correlation.
/// A log server keeps its `Uid` across restarts and rejoins; a handle slot
/// is keyed by it even while the concrete interface is unknown.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Uid([u8; UID_LENGTH]);

impl Uid {
    /// Creates a uid from raw bytes.
    pub fn from_bytes(bytes: [u8; UID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the uid as a byte slice.
    pub fn as_bytes(&self) -> &[u8; UID_LENGTH] {
        &self.0
    }

    /// Generates a new random uid.
    ///
    /// # Panics
    ///
    /// Panics if the OS CSPRNG fails.
    pub fn random() -> Self {
        let mut bytes = [0u8; UID_LENGTH];
        getrandom::fill(&mut bytes).expect("CSPRNG failure is catastrophic");
        Self(bytes)
    }

    /// Deterministic uid for tests and simulation fixtures.
    pub fn from_u64(n: u64) -> Self {
        let mut bytes = [0u8; UID_LENGTH];
        bytes[..8].copy_from_slice(&n.to_be_bytes());
        Self(bytes)
    }
}

impl Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Uid({self})")
    }
}

// ============================================================================
// Log Epoch - Copy (8-byte value)
// ============================================================================

/// Recruitment generation counter.
///
/// Each successful recovery recruits a fresh log server set under the next
/// epoch. Epochs only increase; a log server initialized under an older
/// epoch refuses requests stamped with a newer one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogEpoch(u64);

impl LogEpoch {
    /// The initial epoch.
    pub const ZERO: LogEpoch = LogEpoch(0);

    /// Creates an epoch from a raw value.
    pub fn new(epoch: u64) -> Self {
        Self(epoch)
    }

    /// Returns the epoch as a `u64`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next epoch.
    pub fn next(&self) -> Self {
        LogEpoch(self.0.saturating_add(1))
    }
}

impl Display for LogEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl From<u64> for LogEpoch {
    fn from(epoch: u64) -> Self {
        Self(epoch)
    }
}

// ============================================================================
// Network Address
// ============================================================================

/// Address of a log server endpoint.
///
/// Unresolved interfaces (a server known only by uid, e.g. from persisted
/// state before it rejoins) carry an empty address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct NetworkAddress(Option<SocketAddr>);

impl NetworkAddress {
    /// Creates a resolved address.
    pub fn new(addr: SocketAddr) -> Self {
        Self(Some(addr))
    }

    /// Creates an empty (unresolved) address.
    pub fn empty() -> Self {
        Self(None)
    }

    /// Returns the socket address, if resolved.
    pub fn get(&self) -> Option<SocketAddr> {
        self.0
    }

    /// Returns true if the address is resolved.
    pub fn is_resolved(&self) -> bool {
        self.0.is_some()
    }
}

impl Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{addr}"),
            None => write!(f, "unresolved"),
        }
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(Some(addr))
    }
}

// ============================================================================
// Locality Data
// ============================================================================

/// Keys recognized by [`LocalityData::get`].
pub mod locality_keys {
    pub const ZONE_ID: &str = "zoneid";
    pub const DATA_HALL: &str = "data_hall";
    pub const MACHINE_ID: &str = "machineid";
    pub const PROCESS_ID: &str = "processid";
}

/// Placement metadata for one process.
///
/// Replication policies count distinct values of these fields to decide
/// whether a chosen server subset spans enough failure domains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct LocalityData {
    /// Failure zone (e.g. a rack or availability zone).
    pub zone_id: Option<String>,

    /// Data hall the process runs in.
    pub data_hall: Option<String>,

    /// Physical machine identity.
    pub machine_id: Option<String>,

    /// Process identity.
    pub process_id: Option<String>,
}

impl LocalityData {
    /// Creates empty locality data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the zone id.
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone_id = Some(zone.into());
        self
    }

    /// Sets the data hall.
    pub fn with_data_hall(mut self, hall: impl Into<String>) -> Self {
        self.data_hall = Some(hall.into());
        self
    }

    /// Sets the machine id.
    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine_id = Some(machine.into());
        self
    }

    /// Sets the process id.
    pub fn with_process(mut self, process: impl Into<String>) -> Self {
        self.process_id = Some(process.into());
        self
    }

    /// Looks up a locality field by key (see [`locality_keys`]).
    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            locality_keys::ZONE_ID => self.zone_id.as_deref(),
            locality_keys::DATA_HALL => self.data_hall.as_deref(),
            locality_keys::MACHINE_ID => self.machine_id.as_deref(),
            locality_keys::PROCESS_ID => self.process_id.as_deref(),
            _ => None,
        }
    }

    /// Describes the zones of a set of localities, for logging.
    pub fn describe_zones(items: &[LocalityData]) -> String {
        items
            .iter()
            .map(|l| l.zone_id.as_deref().unwrap_or("[unset]"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Describes the data halls of a set of localities, for logging.
    pub fn describe_data_halls(items: &[LocalityData]) -> String {
        items
            .iter()
            .map(|l| l.data_hall.as_deref().unwrap_or("[unset]"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

// ============================================================================
// Quorum helpers
// ============================================================================

/// Number of acknowledgements a push needs: `n - anti_quorum`.
///
/// # Panics
///
/// Panics if `anti_quorum >= n`.
pub fn write_quorum(n: usize, anti_quorum: usize) -> usize {
    assert!(anti_quorum < n, "anti-quorum must be smaller than the set");
    n - anti_quorum
}

/// Minimum locked responses during recovery: `n + 1 - replication + anti_quorum`.
///
/// A replica set must always contain at least one server that is in both the
/// write quorum and the read quorum. With `n` servers, anti-quorum `a` and
/// replication factor `r`, a write may be missing from `a` servers and a read
/// may miss `n - q` servers; `a + (n - q) < r` forces `q = n + 1 - r + a`.
pub fn read_quorum(n: usize, replication_factor: usize, anti_quorum: usize) -> usize {
    n + 1 + anti_quorum - replication_factor
}

/// Merged-cursor reader count for one epoch: `n + 1 - replication`.
///
/// Reading this many servers guarantees overlap with every copy set chosen
/// under replication factor `replication_factor`.
pub fn peek_quorum(n: usize, replication_factor: usize) -> usize {
    n + 1 - replication_factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = Version::new(100);
        let v2 = Version::new(105);
        assert!(v1 < v2);
        assert_eq!(v1.next(), Version::new(101));
        assert_eq!(v2.saturating_back(200), Version::ZERO);
    }

    #[test]
    fn tag_display() {
        assert_eq!(format!("{}", Tag::new(7)), "t7");
        assert_eq!(Tag::new(9).as_usize(), 9);
    }

    #[test]
    fn uid_roundtrip() {
        let uid = Uid::from_u64(42);
        let json = serde_json::to_string(&uid).unwrap();
        let back: Uid = serde_json::from_str(&json).unwrap();
        assert_eq!(uid, back);
    }

    #[test]
    fn uid_random_is_unique() {
        assert_ne!(Uid::random(), Uid::random());
    }

    #[test]
    fn network_address_display() {
        assert_eq!(format!("{}", NetworkAddress::empty()), "unresolved");
        let addr: SocketAddr = "10.0.0.1:4500".parse().unwrap();
        assert_eq!(format!("{}", NetworkAddress::new(addr)), "10.0.0.1:4500");
    }

    #[test]
    fn locality_lookup() {
        let loc = LocalityData::new().with_zone("z1").with_data_hall("dh1");
        assert_eq!(loc.get(locality_keys::ZONE_ID), Some("z1"));
        assert_eq!(loc.get(locality_keys::DATA_HALL), Some("dh1"));
        assert_eq!(loc.get(locality_keys::MACHINE_ID), None);
        assert_eq!(loc.get("bogus"), None);
    }

    #[test]
    fn quorum_arithmetic() {
        // 3 logs, anti-quorum 0: every push needs all 3 acks, recovery needs 2 locks.
        assert_eq!(write_quorum(3, 0), 3);
        assert_eq!(read_quorum(3, 2, 0), 2);
        assert_eq!(peek_quorum(3, 2), 2);

        // 5 logs, replication 3, anti-quorum 1.
        assert_eq!(write_quorum(5, 1), 4);
        assert_eq!(read_quorum(5, 3, 1), 4);
        assert_eq!(peek_quorum(5, 3), 3);
    }

    #[test]
    #[should_panic(expected = "anti-quorum")]
    fn write_quorum_rejects_full_anti_quorum() {
        let _ = write_quorum(3, 3);
    }
}
