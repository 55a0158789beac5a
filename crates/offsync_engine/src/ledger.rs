//! Last-write timestamps and tombstones.

use offsync_store::{LocalId, RemoteId};
use std::collections::{HashMap, HashSet};

/// Ordering stamp for one entity's last accepted write.
///
/// A tombstone orders above every finite timestamp, so a deleted entity
/// can never be resurrected by a late remote read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stamp {
    /// Last write at this many milliseconds since the epoch.
    At(u64),
    /// The entity was removed.
    Tombstone,
}

/// Tracks the freshest accepted write per entity, plus tombstones for
/// remote rows that were removed without ever having a local mirror.
///
/// Staleness is whole-entity: a remote read whose stamp does not exceed
/// the ledger entry is discarded outright.
#[derive(Debug, Default)]
pub struct TimestampLedger {
    entries: HashMap<LocalId, Stamp>,
    remote_tombstones: HashSet<RemoteId>,
}

impl TimestampLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted write. Never moves a stamp backwards and
    /// never overwrites a tombstone.
    pub fn record(&mut self, id: LocalId, millis: u64) {
        let stamp = self.entries.entry(id).or_insert(Stamp::At(0));
        if *stamp < Stamp::At(millis) {
            *stamp = Stamp::At(millis);
        }
    }

    /// The current stamp for an entity, if any write was recorded.
    pub fn stamp(&self, id: LocalId) -> Option<Stamp> {
        self.entries.get(&id).copied()
    }

    /// Returns true if a write at `millis` is strictly fresher than the
    /// recorded stamp. Unknown entities admit everything.
    pub fn admits(&self, id: LocalId, millis: u64) -> bool {
        match self.entries.get(&id) {
            None => true,
            Some(stamp) => *stamp < Stamp::At(millis),
        }
    }

    /// Marks an entity as removed.
    pub fn tombstone(&mut self, id: LocalId) {
        self.entries.insert(id, Stamp::Tombstone);
    }

    /// Returns true if the entity was removed.
    pub fn is_tombstoned(&self, id: LocalId) -> bool {
        self.entries.get(&id) == Some(&Stamp::Tombstone)
    }

    /// Marks a remote row without a local mirror as removed.
    pub fn tombstone_remote(&mut self, id: RemoteId) {
        self.remote_tombstones.insert(id);
    }

    /// Returns true if the remote row was removed without a mirror.
    pub fn is_remote_tombstoned(&self, id: RemoteId) -> bool {
        self.remote_tombstones.contains(&id)
    }

    /// Tombstones every known entity (remove-everything path).
    pub fn tombstone_all(&mut self) {
        for stamp in self.entries.values_mut() {
            *stamp = Stamp::Tombstone;
        }
    }

    /// Drops all entries and tombstones.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.remote_tombstones.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_orders_above_any_time() {
        assert!(Stamp::At(u64::MAX) < Stamp::Tombstone);
        assert!(Stamp::At(1) < Stamp::At(2));
    }

    #[test]
    fn record_never_moves_backwards() {
        let mut ledger = TimestampLedger::new();
        ledger.record(LocalId(1), 100);
        ledger.record(LocalId(1), 50);
        assert_eq!(ledger.stamp(LocalId(1)), Some(Stamp::At(100)));
    }

    #[test]
    fn admits_strictly_newer_writes() {
        let mut ledger = TimestampLedger::new();
        assert!(ledger.admits(LocalId(1), 0));
        ledger.record(LocalId(1), 100);
        assert!(!ledger.admits(LocalId(1), 100));
        assert!(ledger.admits(LocalId(1), 101));
    }

    #[test]
    fn tombstone_is_permanent() {
        let mut ledger = TimestampLedger::new();
        ledger.tombstone(LocalId(1));
        ledger.record(LocalId(1), u64::MAX);
        assert!(ledger.is_tombstoned(LocalId(1)));
        assert!(!ledger.admits(LocalId(1), u64::MAX));
    }

    #[test]
    fn remote_tombstones_are_separate() {
        let mut ledger = TimestampLedger::new();
        ledger.tombstone_remote(RemoteId(9));
        assert!(ledger.is_remote_tombstoned(RemoteId(9)));
        assert!(!ledger.is_tombstoned(LocalId(9)));
    }
}
