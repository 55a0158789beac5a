//! Remote-to-local identity mapping.

use offsync_store::{LocalId, RemoteId};
use std::collections::HashMap;

/// Maps remote identities to the local mirrors that hold them.
///
/// An entry is written the moment a pairing is learned, whether from a
/// create acknowledgement, a remote read, or queue recovery, and is
/// never rewritten to a different local id afterwards.
#[derive(Debug, Default)]
pub struct IdentityMap {
    forward: HashMap<RemoteId, LocalId>,
}

impl IdentityMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pairing. The first pairing for a remote id wins.
    pub fn insert(&mut self, remote: RemoteId, local: LocalId) {
        self.forward.entry(remote).or_insert(local);
    }

    /// Looks up the local mirror for a remote id.
    pub fn local_for(&self, remote: RemoteId) -> Option<LocalId> {
        self.forward.get(&remote).copied()
    }

    /// Looks up the remote id paired with a local mirror.
    pub fn remote_for(&self, local: LocalId) -> Option<RemoteId> {
        self.forward
            .iter()
            .find(|(_, l)| **l == local)
            .map(|(r, _)| *r)
    }

    /// Number of known pairings.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Returns true if no pairings are known.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Drops every pairing.
    pub fn clear(&mut self) {
        self.forward.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_pairing_wins() {
        let mut map = IdentityMap::new();
        map.insert(RemoteId(10), LocalId(1));
        map.insert(RemoteId(10), LocalId(2));
        assert_eq!(map.local_for(RemoteId(10)), Some(LocalId(1)));
    }

    #[test]
    fn reverse_lookup() {
        let mut map = IdentityMap::new();
        map.insert(RemoteId(10), LocalId(1));
        map.insert(RemoteId(20), LocalId(2));
        assert_eq!(map.remote_for(LocalId(2)), Some(RemoteId(20)));
        assert_eq!(map.remote_for(LocalId(3)), None);
    }
}
