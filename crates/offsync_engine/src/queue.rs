//! Pending write queues.
//!
//! Writes issued while the remote store is unreachable (or busy) are
//! parked here and drained in arrival order. Coalescing keeps at most
//! one pending write per entity: the slot of the first write, the
//! payload of the latest.

use crate::identity::IdentityMap;
use offsync_store::{Filter, LocalId, Patch, Record, RemoteId};
use std::collections::{HashMap, VecDeque};

/// One parked create or update.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// Queue-local sequence number, used to adopt a late local id.
    pub entry_id: u64,
    /// The payload to send.
    pub record: Record,
    /// True once the write has been handed to the remote store.
    pub in_flight: bool,
    /// When the write was dispatched, if it has been.
    pub dispatched_at: Option<u64>,
}

impl PendingWrite {
    fn new(entry_id: u64, record: Record) -> Self {
        Self {
            entry_id,
            record,
            in_flight: false,
            dispatched_at: None,
        }
    }
}

/// FIFO queue of pending creates or updates.
#[derive(Debug, Default)]
pub struct WriteQueue {
    entries: VecDeque<PendingWrite>,
    next_entry: u64,
}

impl WriteQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a write at the back. Returns its entry id.
    pub fn push(&mut self, record: Record) -> u64 {
        let id = self.next_entry;
        self.next_entry += 1;
        self.entries.push_back(PendingWrite::new(id, record));
        id
    }

    /// Returns a write to the front, after a failed dispatch.
    pub fn push_front(&mut self, mut entry: PendingWrite) {
        entry.in_flight = false;
        entry.dispatched_at = None;
        self.entries.push_front(entry);
    }

    /// Takes the head of the queue for dispatch.
    pub fn pop_front(&mut self) -> Option<PendingWrite> {
        self.entries.pop_front()
    }

    /// Merges `newer` into the pending write for the same local id, if
    /// one is parked. Returns false when no slot matched.
    pub fn coalesce_by_local(&mut self, newer: &Record) -> bool {
        let Some(local) = newer.local_id else {
            return false;
        };
        for entry in &mut self.entries {
            if !entry.in_flight && entry.record.local_id == Some(local) {
                entry.record.merge_fields_from(newer);
                return true;
            }
        }
        false
    }

    /// Merges `newer` into the pending write for the same remote id, if
    /// one is parked. Returns false when no slot matched.
    pub fn coalesce_by_remote(&mut self, newer: &Record) -> bool {
        let Some(remote) = newer.remote_id else {
            return false;
        };
        for entry in &mut self.entries {
            if !entry.in_flight && entry.record.remote_id == Some(remote) {
                entry.record.merge_fields_from(newer);
                return true;
            }
        }
        false
    }

    /// Removes and returns the parked write for a remote id, so a direct
    /// write can absorb it.
    pub fn take_by_remote(&mut self, remote: RemoteId) -> Option<Record> {
        let index = self
            .entries
            .iter()
            .position(|e| !e.in_flight && e.record.remote_id == Some(remote))?;
        self.entries.remove(index).map(|e| e.record)
    }

    /// Fills in the remote identity on every parked write for `local`.
    pub fn resolve_remote(&mut self, local: LocalId, remote: RemoteId) {
        for entry in &mut self.entries {
            if entry.record.local_id == Some(local) && entry.record.remote_id.is_none() {
                entry.record.remote_id = Some(remote);
            }
        }
    }

    /// Takes the first parked write whose remote identity is known or
    /// resolvable through the identity map. Entities with a remote op
    /// already in flight (a nonzero wait count) are skipped, so at most
    /// one remote write per entity is ever open.
    pub fn pop_first_resolvable(
        &mut self,
        identities: &IdentityMap,
        waiting: &HashMap<LocalId, u32>,
    ) -> Option<PendingWrite> {
        let index = self.entries.iter().position(|e| {
            !e.in_flight
                && !e.record.local_id.is_some_and(|l| waiting.contains_key(&l))
                && (e.record.remote_id.is_some()
                    || e.record
                        .local_id
                        .is_some_and(|l| identities.remote_for(l).is_some()))
        })?;
        let mut entry = self.entries.remove(index)?;
        if entry.record.remote_id.is_none() {
            entry.record.remote_id = entry
                .record
                .local_id
                .and_then(|l| identities.remote_for(l));
        }
        Some(entry)
    }

    /// Returns true if any parked write could be dispatched now, given
    /// the known identity pairings and the entities currently waiting
    /// on an in-flight remote op.
    pub fn has_resolvable(
        &self,
        identities: &IdentityMap,
        waiting: &HashMap<LocalId, u32>,
    ) -> bool {
        self.entries.iter().any(|e| {
            !e.in_flight
                && !e.record.local_id.is_some_and(|l| waiting.contains_key(&l))
                && (e.record.remote_id.is_some()
                    || e.record
                        .local_id
                        .is_some_and(|l| identities.remote_for(l).is_some()))
        })
    }

    /// Folds a patch into every parked write matching the filter, so a
    /// later drain sends the patched state.
    pub fn apply_patch(&mut self, patch: &Patch, filter: &Filter) {
        for entry in &mut self.entries {
            if !entry.in_flight && filter.matches(&entry.record) {
                patch.apply(&mut entry.record);
            }
        }
    }

    /// Sets the local id on the entry created without one, once the
    /// local store has assigned it.
    pub fn adopt_local_id(&mut self, entry_id: u64, local: LocalId) {
        for entry in &mut self.entries {
            if entry.entry_id == entry_id {
                entry.record.local_id = Some(local);
                return;
            }
        }
    }

    /// Drops every parked write matching the filter. Returns the local
    /// ids of the dropped writes.
    pub fn purge_matching(&mut self, filter: &Filter) -> Vec<LocalId> {
        let mut dropped = Vec::new();
        self.entries.retain(|entry| {
            if filter.matches(&entry.record) {
                dropped.extend(entry.record.local_id);
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Drops every parked write addressed to a remote id.
    pub fn purge_remote(&mut self, remote: RemoteId) {
        self.entries
            .retain(|entry| entry.record.remote_id != Some(remote));
    }

    /// Number of parked writes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterates over parked writes in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingWrite> {
        self.entries.iter()
    }
}

/// One parked bulk patch.
///
/// The patch is carried by reference semantics: computed entries hold
/// the same shared callbacks the caller supplied, so replay evaluates
/// them against the remote rows as they stand at drain time.
#[derive(Debug, Clone)]
pub struct PendingPatch {
    /// The field updates to replay.
    pub patch: Patch,
    /// The rows they apply to.
    pub filter: Filter,
    /// True once handed to the remote store.
    pub in_flight: bool,
    /// When the patch was dispatched, if it has been.
    pub dispatched_at: Option<u64>,
}

impl PendingPatch {
    /// Parks a patch.
    pub fn new(patch: Patch, filter: Filter) -> Self {
        Self {
            patch,
            filter,
            in_flight: false,
            dispatched_at: None,
        }
    }
}

/// Pending removals, consolidated into a single remote call per drain
/// tick.
#[derive(Debug, Default)]
pub struct RemovalQueue {
    ids: Vec<RemoteId>,
    filters: Vec<Filter>,
    remove_all: bool,
}

impl RemovalQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a removal by remote id.
    pub fn push_id(&mut self, id: RemoteId) {
        if !self.remove_all && !self.ids.contains(&id) {
            self.ids.push(id);
        }
    }

    /// Parks a removal by filter.
    pub fn push_filter(&mut self, filter: Filter) {
        if !self.remove_all {
            self.filters.push(filter);
        }
    }

    /// Parks a remove-everything, which subsumes all other removals.
    pub fn set_remove_all(&mut self) {
        self.remove_all = true;
        self.ids.clear();
        self.filters.clear();
    }

    /// Returns true if nothing is parked.
    pub fn is_empty(&self) -> bool {
        !self.remove_all && self.ids.is_empty() && self.filters.is_empty()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.ids.clear();
        self.filters.clear();
        self.remove_all = false;
    }

    /// Collapses every parked removal into one target for a single
    /// remote call. Leaves the queue untouched; the caller clears it
    /// once the remote store accepts the batch.
    pub fn consolidate(&self) -> Option<offsync_store::RemoveTarget> {
        use offsync_store::{Condition, RemoveTarget};

        if self.remove_all {
            return Some(RemoveTarget::All);
        }
        match (self.ids.as_slice(), self.filters.as_slice()) {
            ([], []) => None,
            ([id], []) => Some(RemoveTarget::Id(*id)),
            (ids, []) => Some(RemoveTarget::Ids(ids.to_vec())),
            ([], [filter]) => Some(RemoveTarget::Matching(filter.clone())),
            (ids, filters) => {
                let mut merged = Filter { any: Vec::new() };
                for filter in filters {
                    merged.or(filter.clone());
                }
                if !ids.is_empty() {
                    merged.or(Filter::where_one(Condition::remote_id_in(
                        ids.iter().copied(),
                    )));
                }
                Some(RemoveTarget::Matching(merged))
            }
        }
    }

    /// Restores a consolidated batch after a failed dispatch.
    pub fn restore(&mut self, target: offsync_store::RemoveTarget) {
        use offsync_store::RemoveTarget;
        match target {
            RemoveTarget::All => self.set_remove_all(),
            RemoveTarget::Id(id) => self.push_id(id),
            RemoveTarget::Ids(ids) => {
                for id in ids {
                    self.push_id(id);
                }
            }
            RemoveTarget::Matching(filter) => self.push_filter(filter),
        }
    }
}
