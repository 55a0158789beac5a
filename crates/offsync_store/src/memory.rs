//! In-memory local store backend.

use crate::backend::{AsyncMode, FindKey, Store};
use crate::error::{StoreError, StoreResult};
use crate::patch::Patch;
use crate::query::{Filter, ListModifiers, RemoveTarget};
use crate::record::{LocalId, Record};
use crate::reply::{Completion, Reply};
use crate::schema::Schema;
use std::collections::BTreeMap;

/// An always-available, synchronous in-memory store.
///
/// Serves as the engine's local replica in tests and in hosts that do
/// not need durable local state. Records are keyed by [`LocalId`],
/// assigned sequentially on first save.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: BTreeMap<LocalId, Record>,
    schema: Option<Schema>,
    next_id: u64,
    closed: bool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            schema: None,
            next_id: 1,
            closed: false,
        }
    }

    /// Creates a store pre-seeded with rows, assigning local ids where
    /// absent. Useful for restart-recovery tests.
    pub fn with_rows(rows: Vec<Record>) -> Self {
        let mut store = Self::new();
        for mut record in rows {
            let id = match record.local_id {
                Some(id) => id,
                None => {
                    let id = LocalId(store.next_id);
                    record.local_id = Some(id);
                    id
                }
            };
            store.next_id = store.next_id.max(id.0 + 1);
            store.rows.insert(id, record);
        }
        store
    }

    /// Number of rows currently held, including soft-deleted mirrors.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Snapshot of all rows, for test assertions.
    pub fn rows(&self) -> Vec<Record> {
        self.rows.values().cloned().collect()
    }

    fn guard(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::Unavailable);
        }
        if self.schema.is_none() {
            return Err(StoreError::NotInitialized);
        }
        Ok(())
    }

    /// Finds the row addressed by the record's identity, preferring the
    /// local id.
    fn locate(&self, record: &Record) -> Option<LocalId> {
        if let Some(id) = record.local_id {
            if self.rows.contains_key(&id) {
                return Some(id);
            }
        }
        if let Some(remote) = record.remote_id {
            return self
                .rows
                .iter()
                .find(|(_, row)| row.remote_id == Some(remote))
                .map(|(id, _)| *id);
        }
        None
    }
}

impl Store for MemoryStore {
    fn init(&mut self, schema: Schema) -> StoreResult<Reply<()>> {
        if self.closed {
            return Err(StoreError::Unavailable);
        }
        self.schema = Some(schema);
        Ok(Reply::Done(()))
    }

    fn async_mode(&self) -> AsyncMode {
        AsyncMode::Never
    }

    fn is_available(&self) -> bool {
        !self.closed
    }

    fn set_available(&mut self, _available: bool) {
        // The local store is always reachable.
    }

    fn save(&mut self, mut record: Record) -> StoreResult<Reply<Record>> {
        self.guard()?;
        let id = match self.locate(&record) {
            Some(id) => id,
            // honor a caller-supplied local id (restart recovery), else
            // assign the next sequential one
            None => match record.local_id {
                Some(id) => {
                    self.next_id = self.next_id.max(id.0 + 1);
                    id
                }
                None => {
                    let id = LocalId(self.next_id);
                    self.next_id += 1;
                    id
                }
            },
        };
        record.local_id = Some(id);
        self.rows.insert(id, record.clone());
        Ok(Reply::Done(record))
    }

    fn update_all(&mut self, patch: &Patch, filter: &Filter) -> StoreResult<Reply<usize>> {
        self.guard()?;
        let mut count = 0;
        for row in self.rows.values_mut() {
            if filter.matches(row) {
                patch.apply(row);
                count += 1;
            }
        }
        Ok(Reply::Done(count))
    }

    fn remove(&mut self, target: &RemoveTarget) -> StoreResult<Reply<usize>> {
        self.guard()?;
        let doomed: Vec<LocalId> = self
            .rows
            .iter()
            .filter(|(_, row)| target.matches(row))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            self.rows.remove(id);
        }
        Ok(Reply::Done(doomed.len()))
    }

    fn find(&mut self, key: FindKey) -> StoreResult<Reply<Option<Record>>> {
        self.guard()?;
        let found = match key {
            FindKey::Local(id) => self.rows.get(&id).cloned(),
            FindKey::Remote(id) => self
                .rows
                .values()
                .find(|row| row.remote_id == Some(id))
                .cloned(),
        };
        Ok(Reply::Done(found))
    }

    fn list(
        &mut self,
        filter: &Filter,
        modifiers: &ListModifiers,
    ) -> StoreResult<Reply<Vec<Record>>> {
        self.guard()?;
        let rows: Vec<Record> = self
            .rows
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        Ok(Reply::Done(modifiers.apply(rows)))
    }

    fn poll_completions(&mut self) -> Vec<Completion> {
        Vec::new()
    }

    fn close(&mut self) {
        self.closed = true;
        self.rows.clear();
        self.schema = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Condition, FieldRef};
    use crate::record::RemoteId;
    use crate::value::Value;

    fn ready_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.init(Schema::new()).unwrap();
        store
    }

    #[test]
    fn operations_require_init() {
        let mut store = MemoryStore::new();
        assert_eq!(
            store.save(Record::new()).unwrap_err(),
            StoreError::NotInitialized
        );
    }

    #[test]
    fn save_assigns_sequential_local_ids() {
        let mut store = ready_store();
        let a = store
            .save(Record::new().with_field("n", 1i64))
            .unwrap()
            .done()
            .unwrap();
        let b = store
            .save(Record::new().with_field("n", 2i64))
            .unwrap()
            .done()
            .unwrap();
        assert_eq!(a.local_id, Some(LocalId(1)));
        assert_eq!(b.local_id, Some(LocalId(2)));
    }

    #[test]
    fn save_replaces_by_local_id() {
        let mut store = ready_store();
        let saved = store
            .save(Record::new().with_field("n", 1i64))
            .unwrap()
            .done()
            .unwrap();

        let mut updated = Record::new().with_field("n", 10i64);
        updated.local_id = saved.local_id;
        store.save(updated).unwrap();

        assert_eq!(store.len(), 1);
        let row = store
            .find(FindKey::Local(saved.local_id.unwrap()))
            .unwrap()
            .done()
            .unwrap()
            .unwrap();
        assert_eq!(row.field("n"), Some(&Value::Int(10)));
    }

    #[test]
    fn save_matches_existing_row_by_remote_id() {
        let mut store = ready_store();
        let mut mirror = Record::new().with_field("n", 1i64);
        mirror.remote_id = Some(RemoteId(40));
        let saved = store.save(mirror).unwrap().done().unwrap();

        // same remote id, no local id: must update, not insert
        let mut echo = Record::new().with_field("n", 2i64);
        echo.remote_id = Some(RemoteId(40));
        let updated = store.save(echo).unwrap().done().unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(updated.local_id, saved.local_id);
    }

    #[test]
    fn update_all_counts_matches() {
        let mut store = ready_store();
        for country in ["USA", "USA", "FR"] {
            store
                .save(Record::new().with_field("country", country))
                .unwrap();
        }
        let patch = Patch::new().set("level", 1i64);
        let filter = Filter::where_one(Condition::eq(FieldRef::field("country"), "USA"));
        let count = store.update_all(&patch, &filter).unwrap().done().unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn remove_by_target() {
        let mut store = ready_store();
        let mut a = Record::new().with_field("n", 1i64);
        a.remote_id = Some(RemoteId(7));
        store.save(a).unwrap();
        store.save(Record::new().with_field("n", 2i64)).unwrap();

        let removed = store
            .remove(&RemoveTarget::Id(RemoteId(7)))
            .unwrap()
            .done()
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);

        let removed = store.remove(&RemoveTarget::All).unwrap().done().unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn list_filters_and_orders() {
        let mut store = ready_store();
        for (country, level) in [("USA", 3i64), ("USA", 1), ("FR", 2)] {
            store
                .save(
                    Record::new()
                        .with_field("country", country)
                        .with_field("level", level),
                )
                .unwrap();
        }
        let filter = Filter::where_one(Condition::eq(FieldRef::field("country"), "USA"));
        let modifiers = ListModifiers {
            order: Some((FieldRef::field("level"), crate::query::SortOrder::Desc)),
            ..ListModifiers::default()
        };
        let rows = store.list(&filter, &modifiers).unwrap().done().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].field("level"), Some(&Value::Int(3)));
    }

    #[test]
    fn with_rows_preserves_ids() {
        let mut seeded = Record::new().with_field("n", 1i64);
        seeded.local_id = Some(LocalId(9));
        let mut store = MemoryStore::with_rows(vec![seeded, Record::new().with_field("n", 2i64)]);
        store.init(Schema::new()).unwrap();

        assert!(store
            .find(FindKey::Local(LocalId(9)))
            .unwrap()
            .done()
            .unwrap()
            .is_some());
        // fresh ids continue past the seeded maximum
        let next = store.save(Record::new()).unwrap().done().unwrap();
        assert!(next.local_id.unwrap().0 > 9);
    }

    #[test]
    fn close_rejects_further_use() {
        let mut store = ready_store();
        store.close();
        assert!(!store.is_available());
        assert_eq!(store.save(Record::new()).unwrap_err(), StoreError::Unavailable);
    }
}
