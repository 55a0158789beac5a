//! Simulated remote store.
//!
//! An in-memory [`Store`] whose reachability, asynchrony and failures
//! are scripted through a [`RemoteControl`] handle. Serves as the
//! remote side in tests and in hosts that have no real backend yet.

use crate::clock::now_millis;
use offsync_store::{
    AsyncMode, Completion, CompletionOutcome, FindKey, Filter, ListModifiers, MetaPatch, Patch,
    Record, RemoteId, RemoveTarget, Reply, Schema, Store, StoreError, StoreResult, Ticket,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Per-operation call counters, for asserting batching behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// Save calls received.
    pub saves: u64,
    /// Update-all calls received.
    pub updates: u64,
    /// Remove calls received.
    pub removes: u64,
    /// Find calls received.
    pub finds: u64,
    /// List calls received.
    pub lists: u64,
}

#[derive(Debug)]
enum ParkedOp {
    Init,
    Save(Record),
    UpdateAll(Patch, Filter),
    Remove(RemoveTarget),
    Find(FindKey),
    List(Filter, ListModifiers),
}

#[derive(Default)]
struct RemoteState {
    rows: BTreeMap<RemoteId, Record>,
    schema: Option<Schema>,
    next_id: u64,
    next_ticket: u64,
    available: bool,
    defer: bool,
    closed: bool,
    fail_next: Option<StoreError>,
    parked: VecDeque<(Ticket, ParkedOp)>,
    completions: VecDeque<Completion>,
    calls: CallCounts,
}

impl RemoteState {
    fn guard(&self) -> StoreResult<()> {
        if self.closed || !self.available {
            return Err(StoreError::Unavailable);
        }
        if self.schema.is_none() {
            return Err(StoreError::NotInitialized);
        }
        Ok(())
    }

    fn next_ticket(&mut self) -> Ticket {
        self.next_ticket += 1;
        Ticket(self.next_ticket)
    }

    fn perform(&mut self, op: ParkedOp) -> CompletionOutcome {
        match op {
            ParkedOp::Init => CompletionOutcome::Initialized,
            ParkedOp::Save(record) => CompletionOutcome::Saved(self.perform_save(record)),
            ParkedOp::UpdateAll(patch, filter) => {
                CompletionOutcome::Updated(self.perform_update(&patch, &filter))
            }
            ParkedOp::Remove(target) => CompletionOutcome::Removed(self.perform_remove(&target)),
            ParkedOp::Find(key) => CompletionOutcome::Found(self.perform_find(key)),
            ParkedOp::List(filter, modifiers) => {
                CompletionOutcome::Listed(self.perform_list(&filter, &modifiers))
            }
        }
    }

    fn perform_save(&mut self, record: Record) -> Record {
        let id = match record.remote_id {
            Some(id) if self.rows.contains_key(&id) => id,
            Some(id) => {
                self.next_id = self.next_id.max(id.0 + 1);
                id
            }
            None => {
                self.next_id += 1;
                RemoteId(self.next_id)
            }
        };
        // the stored row has no local identity; the reply echoes it back
        // so the caller can match up the acknowledgement
        let mut stored = record.remote_view();
        stored.local_id = None;
        stored.remote_id = Some(id);
        stored.meta.stamp = now_millis();
        self.rows.insert(id, stored.clone());

        let mut echo = record;
        echo.remote_id = Some(id);
        echo.meta = stored.meta.clone();
        echo
    }

    fn perform_update(&mut self, patch: &Patch, filter: &Filter) -> usize {
        // replica metadata is a local-store concern
        let fields_only = patch.with_meta(MetaPatch::default());
        let stamp = now_millis();
        let mut count = 0;
        for row in self.rows.values_mut() {
            if filter.matches(row) {
                fields_only.apply(row);
                row.meta.stamp = stamp;
                count += 1;
            }
        }
        count
    }

    fn perform_remove(&mut self, target: &RemoveTarget) -> usize {
        let doomed: Vec<RemoteId> = self
            .rows
            .iter()
            .filter(|(_, row)| target.matches(row))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            self.rows.remove(id);
        }
        doomed.len()
    }

    fn perform_find(&mut self, key: FindKey) -> Option<Record> {
        match key {
            FindKey::Remote(id) => self.rows.get(&id).cloned(),
            FindKey::Local(_) => None,
        }
    }

    fn perform_list(&mut self, filter: &Filter, modifiers: &ListModifiers) -> Vec<Record> {
        let rows: Vec<Record> = self
            .rows
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        modifiers.apply(rows)
    }
}

/// The simulated remote backend.
///
/// Created together with its [`RemoteControl`]; hand this half to the
/// model and keep the control for scripting.
pub struct MockRemoteStore {
    state: Arc<Mutex<RemoteState>>,
}

impl MockRemoteStore {
    /// Creates a reachable, synchronous remote store and its control
    /// handle.
    pub fn new() -> (Self, RemoteControl) {
        let state = Arc::new(Mutex::new(RemoteState {
            available: true,
            ..RemoteState::default()
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            RemoteControl { state },
        )
    }

    fn dispatch<T>(
        &mut self,
        op: ParkedOp,
        unwrap: impl FnOnce(CompletionOutcome) -> T,
    ) -> StoreResult<Reply<T>> {
        let mut state = self.state.lock();
        state.guard()?;
        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }
        if state.defer {
            let ticket = state.next_ticket();
            state.parked.push_back((ticket, op));
            return Ok(Reply::Deferred(ticket));
        }
        let outcome = state.perform(op);
        Ok(Reply::Done(unwrap(outcome)))
    }
}

impl Store for MockRemoteStore {
    fn init(&mut self, schema: Schema) -> StoreResult<Reply<()>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::Unavailable);
        }
        state.schema = Some(schema);
        if state.defer {
            let ticket = state.next_ticket();
            state.parked.push_back((ticket, ParkedOp::Init));
            return Ok(Reply::Deferred(ticket));
        }
        Ok(Reply::Done(()))
    }

    fn async_mode(&self) -> AsyncMode {
        if self.state.lock().defer {
            AsyncMode::Always
        } else {
            AsyncMode::WithEngine
        }
    }

    fn is_available(&self) -> bool {
        let state = self.state.lock();
        state.available && !state.closed
    }

    fn set_available(&mut self, available: bool) {
        self.state.lock().available = available;
    }

    fn save(&mut self, record: Record) -> StoreResult<Reply<Record>> {
        self.state.lock().calls.saves += 1;
        self.dispatch(ParkedOp::Save(record), |outcome| match outcome {
            CompletionOutcome::Saved(saved) => saved,
            _ => unreachable!(),
        })
    }

    fn update_all(&mut self, patch: &Patch, filter: &Filter) -> StoreResult<Reply<usize>> {
        self.state.lock().calls.updates += 1;
        self.dispatch(
            ParkedOp::UpdateAll(patch.clone(), filter.clone()),
            |outcome| match outcome {
                CompletionOutcome::Updated(count) => count,
                _ => unreachable!(),
            },
        )
    }

    fn remove(&mut self, target: &RemoveTarget) -> StoreResult<Reply<usize>> {
        self.state.lock().calls.removes += 1;
        self.dispatch(ParkedOp::Remove(target.clone()), |outcome| match outcome {
            CompletionOutcome::Removed(count) => count,
            _ => unreachable!(),
        })
    }

    fn find(&mut self, key: FindKey) -> StoreResult<Reply<Option<Record>>> {
        self.state.lock().calls.finds += 1;
        self.dispatch(ParkedOp::Find(key), |outcome| match outcome {
            CompletionOutcome::Found(found) => found,
            _ => unreachable!(),
        })
    }

    fn list(
        &mut self,
        filter: &Filter,
        modifiers: &ListModifiers,
    ) -> StoreResult<Reply<Vec<Record>>> {
        self.state.lock().calls.lists += 1;
        self.dispatch(
            ParkedOp::List(filter.clone(), modifiers.clone()),
            |outcome| match outcome {
                CompletionOutcome::Listed(rows) => rows,
                _ => unreachable!(),
            },
        )
    }

    fn poll_completions(&mut self) -> Vec<Completion> {
        self.state.lock().completions.drain(..).collect()
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.rows.clear();
        state.parked.clear();
        state.completions.clear();
    }
}

/// Scripting handle for a [`MockRemoteStore`].
#[derive(Clone)]
pub struct RemoteControl {
    state: Arc<Mutex<RemoteState>>,
}

impl RemoteControl {
    /// Flips reachability from outside the model.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// When set, operations are parked and answered as deferred.
    pub fn set_defer(&self, defer: bool) {
        self.state.lock().defer = defer;
    }

    /// Makes the next operation fail synchronously with `error`.
    pub fn fail_next(&self, error: StoreError) {
        self.state.lock().fail_next = Some(error);
    }

    /// Performs the oldest parked operation and queues its completion.
    /// Returns false when nothing is parked.
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock();
        match state.parked.pop_front() {
            Some((ticket, op)) => {
                let outcome = state.perform(op);
                state.completions.push_back(Completion::new(ticket, outcome));
                true
            }
            None => false,
        }
    }

    /// Performs every parked operation in order.
    pub fn complete_all(&self) {
        while self.complete_next() {}
    }

    /// Fails the oldest parked operation with `error` instead of
    /// performing it.
    pub fn fail_next_parked(&self, error: StoreError) -> bool {
        let mut state = self.state.lock();
        match state.parked.pop_front() {
            Some((ticket, _)) => {
                state
                    .completions
                    .push_back(Completion::new(ticket, CompletionOutcome::Failed(error)));
                true
            }
            None => false,
        }
    }

    /// Number of parked operations.
    pub fn parked(&self) -> usize {
        self.state.lock().parked.len()
    }

    /// Snapshot of every stored row.
    pub fn rows(&self) -> Vec<Record> {
        self.state.lock().rows.values().cloned().collect()
    }

    /// One stored row.
    pub fn row(&self, id: RemoteId) -> Option<Record> {
        self.state.lock().rows.get(&id).cloned()
    }

    /// Inserts a row directly, assigning a remote id if absent.
    pub fn seed(&self, record: Record) -> RemoteId {
        let mut state = self.state.lock();
        state.perform_save(record).remote_id.unwrap_or(RemoteId(0))
    }

    /// Drops a stored row directly, simulating another client's remove.
    pub fn remove_row(&self, id: RemoteId) -> bool {
        self.state.lock().rows.remove(&id).is_some()
    }

    /// Overrides a stored row's last-write stamp, for staleness tests.
    pub fn set_row_stamp(&self, id: RemoteId, stamp: u64) {
        if let Some(row) = self.state.lock().rows.get_mut(&id) {
            row.meta.stamp = stamp;
        }
    }

    /// Call counters since creation.
    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_store::{Condition, FieldRef};

    fn ready() -> (MockRemoteStore, RemoteControl) {
        let (mut store, control) = MockRemoteStore::new();
        store.init(Schema::new()).unwrap();
        (store, control)
    }

    #[test]
    fn save_assigns_remote_ids() {
        let (mut store, control) = ready();
        let saved = store
            .save(Record::new().with_field("n", 1i64))
            .unwrap()
            .done()
            .unwrap();
        assert_eq!(saved.remote_id, Some(RemoteId(1)));
        assert_eq!(control.rows().len(), 1);
        assert_eq!(control.calls().saves, 1);
    }

    #[test]
    fn unreachable_store_errors() {
        let (mut store, control) = ready();
        control.set_available(false);
        assert_eq!(
            store.save(Record::new()).unwrap_err(),
            StoreError::Unavailable
        );
    }

    #[test]
    fn deferred_operations_complete_on_demand() {
        let (mut store, control) = ready();
        control.set_defer(true);

        let reply = store.save(Record::new().with_field("n", 1i64)).unwrap();
        assert!(reply.is_deferred());
        assert!(store.poll_completions().is_empty());

        assert!(control.complete_next());
        let completions = store.poll_completions();
        assert_eq!(completions.len(), 1);
        assert!(matches!(
            completions[0].outcome,
            CompletionOutcome::Saved(_)
        ));
    }

    #[test]
    fn scripted_failures() {
        let (mut store, control) = ready();
        control.fail_next(StoreError::backend("boom"));
        assert_eq!(
            store.save(Record::new()).unwrap_err(),
            StoreError::backend("boom")
        );

        control.set_defer(true);
        let Reply::Deferred(ticket) = store.save(Record::new()).unwrap() else {
            panic!("expected deferred reply");
        };
        control.fail_next_parked(StoreError::Unavailable);
        let completions = store.poll_completions();
        assert_eq!(completions[0].ticket, ticket);
        assert_eq!(
            completions[0].outcome,
            CompletionOutcome::Failed(StoreError::Unavailable)
        );
    }

    #[test]
    fn update_all_ignores_meta_patch() {
        let (mut store, control) = ready();
        let id = control.seed(Record::new().with_field("country", "USA"));

        let patch = Patch::new().set("level", 2i64).with_meta(MetaPatch {
            deleted: Some(true),
            ..MetaPatch::default()
        });
        let filter = Filter::where_one(Condition::eq(FieldRef::field("country"), "USA"));
        let count = store.update_all(&patch, &filter).unwrap().done().unwrap();
        assert_eq!(count, 1);
        let row = control.row(id).unwrap();
        assert!(!row.meta.deleted);
    }
}
