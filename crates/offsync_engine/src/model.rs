//! The reconciliation core.
//!
//! A [`Model`] owns two [`Store`] instances: an always-available local
//! replica and an intermittently reachable remote authority. Reads are
//! served from whichever side can answer them best; writes issued while
//! the remote is unreachable are parked in pending queues and drained
//! in order once connectivity returns.
//!
//! The model is single-threaded and cooperative. Backends that complete
//! work asynchronously answer [`Reply::Deferred`]; the host calls
//! [`Model::pump`] (or [`Model::run_until_idle`]) to consume their
//! completions and to execute due drain ticks. Results that arrive this
//! way are surfaced through [`Model::poll_events`].
//!
//! Local store writes may be deferred, but local reads are expected to
//! complete synchronously.

use crate::clock::now_millis;
use crate::config::ModelConfig;
use crate::error::{EngineError, EngineResult};
use crate::identity::IdentityMap;
use crate::ledger::TimestampLedger;
use crate::queue::{PendingPatch, PendingWrite, RemovalQueue, WriteQueue};
use crate::scheduler::{DrainStats, Scheduler};
use offsync_store::{
    Completion, CompletionOutcome, Condition, FieldRef, FieldUpdate, Filter, FindKey,
    ListModifiers, LocalId, MetaPatch, Patch, Predicate, Record, RemoteId, RemoveTarget, Reply,
    Store, Ticket,
};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// How an engine operation concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The operation finished; here is its result.
    Done(T),
    /// A store deferred part of the work; the result will arrive as an
    /// [`Event`] once the host pumps the model.
    Pending,
    /// A host hook vetoed the operation.
    Aborted,
}

impl<T> Outcome<T> {
    /// Returns the result, if the operation finished.
    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            Outcome::Pending | Outcome::Aborted => None,
        }
    }

    /// Returns true if the result is still pending.
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    /// Returns true if a hook vetoed the operation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Outcome::Aborted)
    }
}

/// A result that arrived after its operation returned
/// [`Outcome::Pending`], or that was produced by the drain loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A save settled; carries the record with its known identities.
    Saved(Record),
    /// A bulk update settled; carries the affected row count.
    Updated(usize),
    /// A remove settled; carries the removed row count.
    Removed(usize),
    /// A find settled.
    Found(Option<Record>),
    /// A list settled.
    Listed(Vec<Record>),
    /// A deferred operation failed.
    Failed(EngineError),
}

/// Which store a ticket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Side {
    Local,
    Remote,
}

/// Engine-side context for one deferred store operation.
enum InFlight {
    Init,
    RecoveryList,
    LocalSave { stamp: u64, adopt: Option<u64> },
    LocalOp,
    RemoteSave { entry: PendingWrite, queued: bool },
    QueuedPatch { entry: PendingPatch },
    QueuedRemove { target: RemoveTarget },
    DirectPatch { patch: Patch, filter: Filter, stamp: u64 },
    DirectRemove { target: RemoveTarget },
    RemoteFind { remote: RemoteId, mirror: Option<Record>, dispatched_at: u64 },
    RemoteList { filter: Filter, dispatched_at: u64 },
}

/// An offline-first model over a local and a remote store.
pub struct Model {
    config: ModelConfig,
    local: Box<dyn Store>,
    remote: Box<dyn Store>,
    identities: IdentityMap,
    ledger: TimestampLedger,
    creates: WriteQueue,
    updates: WriteQueue,
    patches: VecDeque<PendingPatch>,
    removals: RemovalQueue,
    scheduler: Scheduler,
    waits: HashMap<LocalId, u32>,
    inflight: HashMap<(Side, Ticket), InFlight>,
    events: VecDeque<Event>,
    online: bool,
    enabled: bool,
    pending_inits: u8,
    init_failed: bool,
    last_stamp: u64,
}

impl Model {
    /// Creates a model over the given stores. Call [`Model::init`]
    /// before issuing operations.
    pub fn new(config: ModelConfig, local: Box<dyn Store>, remote: Box<dyn Store>) -> Self {
        let online = config.start_online;
        Self {
            config,
            local,
            remote,
            identities: IdentityMap::new(),
            ledger: TimestampLedger::new(),
            creates: WriteQueue::new(),
            updates: WriteQueue::new(),
            patches: VecDeque::new(),
            removals: RemovalQueue::new(),
            scheduler: Scheduler::new(),
            waits: HashMap::new(),
            inflight: HashMap::new(),
            events: VecDeque::new(),
            online,
            enabled: false,
            pending_inits: 0,
            init_failed: false,
            last_stamp: 0,
        }
    }

    /// Pushes the schema into both stores and rebuilds the pending
    /// queues from dirty and soft-deleted local mirrors.
    ///
    /// With fully synchronous stores the model is ready when this
    /// returns; otherwise readiness follows the deferred inits and is
    /// observable through [`Model::is_ready`].
    pub fn init(&mut self) -> EngineResult<()> {
        let remote_async = self.remote.async_mode().effective(self.config.engine_async);
        debug!(
            model = %self.config.name,
            online = self.online,
            remote_async,
            "initializing"
        );
        self.remote.set_available(self.online);
        self.pending_inits = 0;
        self.init_failed = false;

        match self.local.init(self.config.schema.clone())? {
            Reply::Done(()) => {}
            Reply::Deferred(ticket) => {
                self.pending_inits += 1;
                self.inflight.insert((Side::Local, ticket), InFlight::Init);
            }
        }
        match self.remote.init(self.config.schema.clone())? {
            Reply::Done(()) => {}
            Reply::Deferred(ticket) => {
                self.pending_inits += 1;
                self.inflight.insert((Side::Remote, ticket), InFlight::Init);
            }
        }

        if self.pending_inits == 0 {
            self.recover_queues()?;
        }
        Ok(())
    }

    /// Returns true once init has finished, including queue recovery.
    pub fn is_ready(&self) -> bool {
        self.enabled
    }

    /// Returns true if the remote store is considered reachable.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Signals a connectivity change.
    ///
    /// Going online arms the drain scheduler when writes are parked;
    /// going offline cancels any pending drain.
    pub fn set_online(&mut self, online: bool) {
        if self.online == online {
            return;
        }
        self.online = online;
        self.remote.set_available(online);
        if online {
            info!(model = %self.config.name, "remote store reachable");
            if self.has_dispatchable() {
                self.scheduler.arm();
            }
        } else {
            info!(model = %self.config.name, "remote store unreachable");
            self.scheduler.disarm();
        }
    }

    /// A record pre-filled with every schema default.
    pub fn defaults(&self) -> Record {
        self.config.schema.defaults()
    }

    /// Number of parked creates.
    pub fn pending_creates(&self) -> usize {
        self.creates.len()
    }

    /// Number of parked updates.
    pub fn pending_updates(&self) -> usize {
        self.updates.len()
    }

    /// Number of parked bulk patches.
    pub fn pending_patches(&self) -> usize {
        self.patches.len()
    }

    /// Returns true if any write is parked for the remote store.
    pub fn has_pending(&self) -> bool {
        !self.creates.is_empty()
            || !self.updates.is_empty()
            || !self.patches.is_empty()
            || !self.removals.is_empty()
    }

    /// Drain counters accumulated so far.
    pub fn stats(&self) -> DrainStats {
        self.scheduler.stats()
    }

    /// Drains results that settled after their operation returned
    /// [`Outcome::Pending`].
    pub fn poll_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Consumes store completions and executes a due drain tick.
    /// Returns the number of completions handled.
    pub fn pump(&mut self) -> EngineResult<usize> {
        let mut handled = 0;
        let completions: Vec<Completion> = self.local.poll_completions();
        for completion in completions {
            self.handle_completion(Side::Local, completion)?;
            handled += 1;
        }
        let completions: Vec<Completion> = self.remote.poll_completions();
        for completion in completions {
            self.handle_completion(Side::Remote, completion)?;
            handled += 1;
        }
        if self.scheduler.is_armed() {
            self.drain_tick()?;
        }
        Ok(handled)
    }

    /// Pumps until no completion is waiting and no drain tick is due.
    ///
    /// Operations deferred by a store that has not delivered their
    /// completions yet remain in flight; the host pumps again once the
    /// backend makes progress.
    pub fn run_until_idle(&mut self) -> EngineResult<()> {
        loop {
            let handled = self.pump()?;
            if handled == 0 && !self.scheduler.is_armed() {
                return Ok(());
            }
        }
    }

    /// Saves a record.
    ///
    /// A record without identity is a create; one whose identity is
    /// known (directly or through the identity map) replaces its remote
    /// row. While the remote store is unreachable the write lands in
    /// the local mirror and is parked for a later drain.
    pub fn save(&mut self, record: Record) -> EngineResult<Outcome<Record>> {
        self.ensure_ready()?;
        if record.is_empty() {
            return Err(EngineError::EmptyPayload);
        }

        let mut record = record;
        // pair up the identities before any decision is made on them
        if record.local_id.is_none() {
            if let Some(remote) = record.remote_id {
                record.local_id = self.identities.local_for(remote);
            }
        } else if record.remote_id.is_none() {
            record.remote_id = record.local_id.and_then(|l| self.identities.remote_for(l));
        }

        if let Some(hook) = self.config.before_save.clone() {
            if !hook(&record) {
                debug!(model = %self.config.name, "save vetoed by hook");
                return Ok(Outcome::Aborted);
            }
        }

        // creates are validated in full, replacements field by field
        let creating = record.remote_id.is_none();
        self.config
            .schema
            .validate(&mut record, creating)
            .map_err(EngineError::from_violation)?;

        if record.local_id.is_some_and(|l| self.ledger.is_tombstoned(l))
            || record
                .remote_id
                .is_some_and(|r| self.ledger.is_remote_tombstoned(r))
        {
            return Err(EngineError::RemovedData);
        }

        let now = self.next_stamp();
        let waiting = record.local_id.is_some_and(|l| self.wait_count(l) > 0);
        if self.online && !waiting && (record.remote_id.is_some() || self.creates.is_empty()) {
            self.save_direct(record, now)
        } else {
            self.save_queued(record, now)
        }
    }

    /// Applies a patch to every record matching the filter, on both
    /// sides. Answers the affected row count: the remote count when
    /// online, the local mirror count when the patch had to be parked.
    pub fn update_all(&mut self, patch: &Patch, filter: &Filter) -> EngineResult<Outcome<usize>> {
        self.ensure_ready()?;
        if patch.is_empty() {
            return Err(EngineError::EmptyPayload);
        }
        for (name, update) in &patch.fields {
            if let FieldUpdate::Set(value) = update {
                self.config
                    .schema
                    .validate_field(name, value)
                    .map_err(EngineError::from_violation)?;
            }
        }

        let now = self.next_stamp();
        // parked payloads absorb the patch so a later drain sends the
        // folded state
        let fields_only = patch.with_meta(MetaPatch::default());
        self.creates.apply_patch(&fields_only, filter);
        self.updates.apply_patch(&fields_only, filter);

        if self.online {
            match self.remote.update_all(patch, filter) {
                Ok(Reply::Done(count)) => self
                    .finish_direct_patch(patch, filter, count, now)
                    .map(Outcome::Done),
                Ok(Reply::Deferred(ticket)) => {
                    self.inflight.insert(
                        (Side::Remote, ticket),
                        InFlight::DirectPatch {
                            patch: patch.clone(),
                            filter: filter.clone(),
                            stamp: now,
                        },
                    );
                    Ok(Outcome::Pending)
                }
                Err(error) => {
                    warn!(model = %self.config.name, %error, "direct update failed; queuing patch");
                    self.queue_patch(patch, filter, now)
                }
            }
        } else {
            self.queue_patch(patch, filter, now)
        }
    }

    /// Removes the targeted records on both sides.
    ///
    /// While the remote store is unreachable, mirrors that have a
    /// remote row are soft-deleted and the removal is parked; mirrors
    /// that never reached the remote are dropped outright.
    pub fn remove(&mut self, target: RemoveTarget) -> EngineResult<Outcome<usize>> {
        self.ensure_ready()?;
        if let Some(hook) = self.config.before_remove.clone() {
            if !hook(&target) {
                debug!(model = %self.config.name, "remove vetoed by hook");
                return Ok(Outcome::Aborted);
            }
        }

        // id batches collapse into a filter so every path handles one shape
        let target = match target {
            RemoveTarget::Ids(ids) => {
                RemoveTarget::Matching(Filter::where_one(Condition::remote_id_in(ids)))
            }
            other => other,
        };

        if let RemoveTarget::Id(remote) = target {
            let local = self.identities.local_for(remote);
            if self.ledger.is_remote_tombstoned(remote)
                || local.is_some_and(|l| self.ledger.is_tombstoned(l))
            {
                return Err(EngineError::RemovedData);
            }
        }

        let now = self.next_stamp();
        if self.online {
            match self.remote.remove(&target) {
                Ok(Reply::Done(count)) => {
                    let count = self.finish_direct_remove(&target, count)?;
                    Ok(Outcome::Done(count))
                }
                Ok(Reply::Deferred(ticket)) => {
                    if let RemoveTarget::Id(remote) = &target {
                        if let Some(local) = self.identities.local_for(*remote) {
                            self.begin_wait(local);
                        }
                    }
                    self.inflight
                        .insert((Side::Remote, ticket), InFlight::DirectRemove { target });
                    Ok(Outcome::Pending)
                }
                Err(error) => {
                    warn!(model = %self.config.name, %error, "direct remove failed; queuing");
                    self.remove_offline(target, now)
                }
            }
        } else {
            self.remove_offline(target, now)
        }
    }

    /// Looks up a record by remote identity.
    ///
    /// Served from the local mirror when offline, when the mirror is
    /// dirty, or when it is fresher than the configured window; the
    /// remote store is consulted otherwise. A remote response that is
    /// not strictly newer than the ledger stamp is discarded.
    pub fn find(&mut self, remote: RemoteId) -> EngineResult<Outcome<Option<Record>>> {
        self.ensure_ready()?;
        if self.ledger.is_remote_tombstoned(remote) {
            return Ok(Outcome::Done(None));
        }
        let local = self.identities.local_for(remote);
        if local.is_some_and(|l| self.ledger.is_tombstoned(l)) {
            return Ok(Outcome::Done(None));
        }

        if self.online && self.has_pending() {
            // reads want a settled remote; push parked writes first
            self.flush_pending()?;
        }

        let mirror = match local {
            Some(l) => self.local_find_sync(FindKey::Local(l))?,
            None => self.local_find_sync(FindKey::Remote(remote))?,
        };
        if let Some(row) = &mirror {
            if let Some(l) = row.local_id {
                self.identities.insert(remote, l);
            }
            if row.meta.deleted {
                return Ok(Outcome::Done(None));
            }
        }

        let now = now_millis();
        let fresh = mirror.as_ref().is_some_and(|row| {
            row.meta.dirty
                || self
                    .config
                    .timeout
                    .is_some_and(|window| now.saturating_sub(row.meta.stamp) <= window)
        });
        if !self.online || fresh {
            return Ok(Outcome::Done(mirror.map(|r| r.remote_view())));
        }

        match self.remote.find(FindKey::Remote(remote)) {
            Ok(Reply::Done(found)) => self
                .finish_remote_find(remote, found, mirror, now)
                .map(Outcome::Done),
            Ok(Reply::Deferred(ticket)) => {
                self.inflight.insert(
                    (Side::Remote, ticket),
                    InFlight::RemoteFind {
                        remote,
                        mirror,
                        dispatched_at: now,
                    },
                );
                Ok(Outcome::Pending)
            }
            Err(error) => {
                warn!(model = %self.config.name, %error, "remote find failed; serving mirror");
                Ok(Outcome::Done(mirror.map(|r| r.remote_view())))
            }
        }
    }

    /// Looks up a record by local identity, never consulting the
    /// remote store.
    pub fn find_by_local(&mut self, local: LocalId) -> EngineResult<Outcome<Option<Record>>> {
        self.ensure_ready()?;
        if self.ledger.is_tombstoned(local) {
            return Ok(Outcome::Done(None));
        }
        let row = self.local_find_sync(FindKey::Local(local))?;
        match row {
            Some(row) if !row.meta.deleted => Ok(Outcome::Done(Some(row.remote_view()))),
            _ => Ok(Outcome::Done(None)),
        }
    }

    /// Lists records matching the filter.
    ///
    /// When online the remote page is authoritative and is reconciled
    /// into the local mirror, subject to the same staleness rule as
    /// finds; offline the local mirror answers, excluding soft-deleted
    /// rows.
    pub fn list(
        &mut self,
        filter: &Filter,
        modifiers: &ListModifiers,
    ) -> EngineResult<Outcome<Vec<Record>>> {
        self.ensure_ready()?;
        if !self.online {
            return self.list_local(filter, modifiers).map(Outcome::Done);
        }
        if self.has_pending() {
            self.flush_pending()?;
        }

        let now = now_millis();
        match self.remote.list(filter, modifiers) {
            Ok(Reply::Done(rows)) => self
                .finish_remote_list(filter, rows, now)
                .map(Outcome::Done),
            Ok(Reply::Deferred(ticket)) => {
                self.inflight.insert(
                    (Side::Remote, ticket),
                    InFlight::RemoteList {
                        filter: filter.clone(),
                        dispatched_at: now,
                    },
                );
                Ok(Outcome::Pending)
            }
            Err(error) => {
                warn!(model = %self.config.name, %error, "remote list failed; serving mirror");
                self.list_local(filter, modifiers).map(Outcome::Done)
            }
        }
    }

    /// Releases both stores. Further operations fail with
    /// [`EngineError::NotReady`].
    pub fn close(&mut self) {
        debug!(model = %self.config.name, "closing");
        self.enabled = false;
        self.scheduler.disarm();
        self.inflight.clear();
        self.waits.clear();
        self.events.clear();
        self.creates.clear();
        self.updates.clear();
        self.patches.clear();
        self.removals.clear();
        self.local.close();
        self.remote.close();
    }

    // ---- save internals ----

    fn save_direct(&mut self, record: Record, now: u64) -> EngineResult<Outcome<Record>> {
        // absorb any parked update for the same entity: its slot is
        // gone, its payload folds into this write
        let mut payload = record;
        if let Some(remote) = payload.remote_id {
            if let Some(mut parked) = self.updates.take_by_remote(remote) {
                parked.merge_fields_from(&payload);
                payload = parked;
            }
        }

        let entry = PendingWrite {
            entry_id: u64::MAX,
            record: payload.clone(),
            in_flight: true,
            dispatched_at: Some(now),
        };
        match self.remote.save(payload.remote_view()) {
            Ok(Reply::Done(saved)) => self.acknowledge_remote_save(entry, saved, now),
            Ok(Reply::Deferred(ticket)) => {
                if let Some(local) = payload.local_id {
                    self.begin_wait(local);
                }
                self.inflight.insert(
                    (Side::Remote, ticket),
                    InFlight::RemoteSave {
                        entry,
                        queued: false,
                    },
                );
                Ok(Outcome::Pending)
            }
            Err(error) => {
                warn!(model = %self.config.name, %error, "direct save failed; queuing");
                self.save_queued(payload, now)
            }
        }
    }

    fn save_queued(&mut self, record: Record, now: u64) -> EngineResult<Outcome<Record>> {
        let adopt = self.enqueue_write(&record);
        if self.online {
            self.scheduler.arm();
        }

        let mut mirror = record;
        mirror.meta.dirty = true;
        mirror.meta.deleted = false;
        mirror.meta.stamp = now;

        match self.local.save(mirror)? {
            Reply::Done(saved) => {
                if let Some(local) = saved.local_id {
                    self.ledger.record(local, now);
                    if let Some(remote) = saved.remote_id {
                        self.identities.insert(remote, local);
                    }
                    if let Some(entry_id) = adopt {
                        self.creates.adopt_local_id(entry_id, local);
                    }
                }
                Ok(Outcome::Done(saved))
            }
            Reply::Deferred(ticket) => {
                self.inflight.insert(
                    (Side::Local, ticket),
                    InFlight::LocalSave { stamp: now, adopt },
                );
                Ok(Outcome::Pending)
            }
        }
    }

    /// Parks a write in the right queue. Returns the create-queue entry
    /// id when a brand-new record still needs its local identity.
    fn enqueue_write(&mut self, record: &Record) -> Option<u64> {
        let waiting = record.local_id.is_some_and(|l| self.wait_count(l) > 0);
        if record.remote_id.is_some() || waiting {
            if !self.updates.coalesce_by_remote(record) && !self.updates.coalesce_by_local(record) {
                self.updates.push(record.clone());
            }
            None
        } else if self.creates.coalesce_by_local(record) {
            None
        } else {
            Some(self.creates.push(record.clone()))
        }
    }

    fn acknowledge_remote_save(
        &mut self,
        entry: PendingWrite,
        saved: Record,
        dispatched: u64,
    ) -> EngineResult<Outcome<Record>> {
        let local = entry.record.local_id.or(saved.local_id);
        let mut mirror = saved.local_mirror(dispatched);
        mirror.local_id = local;
        if let (Some(remote), Some(local)) = (mirror.remote_id, local) {
            self.identities.insert(remote, local);
            // parked updates for this entity can now be addressed
            self.updates.resolve_remote(local, remote);
        }
        self.save_local(mirror, dispatched)
    }

    /// Writes a mirror, honoring tombstones and the staleness rule.
    fn save_local(&mut self, mut mirror: Record, stamp: u64) -> EngineResult<Outcome<Record>> {
        if let Some(local) = mirror.local_id {
            if self.ledger.is_tombstoned(local) {
                return Err(EngineError::RemovedData);
            }
            if !self.ledger.admits(local, stamp) {
                debug!(model = %self.config.name, %local, "stale write discarded");
                return Ok(Outcome::Done(mirror));
            }
        }
        mirror.meta.stamp = stamp;
        match self.local.save(mirror)? {
            Reply::Done(saved) => {
                if let Some(local) = saved.local_id {
                    self.ledger.record(local, stamp);
                    if let Some(remote) = saved.remote_id {
                        self.identities.insert(remote, local);
                    }
                }
                Ok(Outcome::Done(saved))
            }
            Reply::Deferred(ticket) => {
                self.inflight.insert(
                    (Side::Local, ticket),
                    InFlight::LocalSave { stamp, adopt: None },
                );
                Ok(Outcome::Pending)
            }
        }
    }

    // ---- update-all internals ----

    fn queue_patch(&mut self, patch: &Patch, filter: &Filter, now: u64) -> EngineResult<Outcome<usize>> {
        self.patches
            .push_back(PendingPatch::new(patch.clone(), filter.clone()));
        if self.online {
            self.scheduler.arm();
        }
        let local = patch.with_meta(MetaPatch {
            dirty: Some(true),
            deleted: None,
            stamp: Some(now),
        });
        let count = self.local_update(&local, filter)?;
        debug!(model = %self.config.name, count, "bulk patch parked");
        Ok(Outcome::Done(count))
    }

    fn finish_direct_patch(
        &mut self,
        patch: &Patch,
        filter: &Filter,
        count: usize,
        now: u64,
    ) -> EngineResult<usize> {
        if count == 0 {
            // the remote knows none of these rows; clean mirrors that
            // would shadow that are dropped
            let stale = filter.and_each(Condition::eq(FieldRef::Dirty, false));
            self.local_remove(&RemoveTarget::Matching(stale))?;
        }
        let local = patch.with_meta(MetaPatch {
            dirty: None,
            deleted: None,
            stamp: Some(now),
        });
        self.local_update(&local, filter)?;
        Ok(count)
    }

    // ---- remove internals ----

    fn finish_direct_remove(
        &mut self,
        target: &RemoveTarget,
        remote_count: usize,
    ) -> EngineResult<usize> {
        match target {
            RemoveTarget::All => {
                self.creates.clear();
                self.updates.clear();
                self.patches.clear();
                self.removals.clear();
                self.local_remove(&RemoveTarget::All)?;
                self.ledger.tombstone_all();
                self.identities.clear();
                self.waits.clear();
            }
            RemoveTarget::Id(remote) => {
                self.updates.purge_remote(*remote);
                self.ledger.tombstone_remote(*remote);
                if let Some(local) = self.identities.local_for(*remote) {
                    self.ledger.tombstone(local);
                    self.waits.remove(&local);
                }
                self.local_remove(&RemoveTarget::Id(*remote))?;
            }
            RemoveTarget::Ids(ids) => {
                let filter = Filter::where_one(Condition::remote_id_in(ids.iter().copied()));
                self.finish_matching_remove(&filter)?;
            }
            RemoveTarget::Matching(filter) => {
                self.finish_matching_remove(filter)?;
            }
        }
        Ok(remote_count)
    }

    fn finish_matching_remove(&mut self, filter: &Filter) -> EngineResult<()> {
        self.creates.purge_matching(filter);
        self.updates.purge_matching(filter);
        let rows = self.local_list_sync(filter)?;
        for row in &rows {
            if let Some(local) = row.local_id {
                self.ledger.tombstone(local);
                self.waits.remove(&local);
            }
            if let Some(remote) = row.remote_id {
                self.ledger.tombstone_remote(remote);
            }
        }
        self.local_remove(&RemoveTarget::Matching(filter.clone()))?;
        Ok(())
    }

    fn remove_offline(&mut self, target: RemoveTarget, now: u64) -> EngineResult<Outcome<usize>> {
        let count = match target {
            RemoveTarget::All => {
                self.creates.clear();
                self.updates.clear();
                self.patches.clear();
                self.removals.set_remove_all();
                let rows = self.local_list_sync(&Filter::all())?;
                self.soft_delete_rows(rows, now)?
            }
            RemoveTarget::Id(remote) => {
                self.updates.purge_remote(remote);
                self.removals.push_id(remote);
                let rows = self.local_list_sync(&Filter::where_one(Condition::remote_id_in([
                    remote,
                ])))?;
                if rows.is_empty() {
                    // no mirror; the tombstone still has to be remembered
                    self.ledger.tombstone_remote(remote);
                    1
                } else {
                    self.soft_delete_rows(rows, now)?
                }
            }
            RemoveTarget::Matching(filter) => {
                self.creates.purge_matching(&filter);
                self.updates.purge_matching(&filter);
                self.removals.push_filter(filter.clone());
                let rows = self.local_list_sync(&filter)?;
                self.soft_delete_rows(rows, now)?
            }
            RemoveTarget::Ids(ids) => {
                return self.remove_offline(
                    RemoveTarget::Matching(Filter::where_one(Condition::remote_id_in(ids))),
                    now,
                )
            }
        };
        if self.online {
            self.scheduler.arm();
        }
        Ok(Outcome::Done(count))
    }

    /// Soft-deletes mirrors that have a remote row, drops the rest.
    fn soft_delete_rows(&mut self, rows: Vec<Record>, now: u64) -> EngineResult<usize> {
        let mut count = 0;
        for mut row in rows {
            if row.meta.deleted {
                continue;
            }
            count += 1;
            let Some(local) = row.local_id else { continue };
            self.ledger.tombstone(local);
            self.waits.remove(&local);
            match row.remote_id {
                None => {
                    // never reached the remote store: no trace to keep
                    let by_id =
                        Filter::where_one(Condition::eq(FieldRef::LocalId, local.0 as i64));
                    self.local_remove(&RemoveTarget::Matching(by_id))?;
                }
                Some(remote) => {
                    self.ledger.tombstone_remote(remote);
                    row.meta.deleted = true;
                    row.meta.dirty = true;
                    row.meta.stamp = now;
                    match self.local.save(row)? {
                        Reply::Done(_) => {}
                        Reply::Deferred(ticket) => {
                            self.inflight.insert((Side::Local, ticket), InFlight::LocalOp);
                        }
                    }
                }
            }
        }
        Ok(count)
    }

    // ---- read internals ----

    fn finish_remote_find(
        &mut self,
        remote: RemoteId,
        found: Option<Record>,
        mirror: Option<Record>,
        dispatched: u64,
    ) -> EngineResult<Option<Record>> {
        match found {
            Some(row) => {
                let stamp = if row.meta.stamp > 0 {
                    row.meta.stamp
                } else {
                    dispatched
                };
                if let Some(local_row) = &mirror {
                    if let Some(local) = local_row.local_id {
                        if !self.ledger.admits(local, stamp) {
                            debug!(
                                model = %self.config.name,
                                %remote,
                                "stale remote read discarded"
                            );
                            return Ok(Some(local_row.remote_view()));
                        }
                    }
                }
                let mut merged = mirror.unwrap_or_default();
                merged.merge_fields_from(&row);
                merged.remote_id = Some(remote);
                merged.meta.dirty = false;
                merged.meta.deleted = false;
                let view = merged.remote_view();
                match self.save_local(merged, stamp)? {
                    Outcome::Done(saved) => Ok(Some(saved.remote_view())),
                    _ => Ok(Some(view)),
                }
            }
            None => {
                if mirror.is_some() {
                    // the remote store no longer has it; the mirror goes too
                    self.local_remove(&RemoveTarget::Id(remote))?;
                }
                Ok(None)
            }
        }
    }

    fn finish_remote_list(
        &mut self,
        filter: &Filter,
        rows: Vec<Record>,
        dispatched: u64,
    ) -> EngineResult<Vec<Record>> {
        if rows.is_empty() {
            // clean mirrors the remote no longer returns are dropped
            let stale = filter.and_each(Condition::eq(FieldRef::Dirty, false));
            self.local_remove(&RemoveTarget::Matching(stale))?;
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(remote) = row.remote_id else {
                out.push(row);
                continue;
            };
            if self.ledger.is_remote_tombstoned(remote) {
                continue;
            }
            let stamp = if row.meta.stamp > 0 {
                row.meta.stamp
            } else {
                dispatched
            };
            let mut mirror = row.local_mirror(stamp);
            if let Some(local) = self.identities.local_for(remote) {
                if self.ledger.is_tombstoned(local) {
                    continue;
                }
                mirror.local_id = Some(local);
                if !self.ledger.admits(local, stamp) {
                    // the local copy is fresher; it represents the row
                    if let Some(local_row) = self.local_find_sync(FindKey::Local(local))? {
                        out.push(local_row.remote_view());
                    }
                    continue;
                }
            }
            let view = mirror.remote_view();
            match self.save_local(mirror, stamp)? {
                Outcome::Done(saved) => out.push(saved.remote_view()),
                _ => out.push(view),
            }
        }
        Ok(out)
    }

    fn list_local(
        &mut self,
        filter: &Filter,
        modifiers: &ListModifiers,
    ) -> EngineResult<Vec<Record>> {
        let visible = filter.and_each(Condition::eq(FieldRef::Deleted, false));
        match self.local.list(&visible, modifiers)? {
            Reply::Done(rows) => Ok(rows.into_iter().map(|r| r.remote_view()).collect()),
            Reply::Deferred(ticket) => {
                self.inflight.insert((Side::Local, ticket), InFlight::LocalOp);
                Ok(Vec::new())
            }
        }
    }

    // ---- drain loop ----

    /// Executes one drain tick if one is due. Returns true when more
    /// work remains scheduled.
    fn drain_tick(&mut self) -> EngineResult<bool> {
        if !self.scheduler.begin_tick() {
            return Ok(false);
        }
        if !self.online {
            self.scheduler.finish_tick(false);
            return Ok(false);
        }
        if self.drain_once()? {
            let more = self.has_dispatchable();
            self.scheduler.finish_tick(more);
            Ok(more)
        } else {
            self.scheduler.disarm();
            Ok(false)
        }
    }

    /// One batch of queue work: every pending removal in one remote
    /// call, one bulk patch, the oldest create, and one update whose
    /// remote identity is known. Returns false when a remote failure
    /// halted the tick.
    fn drain_once(&mut self) -> EngineResult<bool> {
        let now = self.next_stamp();

        if let Some(target) = self.removals.consolidate() {
            match self.remote.remove(&target) {
                Ok(Reply::Done(count)) => {
                    self.removals.clear();
                    self.scheduler.stats_mut().removals_dispatched += 1;
                    // the soft-deleted mirrors the batch covered go now
                    let deleted = Filter::where_one(Condition::eq(FieldRef::Deleted, true));
                    self.local_remove(&RemoveTarget::Matching(deleted))?;
                    self.events.push_back(Event::Removed(count));
                    debug!(model = %self.config.name, count, "queued removals drained");
                }
                Ok(Reply::Deferred(ticket)) => {
                    self.removals.clear();
                    self.scheduler.stats_mut().removals_dispatched += 1;
                    self.inflight
                        .insert((Side::Remote, ticket), InFlight::QueuedRemove { target });
                }
                Err(error) => {
                    self.report_drain_failure(error);
                    return Ok(false);
                }
            }
        }

        if let Some(mut entry) = self.patches.pop_front() {
            entry.in_flight = true;
            entry.dispatched_at = Some(now);
            match self.remote.update_all(&entry.patch, &entry.filter) {
                Ok(Reply::Done(count)) => {
                    self.scheduler.stats_mut().patches_dispatched += 1;
                    self.acknowledge_queued_patch(&entry.filter, now)?;
                    self.events.push_back(Event::Updated(count));
                    debug!(model = %self.config.name, count, "queued patch drained");
                }
                Ok(Reply::Deferred(ticket)) => {
                    self.scheduler.stats_mut().patches_dispatched += 1;
                    self.inflight
                        .insert((Side::Remote, ticket), InFlight::QueuedPatch { entry });
                }
                Err(error) => {
                    entry.in_flight = false;
                    entry.dispatched_at = None;
                    self.patches.push_front(entry);
                    self.report_drain_failure(error);
                    return Ok(false);
                }
            }
        }

        if let Some(mut entry) = self.creates.pop_front() {
            entry.in_flight = true;
            entry.dispatched_at = Some(now);
            if !self.dispatch_queued_save(entry, now, true)? {
                return Ok(false);
            }
        }

        if let Some(mut entry) = self.updates.pop_first_resolvable(&self.identities, &self.waits) {
            entry.in_flight = true;
            entry.dispatched_at = Some(now);
            if !self.dispatch_queued_save(entry, now, false)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn dispatch_queued_save(
        &mut self,
        entry: PendingWrite,
        now: u64,
        creating: bool,
    ) -> EngineResult<bool> {
        match self.remote.save(entry.record.remote_view()) {
            Ok(Reply::Done(saved)) => {
                let stats = self.scheduler.stats_mut();
                if creating {
                    stats.creates_dispatched += 1;
                } else {
                    stats.updates_dispatched += 1;
                }
                if let Outcome::Done(record) = self.acknowledge_remote_save(entry, saved, now)? {
                    self.events.push_back(Event::Saved(record));
                }
                Ok(true)
            }
            Ok(Reply::Deferred(ticket)) => {
                let stats = self.scheduler.stats_mut();
                if creating {
                    stats.creates_dispatched += 1;
                } else {
                    stats.updates_dispatched += 1;
                }
                if let Some(local) = entry.record.local_id {
                    self.begin_wait(local);
                }
                self.inflight.insert(
                    (Side::Remote, ticket),
                    InFlight::RemoteSave { entry, queued: true },
                );
                Ok(true)
            }
            Err(error) => {
                if creating {
                    self.creates.push_front(entry);
                } else {
                    self.updates.push_front(entry);
                }
                self.report_drain_failure(error);
                Ok(false)
            }
        }
    }

    fn acknowledge_queued_patch(&mut self, filter: &Filter, now: u64) -> EngineResult<()> {
        // the remote accepted the same patch the mirrors already carry
        let ack = Patch::new().with_meta(MetaPatch {
            dirty: Some(false),
            deleted: None,
            stamp: Some(now),
        });
        self.local_update(&ack, filter)?;
        Ok(())
    }

    fn report_drain_failure(&mut self, error: offsync_store::StoreError) {
        warn!(model = %self.config.name, %error, "drain tick halted");
        self.events.push_back(Event::Failed(error.into()));
    }

    fn flush_pending(&mut self) -> EngineResult<()> {
        while self.online && self.has_dispatchable() {
            let before = self.pending_total();
            self.scheduler.arm();
            self.drain_tick()?;
            if self.pending_total() >= before {
                // blocked on deferred completions or a failure
                break;
            }
        }
        Ok(())
    }

    // ---- completion handling ----

    fn handle_completion(&mut self, side: Side, completion: Completion) -> EngineResult<()> {
        let Some(context) = self.inflight.remove(&(side, completion.ticket)) else {
            warn!(
                model = %self.config.name,
                ticket = completion.ticket.0,
                "completion without context"
            );
            return Ok(());
        };
        match (context, completion.outcome) {
            (InFlight::Init, CompletionOutcome::Initialized) => {
                self.pending_inits = self.pending_inits.saturating_sub(1);
                if self.pending_inits == 0 && !self.init_failed {
                    self.recover_queues()?;
                }
            }
            (InFlight::Init, CompletionOutcome::Failed(error)) => {
                // the model stays unready; the host decides whether to
                // re-run init
                self.pending_inits = self.pending_inits.saturating_sub(1);
                self.init_failed = true;
                warn!(model = %self.config.name, %error, "store init failed");
                self.events.push_back(Event::Failed(error.into()));
            }
            (InFlight::RecoveryList, CompletionOutcome::Listed(rows)) => {
                self.finish_recovery(rows)?;
            }
            (InFlight::LocalSave { stamp, adopt }, CompletionOutcome::Saved(saved)) => {
                if let Some(local) = saved.local_id {
                    self.ledger.record(local, stamp);
                    if let Some(remote) = saved.remote_id {
                        self.identities.insert(remote, local);
                    }
                    if let Some(entry_id) = adopt {
                        self.creates.adopt_local_id(entry_id, local);
                    }
                }
                self.events.push_back(Event::Saved(saved));
            }
            (InFlight::RemoteSave { entry, .. }, CompletionOutcome::Saved(saved)) => {
                if let Some(local) = entry.record.local_id {
                    self.end_wait(local);
                }
                let dispatched = entry.dispatched_at.unwrap_or_else(now_millis);
                if let Outcome::Done(record) =
                    self.acknowledge_remote_save(entry, saved, dispatched)?
                {
                    self.events.push_back(Event::Saved(record));
                }
                if self.online && self.has_dispatchable() {
                    self.scheduler.arm();
                }
            }
            (InFlight::RemoteSave { entry, queued }, CompletionOutcome::Failed(error)) => {
                if let Some(local) = entry.record.local_id {
                    self.end_wait(local);
                }
                if queued {
                    // the write is not lost; it returns to the head of
                    // its queue
                    if entry.record.remote_id.is_some() {
                        self.updates.push_front(entry);
                    } else {
                        self.creates.push_front(entry);
                    }
                }
                self.scheduler.disarm();
                warn!(model = %self.config.name, %error, "deferred save failed");
                self.events.push_back(Event::Failed(error.into()));
            }
            (InFlight::QueuedPatch { entry }, CompletionOutcome::Updated(count)) => {
                let now = self.next_stamp();
                self.acknowledge_queued_patch(&entry.filter, now)?;
                self.events.push_back(Event::Updated(count));
                if self.online && self.has_dispatchable() {
                    self.scheduler.arm();
                }
            }
            (InFlight::QueuedPatch { mut entry }, CompletionOutcome::Failed(error)) => {
                entry.in_flight = false;
                entry.dispatched_at = None;
                self.patches.push_front(entry);
                self.scheduler.disarm();
                warn!(model = %self.config.name, %error, "deferred patch failed");
                self.events.push_back(Event::Failed(error.into()));
            }
            (InFlight::QueuedRemove { .. }, CompletionOutcome::Removed(count)) => {
                let deleted = Filter::where_one(Condition::eq(FieldRef::Deleted, true));
                self.local_remove(&RemoveTarget::Matching(deleted))?;
                self.events.push_back(Event::Removed(count));
                if self.online && self.has_dispatchable() {
                    self.scheduler.arm();
                }
            }
            (InFlight::QueuedRemove { target }, CompletionOutcome::Failed(error)) => {
                self.removals.restore(target);
                self.scheduler.disarm();
                warn!(model = %self.config.name, %error, "deferred removal batch failed");
                self.events.push_back(Event::Failed(error.into()));
            }
            (InFlight::DirectPatch { patch, filter, stamp }, CompletionOutcome::Updated(count)) => {
                let count = self.finish_direct_patch(&patch, &filter, count, stamp)?;
                self.events.push_back(Event::Updated(count));
            }
            (InFlight::DirectPatch { .. }, CompletionOutcome::Failed(error)) => {
                warn!(model = %self.config.name, %error, "deferred update failed");
                self.events.push_back(Event::Failed(error.into()));
            }
            (InFlight::DirectRemove { target }, CompletionOutcome::Removed(count)) => {
                let count = self.finish_direct_remove(&target, count)?;
                self.events.push_back(Event::Removed(count));
            }
            (InFlight::DirectRemove { target }, CompletionOutcome::Failed(error)) => {
                if let RemoveTarget::Id(remote) = &target {
                    if let Some(local) = self.identities.local_for(*remote) {
                        self.end_wait(local);
                    }
                }
                warn!(model = %self.config.name, %error, "deferred remove failed");
                self.events.push_back(Event::Failed(error.into()));
            }
            (
                InFlight::RemoteFind {
                    remote,
                    mirror,
                    dispatched_at,
                },
                CompletionOutcome::Found(found),
            ) => {
                let result = self.finish_remote_find(remote, found, mirror, dispatched_at)?;
                self.events.push_back(Event::Found(result));
            }
            (InFlight::RemoteFind { mirror, .. }, CompletionOutcome::Failed(error)) => {
                warn!(model = %self.config.name, %error, "deferred find failed; serving mirror");
                self.events
                    .push_back(Event::Found(mirror.map(|r| r.remote_view())));
            }
            (
                InFlight::RemoteList {
                    filter,
                    dispatched_at,
                },
                CompletionOutcome::Listed(rows),
            ) => {
                let out = self.finish_remote_list(&filter, rows, dispatched_at)?;
                self.events.push_back(Event::Listed(out));
            }
            (InFlight::RemoteList { .. }, CompletionOutcome::Failed(error)) => {
                warn!(model = %self.config.name, %error, "deferred list failed");
                self.events.push_back(Event::Failed(error.into()));
            }
            (InFlight::LocalSave { .. } | InFlight::LocalOp, CompletionOutcome::Failed(error)) => {
                warn!(model = %self.config.name, %error, "local store write failed");
                self.events.push_back(Event::Failed(error.into()));
            }
            (InFlight::LocalOp, _) => {}
            (_, outcome) => {
                warn!(model = %self.config.name, ?outcome, "mismatched completion");
            }
        }
        Ok(())
    }

    // ---- init internals ----

    fn recover_queues(&mut self) -> EngineResult<()> {
        let filter = Filter {
            any: vec![
                Predicate {
                    conditions: vec![Condition::eq(FieldRef::Dirty, true)],
                },
                Predicate {
                    conditions: vec![Condition::eq(FieldRef::Deleted, true)],
                },
            ],
        };
        match self.local.list(&filter, &ListModifiers::default())? {
            Reply::Done(rows) => self.finish_recovery(rows),
            Reply::Deferred(ticket) => {
                self.inflight
                    .insert((Side::Local, ticket), InFlight::RecoveryList);
                Ok(())
            }
        }
    }

    fn finish_recovery(&mut self, rows: Vec<Record>) -> EngineResult<()> {
        let recovered = rows.len();
        for row in rows {
            let Some(local) = row.local_id else { continue };
            if let Some(remote) = row.remote_id {
                self.identities.insert(remote, local);
            }
            if row.meta.deleted {
                self.ledger.tombstone(local);
                if let Some(remote) = row.remote_id {
                    self.ledger.tombstone_remote(remote);
                    self.removals.push_id(remote);
                }
            } else {
                self.ledger.record(local, row.meta.stamp);
                if row.remote_id.is_some() {
                    self.updates.push(row);
                } else {
                    self.creates.push(row);
                }
            }
        }
        self.enabled = true;
        if recovered > 0 {
            info!(model = %self.config.name, recovered, "pending queues rebuilt from mirrors");
        }
        if self.online && self.has_dispatchable() {
            self.scheduler.arm();
        }
        Ok(())
    }

    // ---- shared helpers ----

    fn ensure_ready(&self) -> EngineResult<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(EngineError::NotReady)
        }
    }

    /// Strictly increasing write stamp, so back-to-back writes in the
    /// same millisecond still order correctly.
    fn next_stamp(&mut self) -> u64 {
        let now = now_millis();
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }

    fn has_dispatchable(&self) -> bool {
        !self.creates.is_empty()
            || !self.patches.is_empty()
            || !self.removals.is_empty()
            || self.updates.has_resolvable(&self.identities, &self.waits)
    }

    fn pending_total(&self) -> usize {
        let removals = usize::from(!self.removals.is_empty());
        self.creates.len() + self.updates.len() + self.patches.len() + removals
    }

    fn wait_count(&self, local: LocalId) -> u32 {
        self.waits.get(&local).copied().unwrap_or(0)
    }

    fn begin_wait(&mut self, local: LocalId) {
        *self.waits.entry(local).or_insert(0) += 1;
    }

    fn end_wait(&mut self, local: LocalId) {
        if let Some(count) = self.waits.get_mut(&local) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.waits.remove(&local);
            }
        }
    }

    fn local_find_sync(&mut self, key: FindKey) -> EngineResult<Option<Record>> {
        match self.local.find(key)? {
            Reply::Done(found) => Ok(found),
            Reply::Deferred(ticket) => {
                self.inflight.insert((Side::Local, ticket), InFlight::LocalOp);
                Ok(None)
            }
        }
    }

    fn local_list_sync(&mut self, filter: &Filter) -> EngineResult<Vec<Record>> {
        match self.local.list(filter, &ListModifiers::default())? {
            Reply::Done(rows) => Ok(rows),
            Reply::Deferred(ticket) => {
                self.inflight.insert((Side::Local, ticket), InFlight::LocalOp);
                Ok(Vec::new())
            }
        }
    }

    fn local_update(&mut self, patch: &Patch, filter: &Filter) -> EngineResult<usize> {
        match self.local.update_all(patch, filter)? {
            Reply::Done(count) => Ok(count),
            Reply::Deferred(ticket) => {
                self.inflight.insert((Side::Local, ticket), InFlight::LocalOp);
                Ok(0)
            }
        }
    }

    fn local_remove(&mut self, target: &RemoveTarget) -> EngineResult<usize> {
        match self.local.remove(target)? {
            Reply::Done(count) => Ok(count),
            Reply::Deferred(ticket) => {
                self.inflight.insert((Side::Local, ticket), InFlight::LocalOp);
                Ok(0)
            }
        }
    }
}
