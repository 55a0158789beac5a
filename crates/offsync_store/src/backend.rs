//! The store contract consumed by the synchronization engine.

use crate::error::StoreResult;
use crate::patch::Patch;
use crate::query::{Filter, ListModifiers, RemoveTarget};
use crate::record::{LocalId, Record, RemoteId};
use crate::reply::{Completion, Reply};

/// When a backend's operations may complete asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncMode {
    /// Operations always complete synchronously.
    Never,
    /// Operations may be deferred.
    Always,
    /// Operations may be deferred only when the engine itself is
    /// configured asynchronous.
    WithEngine,
}

impl AsyncMode {
    /// Resolves the effective asynchrony given the engine's own mode.
    pub fn effective(&self, engine_async: bool) -> bool {
        match self {
            AsyncMode::Never => false,
            AsyncMode::Always => true,
            AsyncMode::WithEngine => engine_async,
        }
    }
}

/// Addresses a single record in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindKey {
    /// By local identity (local store).
    Local(LocalId),
    /// By remote identity (remote store, or a local mirror's `remote_id`).
    Remote(RemoteId),
}

/// A uniform create/update/remove/find/list contract over one physical
/// backend.
///
/// The engine is wired with two implementations: an always-available
/// local store and an intermittently reachable remote store. It never
/// assumes how a backend persists or transmits data, only this contract.
///
/// Saves are upserts: a record without a matching identity is created
/// and assigned one; otherwise the addressed record is replaced.
pub trait Store {
    /// Configures the backend with the model schema. Must be called
    /// before any other operation.
    fn init(&mut self, schema: crate::schema::Schema) -> StoreResult<Reply<()>>;

    /// When this backend's operations may be deferred.
    fn async_mode(&self) -> AsyncMode;

    /// Returns true if the backend is currently reachable.
    fn is_available(&self) -> bool;

    /// Flips reachability (connectivity signal for remote backends).
    fn set_available(&mut self, available: bool);

    /// Creates or replaces a record, assigning identity as needed.
    fn save(&mut self, record: Record) -> StoreResult<Reply<Record>>;

    /// Applies a patch to every record matching the filter; answers the
    /// affected row count.
    fn update_all(&mut self, patch: &Patch, filter: &Filter) -> StoreResult<Reply<usize>>;

    /// Removes the targeted records; answers the removed row count.
    fn remove(&mut self, target: &RemoveTarget) -> StoreResult<Reply<usize>>;

    /// Looks up a single record.
    fn find(&mut self, key: FindKey) -> StoreResult<Reply<Option<Record>>>;

    /// Lists records matching the filter, ordered and paginated.
    fn list(&mut self, filter: &Filter, modifiers: &ListModifiers)
        -> StoreResult<Reply<Vec<Record>>>;

    /// Drains finished deferred operations. Synchronous backends always
    /// answer an empty vector.
    fn poll_completions(&mut self) -> Vec<Completion>;

    /// Releases backend resources. Further calls fail.
    fn close(&mut self);
}
