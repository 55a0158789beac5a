//! # offsync Store
//!
//! Store contract and shared data model for the offsync engine.
//!
//! This crate provides:
//! - Dynamic [`Value`] type for entity fields
//! - [`Record`]: an entity with local/remote identity and replica metadata
//! - Field [`Schema`] with validation patterns
//! - Query types: [`Filter`], [`Condition`], [`ListModifiers`], [`RemoveTarget`]
//! - [`Patch`] semantics including a parsed arithmetic [`Expr`] AST
//! - The [`Store`] trait consumed by the synchronization engine
//! - [`MemoryStore`]: the always-available in-memory local backend
//!
//! ## Architecture
//!
//! The engine is wired with two `Store` instances: a *local* store that is
//! always reachable and a *remote* store that may not be. Both expose the
//! same CRUD-like contract; backends that complete work asynchronously
//! return [`Reply::Deferred`] and deliver a [`Completion`] when the host
//! pumps the engine.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod memory;
mod patch;
mod query;
mod record;
mod reply;
mod schema;
mod value;

pub use backend::{AsyncMode, FindKey, Store};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use patch::{Expr, ExprError, ExprOp, FieldUpdate, MetaPatch, Patch, Term, Updater};
pub use query::{
    CompareOp, Condition, FieldRef, Filter, ListModifiers, Predicate, RemoveTarget, SortOrder,
};
pub use record::{LocalId, Record, RemoteId, ReplicaMeta};
pub use reply::{Completion, CompletionOutcome, Reply, Ticket};
pub use schema::{FieldSpec, FieldType, FieldViolation, Schema};
pub use value::Value;
