//! # offsync Engine
//!
//! Offline-first reconciliation over a local and a remote [`Store`].
//!
//! A [`Model`] keeps a local replica usable while the remote store is
//! unreachable, parks writes in pending queues, and drains them in
//! order once connectivity returns. Reads prefer whichever side can
//! answer best; remote responses that are older than the last accepted
//! local write are discarded.
//!
//! ```
//! use offsync_engine::{MockRemoteStore, Model, ModelConfig};
//! use offsync_store::{FieldSpec, FieldType, MemoryStore, Record, Schema};
//!
//! let schema = Schema::new().with_field("name", FieldSpec::required(FieldType::Text));
//! let (remote, control) = MockRemoteStore::new();
//! let mut model = Model::new(
//!     ModelConfig::new("players").schema(schema).offline(),
//!     Box::new(MemoryStore::new()),
//!     Box::new(remote),
//! );
//! model.init()?;
//!
//! // offline: the write lands locally and is parked
//! model.save(Record::new().with_field("name", "alice"))?;
//! assert_eq!(model.pending_creates(), 1);
//!
//! // reconnect: the queue drains to the remote store
//! model.set_online(true);
//! model.run_until_idle()?;
//! assert_eq!(control.rows().len(), 1);
//! # Ok::<(), offsync_engine::EngineError>(())
//! ```
//!
//! [`Store`]: offsync_store::Store

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod error;
mod identity;
mod ledger;
mod model;
mod queue;
mod remote;
mod scheduler;

pub use config::{ModelConfig, RemoveHook, SaveHook};
pub use error::{EngineError, EngineResult};
pub use identity::IdentityMap;
pub use ledger::{Stamp, TimestampLedger};
pub use model::{Event, Model, Outcome};
pub use queue::{PendingPatch, PendingWrite, RemovalQueue, WriteQueue};
pub use remote::{CallCounts, MockRemoteStore, RemoteControl};
pub use scheduler::{DrainStats, Scheduler, SchedulerState};
