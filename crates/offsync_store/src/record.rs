//! Entity records and replica identity.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier assigned by the local store.
///
/// Stable for the record's local lifetime, never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub u64);

/// Identifier assigned by the remote store on first successful create.
///
/// Assigned at most once per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replica bookkeeping carried by a record's local mirror.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaMeta {
    /// True when the record has local changes not yet acknowledged remotely.
    pub dirty: bool,
    /// True when the record was soft-deleted while the remote was unreachable.
    pub deleted: bool,
    /// Last-write timestamp in milliseconds.
    pub stamp: u64,
}

/// An entity: named fields plus local/remote identity.
///
/// Exactly one of the two identities addresses the record in each store:
/// the local store keys by [`LocalId`], the remote store by [`RemoteId`].
/// The replica metadata is meaningful only on the local mirror; the view
/// sent to the remote store carries cleared metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Local identity, if the local store has accepted the record.
    pub local_id: Option<LocalId>,
    /// Remote identity, if the remote store has accepted the record.
    pub remote_id: Option<RemoteId>,
    /// Field name to value.
    pub fields: BTreeMap<String, Value>,
    /// Replica bookkeeping (local mirror only).
    pub meta: ReplicaMeta,
}

impl Record {
    /// Creates an empty record with no identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns a field value, if present.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Sets a field value.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Returns true if the record carries no fields at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Merges `newer`'s fields over this record's fields.
    ///
    /// Used for queue coalescing: position is determined by the first
    /// write, payload by the latest. Identity fields are taken from
    /// whichever side has them.
    pub fn merge_fields_from(&mut self, newer: &Record) {
        for (name, value) in &newer.fields {
            self.fields.insert(name.clone(), value.clone());
        }
        if newer.local_id.is_some() {
            self.local_id = newer.local_id;
        }
        if newer.remote_id.is_some() {
            self.remote_id = newer.remote_id;
        }
    }

    /// Projects the record into the view sent to the remote store.
    ///
    /// Identity fields are preserved (the remote echoes the local id back
    /// so a create acknowledgement can be matched up); replica metadata is
    /// cleared.
    pub fn remote_view(&self) -> Record {
        Record {
            local_id: self.local_id,
            remote_id: self.remote_id,
            fields: self.fields.clone(),
            meta: ReplicaMeta::default(),
        }
    }

    /// Projects a remote response back into a local mirror.
    ///
    /// The inverse of [`Record::remote_view`] for identity fields; replica
    /// metadata starts clean and is stamped by the caller.
    pub fn local_mirror(&self, stamp: u64) -> Record {
        Record {
            local_id: self.local_id,
            remote_id: self.remote_id,
            fields: self.fields.clone(),
            meta: ReplicaMeta {
                dirty: false,
                deleted: false,
                stamp,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_round_trip_preserves_identity() {
        let record = Record::new()
            .with_field("name", "alice")
            .with_field("level", 3i64);
        let mut record = record;
        record.local_id = Some(LocalId(5));
        record.remote_id = Some(RemoteId(99));
        record.meta.dirty = true;
        record.meta.stamp = 1234;

        let round_tripped = record.remote_view().local_mirror(1234);
        assert_eq!(round_tripped.local_id, Some(LocalId(5)));
        assert_eq!(round_tripped.remote_id, Some(RemoteId(99)));
        assert_eq!(round_tripped.fields, record.fields);
        assert!(!round_tripped.meta.dirty);
    }

    #[test]
    fn serde_round_trip() {
        let mut record = Record::new()
            .with_field("name", "alice")
            .with_field("score", 3i64);
        record.local_id = Some(LocalId(1));
        record.remote_id = Some(RemoteId(2));
        record.meta.dirty = true;
        record.meta.stamp = 99;

        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn merge_takes_latest_fields() {
        let mut queued = Record::new()
            .with_field("a", 1i64)
            .with_field("b", 2i64);
        queued.local_id = Some(LocalId(1));

        let newer = Record::new().with_field("b", 20i64).with_field("c", 30i64);
        queued.merge_fields_from(&newer);

        assert_eq!(queued.field("a"), Some(&Value::Int(1)));
        assert_eq!(queued.field("b"), Some(&Value::Int(20)));
        assert_eq!(queued.field("c"), Some(&Value::Int(30)));
        assert_eq!(queued.local_id, Some(LocalId(1)));
    }
}
