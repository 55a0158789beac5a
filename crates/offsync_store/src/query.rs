//! Filters, list modifiers and removal targets.

use crate::record::{Record, RemoteId};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Names a comparable attribute of a record.
///
/// Identity and replica metadata are addressed explicitly instead of by
/// magic field names, so a filter means the same thing against either
/// store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldRef {
    /// The local identity.
    LocalId,
    /// The remote identity.
    RemoteId,
    /// The locally-modified flag.
    Dirty,
    /// The soft-deleted flag.
    Deleted,
    /// A named entity field.
    Field(String),
}

impl FieldRef {
    /// Creates a reference to a named field.
    pub fn field(name: impl Into<String>) -> Self {
        FieldRef::Field(name.into())
    }

    /// Resolves the referenced attribute on a record.
    pub fn resolve(&self, record: &Record) -> Value {
        match self {
            FieldRef::LocalId => record
                .local_id
                .map_or(Value::Null, |id| Value::Int(id.0 as i64)),
            FieldRef::RemoteId => record
                .remote_id
                .map_or(Value::Null, |id| Value::Int(id.0 as i64)),
            FieldRef::Dirty => Value::Bool(record.meta.dirty),
            FieldRef::Deleted => Value::Bool(record.meta.deleted),
            FieldRef::Field(name) => record.field(name).cloned().unwrap_or(Value::Null),
        }
    }
}

/// Comparison operator for a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// Equal (loose numeric equality).
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Text containment.
    Like,
    /// Membership in a value set.
    In,
}

/// One field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// The attribute being compared.
    pub field: FieldRef,
    /// The operator.
    pub op: CompareOp,
    /// The right-hand value. For `In`, every candidate value.
    pub values: Vec<Value>,
}

impl Condition {
    /// Creates an equality condition.
    pub fn eq(field: FieldRef, value: impl Into<Value>) -> Self {
        Self {
            field,
            op: CompareOp::Eq,
            values: vec![value.into()],
        }
    }

    /// Creates a condition with an explicit operator.
    pub fn cmp(field: FieldRef, op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            field,
            op,
            values: vec![value.into()],
        }
    }

    /// Creates an `In` condition over remote ids.
    pub fn remote_id_in(ids: impl IntoIterator<Item = RemoteId>) -> Self {
        Self {
            field: FieldRef::RemoteId,
            op: CompareOp::In,
            values: ids.into_iter().map(|id| Value::Int(id.0 as i64)).collect(),
        }
    }

    /// Returns true if the record satisfies this condition.
    pub fn matches(&self, record: &Record) -> bool {
        let actual = self.field.resolve(record);
        match self.op {
            CompareOp::In => self.values.iter().any(|v| actual.loose_eq(v)),
            CompareOp::Like => match (actual.as_text(), self.values.first()) {
                (Some(text), Some(Value::Text(needle))) => text.contains(needle.as_str()),
                _ => false,
            },
            op => {
                let Some(expected) = self.values.first() else {
                    return false;
                };
                match actual.compare(expected) {
                    Some(ord) => match op {
                        CompareOp::Eq => ord == Ordering::Equal,
                        CompareOp::Ne => ord != Ordering::Equal,
                        CompareOp::Gt => ord == Ordering::Greater,
                        CompareOp::Ge => ord != Ordering::Less,
                        CompareOp::Lt => ord == Ordering::Less,
                        CompareOp::Le => ord != Ordering::Greater,
                        CompareOp::Like | CompareOp::In => false,
                    },
                    // Null != value is the one comparison that succeeds
                    // across kinds.
                    None => op == CompareOp::Ne,
                }
            }
        }
    }
}

/// A conjunction of conditions (all must hold).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// The conditions, combined with AND.
    pub conditions: Vec<Condition>,
}

impl Predicate {
    /// Returns true if every condition matches.
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }
}

/// A disjunction of predicates (any may hold); an empty filter matches
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// The alternative predicates, combined with OR.
    pub any: Vec<Predicate>,
}

impl Filter {
    /// A filter that matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter from a single list of ANDed conditions.
    pub fn where_all(conditions: Vec<Condition>) -> Self {
        Self {
            any: vec![Predicate { conditions }],
        }
    }

    /// A filter from a single condition.
    pub fn where_one(condition: Condition) -> Self {
        Self::where_all(vec![condition])
    }

    /// Returns true if any predicate matches (or the filter is empty).
    pub fn matches(&self, record: &Record) -> bool {
        self.any.is_empty() || self.any.iter().any(|p| p.matches(record))
    }

    /// Returns a copy with `condition` ANDed into every alternative.
    pub fn and_each(&self, condition: Condition) -> Filter {
        if self.any.is_empty() {
            return Filter::where_one(condition);
        }
        Filter {
            any: self
                .any
                .iter()
                .map(|p| {
                    let mut conditions = p.conditions.clone();
                    conditions.push(condition.clone());
                    Predicate { conditions }
                })
                .collect(),
        }
    }

    /// Merges another filter's alternatives into this one (OR).
    pub fn or(&mut self, other: Filter) {
        if other.any.is_empty() {
            // OR with match-everything widens to everything.
            self.any.clear();
        } else {
            self.any.extend(other.any);
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// Pagination and ordering for list calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListModifiers {
    /// Sort key and direction; default is local id ascending.
    pub order: Option<(FieldRef, SortOrder)>,
    /// Rows to skip from the start.
    pub offset: usize,
    /// Maximum rows to return; `None` means unbounded.
    pub limit: Option<usize>,
    /// 1-based page number overriding `offset`; `-1` selects the last
    /// page. Requires a limit.
    pub page: Option<i64>,
}

impl Default for ListModifiers {
    fn default() -> Self {
        Self {
            order: None,
            offset: 0,
            limit: None,
            page: None,
        }
    }
}

impl ListModifiers {
    /// Applies ordering and pagination to a result set.
    pub fn apply(&self, mut rows: Vec<Record>) -> Vec<Record> {
        match &self.order {
            Some((field, direction)) => {
                rows.sort_by(|a, b| {
                    let ord = field
                        .resolve(a)
                        .compare(&field.resolve(b))
                        .unwrap_or(Ordering::Equal);
                    match direction {
                        SortOrder::Asc => ord,
                        SortOrder::Desc => ord.reverse(),
                    }
                });
            }
            None => rows.sort_by_key(|r| r.local_id),
        }

        let offset = match (self.page, self.limit) {
            (Some(-1), Some(limit)) if limit > 0 => {
                let pages = rows.len().div_ceil(limit).max(1);
                (pages - 1) * limit
            }
            (Some(page), Some(limit)) if page > 0 => (page as usize - 1) * limit,
            _ => self.offset,
        };

        let rows: Vec<Record> = rows.into_iter().skip(offset).collect();
        match self.limit {
            Some(limit) => rows.into_iter().take(limit).collect(),
            None => rows,
        }
    }
}

/// What a remove call targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoveTarget {
    /// Every record.
    All,
    /// A single record by remote identity.
    Id(RemoteId),
    /// Several records by remote identity (consolidated batch).
    Ids(Vec<RemoteId>),
    /// Every record matching a filter.
    Matching(Filter),
}

impl RemoveTarget {
    /// Returns true if the record is addressed by this target.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            RemoveTarget::All => true,
            RemoveTarget::Id(id) => record.remote_id == Some(*id),
            RemoveTarget::Ids(ids) => record
                .remote_id
                .map(|id| ids.contains(&id))
                .unwrap_or(false),
            RemoveTarget::Matching(filter) => filter.matches(record),
        }
    }
}
