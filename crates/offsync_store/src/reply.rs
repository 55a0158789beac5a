//! Deferred-reply plumbing for asynchronous backends.

use crate::error::StoreError;
use crate::record::Record;

/// Identifies one deferred store operation.
///
/// Tickets are unique per store instance, not globally; the engine keys
/// its in-flight table by store side plus ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(pub u64);

/// The immediate result of a store call.
///
/// Synchronous backends always answer [`Reply::Done`]; asynchronous ones
/// may answer [`Reply::Deferred`] and deliver a [`Completion`] carrying
/// the same ticket once the host pumps the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    /// The operation completed synchronously.
    Done(T),
    /// The result will arrive as a completion.
    Deferred(Ticket),
}

impl<T> Reply<T> {
    /// Returns the completed value, if the reply was synchronous.
    pub fn done(self) -> Option<T> {
        match self {
            Reply::Done(value) => Some(value),
            Reply::Deferred(_) => None,
        }
    }

    /// Returns true if the result is still pending.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Reply::Deferred(_))
    }
}

/// The payload of a finished deferred operation.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// A deferred init finished.
    Initialized,
    /// A save finished; carries the stored record with identity assigned.
    Saved(Record),
    /// An update-all finished; carries the affected row count.
    Updated(usize),
    /// A remove finished; carries the affected row count.
    Removed(usize),
    /// A find finished.
    Found(Option<Record>),
    /// A list finished.
    Listed(Vec<Record>),
    /// The operation failed after being deferred.
    Failed(StoreError),
}

/// A finished deferred operation, drained via
/// [`Store::poll_completions`](crate::Store::poll_completions).
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// The ticket handed out when the operation was deferred.
    pub ticket: Ticket,
    /// What happened.
    pub outcome: CompletionOutcome,
}

impl Completion {
    /// Creates a completion.
    pub fn new(ticket: Ticket, outcome: CompletionOutcome) -> Self {
        Self { ticket, outcome }
    }
}
