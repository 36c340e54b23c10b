//! Results handed back to callers.

use std::fmt;

use hickory_proto::op::Message;

use crate::error::{Error, Result};

/// Caller-facing correlation id.
///
/// Distinct from the 16-bit DNS transaction id: it identifies a submission
/// to this engine, and comes back unchanged in the matching [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The single outcome of one submitted query.
#[derive(Debug)]
pub struct Response {
    id: QueryId,
    outcome: Result<Message>,
}

impl Response {
    pub fn new(id: QueryId, outcome: Result<Message>) -> Self {
        Self { id, outcome }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn message(&self) -> Option<&Message> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<Message> {
        self.outcome
    }
}
