//! Errors reported by the server in `Exception` packets.

use thiserror::Error;

/// Server error codes the client reacts to.
pub mod codes {
    pub const TIMEOUT_EXCEEDED: i32 = 159;
    pub const TOO_SLOW: i32 = 160;
    pub const TOO_MANY_SIMULTANEOUS_QUERIES: i32 = 202;
    pub const MEMORY_LIMIT_EXCEEDED: i32 = 241;
    pub const CANNOT_DECOMPRESS: i32 = 271;
}

/// An exception sent by the server, possibly wrapping the exception that caused it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{name}: {message} (code {code})")]
pub struct DbError {
    pub code: i32,
    pub name: String,
    /// Message with the `Name:` prefix the server repeats removed.
    pub message: String,
    pub stack_trace: String,
    #[source]
    pub nested: Option<Box<DbError>>,
}

impl DbError {
    /// Whether the server gave up because the query ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self.code, codes::TIMEOUT_EXCEEDED | codes::TOO_SLOW)
    }

    /// Whether the failure is transient and the same query may succeed if resent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            codes::TIMEOUT_EXCEEDED
                | codes::TOO_SLOW
                | codes::TOO_MANY_SIMULTANEOUS_QUERIES
                | codes::MEMORY_LIMIT_EXCEEDED
                | codes::CANNOT_DECOMPRESS
        )
    }

    /// Iterates over this error and its nested causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &DbError> {
        std::iter::successors(Some(self), |e| e.nested.as_deref())
    }
}
