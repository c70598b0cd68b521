//! Request retries configurations\
//! To decide when to retry a request the [`Db`](crate::Db) can use any object which
//! implements the `RetryPolicy` trait

use std::time::Duration;

use crate::errors::QueryError;

/// Information about a failed request
pub struct RequestInfo<'a> {
    /// The error with which the request failed
    pub error: &'a QueryError,
    /// Number of attempts made so far, the failed one included
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the whole request again once the delay has passed.
    RetryAfter(Duration),
    DontRetry,
}

/// Specifies a policy used to decide when to retry a request
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Called for each new request, starts a session of deciding about retries
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Used throughout a single request to decide when to retry it
/// After this request is finished it is destroyed or reset
pub trait RetrySession: Send + Sync {
    /// Called after the request failed - decide what to do next
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision;

    /// Reset before using for a new request
    fn reset(&mut self);
}
