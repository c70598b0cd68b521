use std::time::Duration;

use rand::Rng;

use crate::errors::QueryError;

use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};

/// Default retry policy - retries transient failures with a jittered exponential
/// backoff.
///
/// A request is sent again when the connection broke under it, or when the server
/// rejected it with one of the transient codes (timeout exceeded, too slow, too
/// many simultaneous queries, memory limit exceeded, cannot decompress). Anything
/// else is returned to the caller right away.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    max_retries: u32,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl DefaultRetryPolicy {
    /// Three retries, backing off from one second up to three.
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy {
            max_retries: 3,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3),
        }
    }

    /// Sets how many times a request may be resent. Zero disables retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the bounds of the delay before each retry.
    pub fn with_backoff(mut self, min_backoff: Duration, max_backoff: Duration) -> Self {
        self.min_backoff = min_backoff;
        self.max_backoff = max_backoff;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> DefaultRetryPolicy {
        DefaultRetryPolicy::new()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession {
            policy: self.clone(),
            retries: 0,
        })
    }
}

/// Implementation of [RetrySession] for [DefaultRetryPolicy].
pub struct DefaultRetrySession {
    policy: DefaultRetryPolicy,
    retries: u32,
}

impl DefaultRetrySession {
    /// Doubles from `min_backoff` with each retry up to `max_backoff`, then draws
    /// from the upper half of that ceiling. Never below `min_backoff`.
    fn backoff(&self) -> Duration {
        let growth = 2u32.saturating_pow(self.retries.saturating_sub(1));
        let ceiling = self
            .policy
            .min_backoff
            .saturating_mul(growth)
            .min(self.policy.max_backoff);
        let delay = rand::rng().random_range(ceiling / 2..=ceiling);
        delay.max(self.policy.min_backoff)
    }
}

fn is_retryable(error: &QueryError) -> bool {
    match error {
        QueryError::BadConnection(_) => true,
        QueryError::DbError(e) => e.is_transient(),
        _ => false,
    }
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        if self.retries >= self.policy.max_retries || !is_retryable(request_info.error) {
            return RetryDecision::DontRetry;
        }
        self.retries += 1;
        RetryDecision::RetryAfter(self.backoff())
    }

    fn reset(&mut self) {
        self.retries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{DefaultRetryPolicy, RequestInfo, RetryDecision, RetryPolicy};
    use crate::errors::{
        BadConnectionError, ConnectionPoolError, DbError, QueryError,
    };
    use crate::policies::retry::FallthroughRetryPolicy;
    use crate::utils::test_utils::setup_tracing;
    use std::time::Duration;

    fn db_error(code: i32) -> QueryError {
        QueryError::DbError(DbError {
            code,
            name: "DB::Exception".to_owned(),
            message: String::new(),
            stack_trace: String::new(),
            nested: None,
        })
    }

    fn decide(policy: &dyn RetryPolicy, error: &QueryError) -> RetryDecision {
        policy.new_session().decide_should_retry(RequestInfo { error, attempts: 1 })
    }

    #[test]
    fn default_never_retries() {
        setup_tracing();
        let never_retried = vec![
            db_error(62),
            db_error(60),
            QueryError::Cancelled,
            QueryError::DeadlineExceeded,
            QueryError::Timeout(Duration::from_secs(1)),
            QueryError::ProtocolError("out of sync"),
            QueryError::ConnectionPoolError(ConnectionPoolError::Closed),
        ];
        let policy = DefaultRetryPolicy::new();
        for error in never_retried {
            assert_eq!(decide(&policy, &error), RetryDecision::DontRetry, "{error}");
        }
    }

    #[test]
    fn default_retries_transient_errors_with_bounded_backoff() {
        setup_tracing();
        let retried = vec![
            db_error(159),
            db_error(160),
            db_error(202),
            db_error(241),
            db_error(271),
            QueryError::BadConnection(BadConnectionError::from(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset,
            ))),
        ];
        let policy = DefaultRetryPolicy::new()
            .with_backoff(Duration::from_millis(10), Duration::from_millis(30));
        for error in retried {
            match decide(&policy, &error) {
                RetryDecision::RetryAfter(delay) => {
                    assert!(delay >= Duration::from_millis(10), "{delay:?}");
                    assert!(delay <= Duration::from_millis(30), "{delay:?}");
                }
                other => panic!("{error} was not retried: {other:?}"),
            }
        }
    }

    #[test]
    fn default_backoff_grows_with_each_retry() {
        setup_tracing();
        let policy = DefaultRetryPolicy::new()
            .with_max_retries(5)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(50));
        let error = db_error(202);
        let mut session = policy.new_session();
        let bounds = [(10, 10), (10, 20), (20, 40), (25, 50), (25, 50)];
        for (attempts, (lo, hi)) in (1..).zip(bounds) {
            match session.decide_should_retry(RequestInfo {
                error: &error,
                attempts,
            }) {
                RetryDecision::RetryAfter(delay) => {
                    assert!(delay >= Duration::from_millis(lo), "retry {attempts}: {delay:?}");
                    assert!(delay <= Duration::from_millis(hi), "retry {attempts}: {delay:?}");
                }
                other => panic!("retry {attempts} was refused: {other:?}"),
            }
        }
    }

    #[test]
    fn default_gives_up_after_max_retries() {
        setup_tracing();
        let policy = DefaultRetryPolicy::new()
            .with_max_retries(2)
            .with_backoff(Duration::ZERO, Duration::ZERO);
        let error = db_error(202);
        let mut session = policy.new_session();
        for attempts in 1..=2 {
            assert_eq!(
                session.decide_should_retry(RequestInfo {
                    error: &error,
                    attempts
                }),
                RetryDecision::RetryAfter(Duration::ZERO)
            );
        }
        assert_eq!(
            session.decide_should_retry(RequestInfo {
                error: &error,
                attempts: 3
            }),
            RetryDecision::DontRetry
        );

        session.reset();
        assert_ne!(
            session.decide_should_retry(RequestInfo {
                error: &error,
                attempts: 1
            }),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn fallthrough_never_retries() {
        setup_tracing();
        assert_eq!(
            decide(&FallthroughRetryPolicy::new(), &db_error(202)),
            RetryDecision::DontRetry
        );
    }
}
