//! Per-request cancellation and deadlines.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::QueryError;

/// Cancellation scope of a request.
///
/// Every entry point of [`Db`](crate::Db) takes a `Context`. Waiting for a pool
/// slot aborts without side effects when the context ends; an exchange that is
/// already on the wire is cancelled on the server and its connection discarded.
///
/// Contexts are cheap to clone. Clones share the cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    /// A context that never ends.
    pub fn background() -> Context {
        Context::default()
    }

    /// A context ending `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Context {
        Context::background().deadline(Instant::now() + timeout)
    }

    /// A context ending at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Context {
        Context::background().deadline(deadline)
    }

    /// A context ending when `token` is cancelled.
    pub fn with_cancellation(token: CancellationToken) -> Context {
        Context {
            deadline: None,
            cancel: token,
        }
    }

    /// Narrows the deadline. A later deadline than the current one is ignored.
    pub fn deadline(mut self, deadline: Instant) -> Context {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// A child context: cancelled together with this one, and on its own.
    pub fn child(&self) -> Context {
        Context {
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn get_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancels this context and all its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The reason this context ended, if it did.
    pub fn error(&self) -> Option<QueryError> {
        if self.cancel.is_cancelled() {
            return Some(QueryError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(QueryError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Completes when the context ends, with the reason.
    pub async fn done(&self) -> QueryError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => QueryError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => QueryError::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                QueryError::Cancelled
            }
        }
    }

    /// Sleeps for `duration` unless the context ends first.
    pub(crate) async fn sleep(&self, duration: Duration) -> Result<(), QueryError> {
        tokio::select! {
            err = self.done() => Err(err),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Runs `fut` unless the context ends first. Nothing is cancelled on the
    /// server; callers owning a connection handle that themselves.
    pub(crate) async fn run<T>(
        &self,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T, QueryError> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        tokio::select! {
            biased;
            out = fut => Ok(out),
            err = self.done() => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_the_context() {
        let ctx = Context::with_timeout(Duration::from_secs(5));
        assert!(ctx.error().is_none());
        assert_matches!(ctx.done().await, QueryError::DeadlineExceeded);
        assert_matches!(ctx.error(), Some(QueryError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancelling_the_parent_cancels_children() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(parent.error().is_none());

        let child = parent.child();
        parent.cancel();
        assert_matches!(child.done().await, QueryError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn run_and_sleep_stop_at_the_deadline() {
        let ctx = Context::with_timeout(Duration::from_secs(1));
        assert_matches!(ctx.run(std::future::ready(7)).await, Ok(7));
        assert_matches!(
            ctx.run(std::future::pending::<()>()).await,
            Err(QueryError::DeadlineExceeded)
        );
        assert_matches!(
            ctx.sleep(Duration::from_secs(10)).await,
            Err(QueryError::DeadlineExceeded)
        );

        let ctx = Context::background().deadline(Instant::now() + Duration::from_secs(60));
        let narrowed = ctx.clone().deadline(Instant::now() + Duration::from_secs(1));
        assert!(narrowed.get_deadline() < ctx.get_deadline());
        assert_eq!(
            ctx.clone()
                .deadline(Instant::now() + Duration::from_secs(120))
                .get_deadline(),
            ctx.get_deadline()
        );
    }
}
