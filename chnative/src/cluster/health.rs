use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{Context, Db};
use crate::errors::{HealthCheckError, QueryError};

/// Failures are counted over this many most recent checks.
pub(crate) const ERROR_WINDOW: usize = 60;
/// Failures within the window before a replica is taken out of rotation.
pub(crate) const ERROR_THRESHOLD: usize = 5;

/// Probes one replica. The cluster monitor calls it for every replica on every
/// tick; an error counts as one failure of that replica.
#[async_trait]
pub trait HealthCheck: Send + Sync + std::fmt::Debug {
    async fn check(&self, ctx: &Context, replica: &Db) -> Result<(), HealthCheckError>;
}

/// Pings the replica, then looks for signs that it falls behind: a partition
/// with too many unmerged parts, or a long replication queue.
#[derive(Debug, Clone)]
pub struct ServerHealthCheck {
    /// Active parts in a single partition that make the replica unhealthy.
    pub max_parts_per_partition: u64,
    /// Replication queue entries that make the replica unhealthy.
    pub max_replication_queue: u64,
    pub ping_attempts: usize,
    pub ping_interval: Duration,
}

impl Default for ServerHealthCheck {
    fn default() -> Self {
        ServerHealthCheck {
            max_parts_per_partition: 200,
            max_replication_queue: 1000,
            ping_attempts: 3,
            ping_interval: Duration::from_millis(100),
        }
    }
}

impl ServerHealthCheck {
    async fn ping(&self, ctx: &Context, replica: &Db) -> Result<(), QueryError> {
        let mut attempt = 1;
        loop {
            match replica.ping(ctx).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= self.ping_attempts => return Err(err),
                Err(err) => {
                    tracing::trace!("[{}] Ping attempt {} failed: {}", replica.addr(), attempt, err);
                    ctx.sleep(self.ping_interval).await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn check_parts(&self, ctx: &Context, replica: &Db) -> Result<(), HealthCheckError> {
        let sql = format!(
            "SELECT table, partition, count() FROM system.parts WHERE active \
             GROUP BY table, partition HAVING count() >= {} LIMIT 1",
            self.max_parts_per_partition
        );
        let query_err = |source: QueryError| HealthCheckError::Query {
            addr: replica.addr().to_owned(),
            source,
        };
        let block = replica.query_block(ctx, &sql).await.map_err(query_err)?;
        if block.rows() == 0 {
            return Ok(());
        }
        let cell = |i: usize| block.columns().get(i).ok_or(QueryError::ProtocolError("missing column"));
        let parse = || -> Result<HealthCheckError, QueryError> {
            Ok(HealthCheckError::TooManyParts {
                addr: replica.addr().to_owned(),
                table: cell(0)?.get::<String>(0)?,
                partition: cell(1)?.get::<String>(0)?,
                parts: cell(2)?.get::<u64>(0)?,
            })
        };
        Err(parse().unwrap_or_else(query_err))
    }

    async fn check_replication(&self, ctx: &Context, replica: &Db) -> Result<(), HealthCheckError> {
        let query_err = |source: QueryError| HealthCheckError::Query {
            addr: replica.addr().to_owned(),
            source,
        };
        let block = replica
            .query_block(ctx, "SELECT count() FROM system.replication_queue")
            .await
            .map_err(query_err)?;
        let len = match block.columns().first() {
            Some(column) => column.get::<u64>(0).map_err(|e| query_err(e.into()))?,
            None => return Err(query_err(QueryError::ProtocolError("missing column"))),
        };
        if len >= self.max_replication_queue {
            return Err(HealthCheckError::ReplicationQueue {
                addr: replica.addr().to_owned(),
                len,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for ServerHealthCheck {
    async fn check(&self, ctx: &Context, replica: &Db) -> Result<(), HealthCheckError> {
        self.ping(ctx, replica)
            .await
            .map_err(|source| HealthCheckError::Unreachable {
                addr: replica.addr().to_owned(),
                source,
            })?;
        self.check_parts(ctx, replica).await?;
        self.check_replication(ctx, replica).await
    }
}

/// Rolling count of failed checks of one replica, over its last `window` checks.
#[derive(Debug)]
pub(crate) struct ErrorCounter {
    window: usize,
    threshold: usize,
    outcomes: Mutex<VecDeque<bool>>,
}

impl ErrorCounter {
    pub(crate) fn new(window: usize, threshold: usize) -> Self {
        ErrorCounter {
            window,
            threshold,
            outcomes: Mutex::new(VecDeque::with_capacity(window)),
        }
    }

    /// Records the outcome of one check. Returns true when the check failed and
    /// the failures within the window reached the threshold.
    pub(crate) fn record(&self, failed: bool) -> bool {
        let mut outcomes = self
            .outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        outcomes.push_back(failed);
        while outcomes.len() > self.window {
            outcomes.pop_front();
        }
        failed && outcomes.iter().filter(|&&failed| failed).count() >= self.threshold
    }
}
