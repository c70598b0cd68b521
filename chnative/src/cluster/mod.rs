//! Shards, replicas and the health monitoring that routes around sick servers.
//!
//! This includes:
//! - [Cluster], a fixed set of shards, each an ordered list of replicas (primaries
//!   before backups), with a snapshot of the replicas currently considered healthy,
//! - [Supercluster], a weighted set of clusters with its own snapshot of the
//!   clusters that still have a healthy replica,
//! - [HealthCheck], the probe the monitors run against each replica.
//!
//! Both snapshots are replaced atomically by the monitor loops, so readers never
//! observe a partially updated topology.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;

mod health;
pub use health::{HealthCheck, ServerHealthCheck};

mod shards;
pub use shards::Cluster;

mod supercluster;
pub use supercluster::{Clusters, Supercluster};

/// How often the monitors refresh the healthy snapshots.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(3);

/// Runs `f` for every target concurrently and waits for all of them. Returns the
/// first error in target order.
async fn fan_out<I, F, Fut, E>(targets: I, f: F) -> Result<(), E>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    join_all(targets.into_iter().map(f))
        .await
        .into_iter()
        .collect()
}
