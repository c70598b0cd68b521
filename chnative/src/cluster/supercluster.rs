use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::shards::Cluster;
use super::{fan_out, MONITOR_INTERVAL};
use crate::client::Db;
use crate::errors::HealthCheckError;

/// A selection of clusters, each repeated as many times as its weight in the
/// routing list.
#[derive(Debug)]
pub struct Clusters {
    clusters: Vec<Arc<Cluster>>,
    weighted: Vec<Arc<Cluster>>,
    next_cluster: AtomicUsize,
}

impl Clusters {
    fn select(all: &[Arc<Cluster>], weights: &[usize], only_live: bool) -> Clusters {
        let mut clusters = Vec::with_capacity(all.len());
        let mut weighted = Vec::with_capacity(all.len());
        for (cluster, &weight) in all.iter().zip(weights) {
            if weight == 0 || (only_live && !cluster.has_live_replicas()) {
                continue;
            }
            clusters.push(Arc::clone(cluster));
            weighted.extend(std::iter::repeat(cluster).take(weight).cloned());
        }
        Clusters {
            clusters,
            weighted,
            next_cluster: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Cluster>> {
        self.clusters.iter()
    }

    pub fn by_index(&self, index: usize) -> Option<&Arc<Cluster>> {
        self.clusters.get(index)
    }

    /// The cluster for `client_id`, picked from the weighted list so heavier
    /// clusters get proportionally more clients.
    pub fn cluster(&self, client_id: u64) -> Option<&Arc<Cluster>> {
        if self.weighted.is_empty() {
            return None;
        }
        let idx = (client_id % self.weighted.len() as u64) as usize;
        self.weighted.get(idx)
    }

    /// Clusters in turn, ignoring weights.
    pub fn rand(&self) -> Option<&Arc<Cluster>> {
        if self.clusters.is_empty() {
            return None;
        }
        let i = self.next_cluster.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.clusters.get(i % self.clusters.len())
    }
}

/// Weighted set of [`Cluster`]s.
///
/// A cluster with weight zero never receives traffic. The healthy snapshot holds
/// the clusters with at least one replica that passed its last check; when no
/// cluster qualifies, it holds all of them rather than none.
#[derive(Debug)]
pub struct Supercluster {
    weights: Vec<usize>,
    all: Clusters,
    healthy: ArcSwap<Clusters>,
}

impl Supercluster {
    /// # Panics
    ///
    /// Panics when `clusters` and `weights` differ in length.
    pub fn new(clusters: Vec<Arc<Cluster>>, weights: Vec<usize>) -> Supercluster {
        assert_eq!(
            clusters.len(),
            weights.len(),
            "clusters and weights have different lengths"
        );
        if weights.iter().all(|&w| w == 0) {
            warn!("All cluster weights are zero");
        }
        let all = Clusters::select(&clusters, &weights, false);
        let supercluster = Supercluster {
            healthy: ArcSwap::from_pointee(Clusters::select(&clusters, &weights, false)),
            weights,
            all,
        };
        supercluster.refresh_health();
        supercluster
    }

    /// Clusters with a non-zero weight.
    pub fn all(&self) -> &Clusters {
        &self.all
    }

    /// The latest healthy snapshot.
    pub fn healthy(&self) -> Arc<Clusters> {
        self.healthy.load_full()
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// A healthy cluster for `client_id`. See [`Clusters::cluster`].
    pub fn cluster(&self, client_id: u64) -> Option<Arc<Cluster>> {
        self.healthy.load().cluster(client_id).cloned()
    }

    /// Healthy clusters in turn.
    pub fn rand(&self) -> Option<Arc<Cluster>> {
        self.healthy.load().rand().cloned()
    }

    /// Finds the replica with the given `host:port` and its cluster.
    pub fn replica_by_addr(&self, addr: &str) -> Option<(Arc<Cluster>, Db)> {
        self.all.iter().find_map(|cluster| {
            cluster
                .replicas()
                .iter()
                .find(|db| db.addr() == addr)
                .map(|db| (Arc::clone(cluster), db.clone()))
        })
    }

    /// The first health error among the clusters.
    pub fn check_health(&self) -> Result<(), HealthCheckError> {
        self.all.iter().try_for_each(|cluster| cluster.check_health())
    }

    pub async fn for_each_cluster<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: FnMut(Arc<Cluster>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        fan_out(self.all.iter().cloned(), f).await
    }

    /// Runs `f` on the first replica of every shard of every cluster
    /// concurrently. Waits for all of them and returns the first error.
    pub async fn for_each_shard<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: Fn(Arc<Cluster>, Db) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let f = &f;
        fan_out(self.all.iter().cloned(), |cluster| async move {
            cluster
                .for_each_shard(|shard| f(Arc::clone(&cluster), shard))
                .await
        })
        .await
    }

    pub async fn for_each_healthy_shard<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: Fn(Arc<Cluster>, Db) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let f = &f;
        let healthy = self.healthy();
        fan_out(healthy.iter().cloned(), |cluster| async move {
            cluster
                .for_each_healthy_shard(|shard| f(Arc::clone(&cluster), shard))
                .await
        })
        .await
    }

    pub async fn for_each_replica<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: Fn(Arc<Cluster>, Db) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let f = &f;
        fan_out(self.all.iter().cloned(), |cluster| async move {
            cluster
                .for_each_replica(|replica| f(Arc::clone(&cluster), replica))
                .await
        })
        .await
    }

    pub async fn for_each_healthy_replica<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: Fn(Arc<Cluster>, Db) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let f = &f;
        let healthy = self.healthy();
        fan_out(healthy.iter().cloned(), |cluster| async move {
            cluster
                .for_each_healthy_replica(|replica| f(Arc::clone(&cluster), replica))
                .await
        })
        .await
    }

    /// Recomputes the healthy snapshot from the clusters' own snapshots. The
    /// cluster monitors must run for it to change.
    pub fn refresh_health(&self) {
        let mut healthy = Clusters::select(&self.all.clusters, &self.live_weights(), true);
        if healthy.is_empty() {
            debug!("No cluster has a live replica, routing to all of them");
            healthy = Clusters::select(&self.all.clusters, &self.live_weights(), false);
        }
        self.healthy.store(Arc::new(healthy));
    }

    /// Weights of the clusters in `all`, which already skips zero weights.
    fn live_weights(&self) -> Vec<usize> {
        self.weights.iter().copied().filter(|&w| w > 0).collect()
    }

    /// Refreshes the healthy snapshot every [`MONITOR_INTERVAL`] until `stop`
    /// is cancelled.
    pub async fn monitor(&self, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
            }
            self.refresh_health();
        }
        debug!("Supercluster monitor stopped");
    }

    /// Spawns the monitors of all clusters and of the supercluster itself.
    pub fn spawn_monitors(self: &Arc<Self>, stop: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<_> = self
            .all
            .iter()
            .map(|cluster| cluster.spawn_monitor(stop.clone()))
            .collect();
        let supercluster = Arc::clone(self);
        handles.push(tokio::spawn(async move { supercluster.monitor(stop).await }));
        handles
    }
}
