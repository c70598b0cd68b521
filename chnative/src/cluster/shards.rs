use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::health::{ErrorCounter, HealthCheck, ServerHealthCheck, ERROR_THRESHOLD, ERROR_WINDOW};
use super::{fan_out, MONITOR_INTERVAL};
use crate::client::{Context, Db};
use crate::errors::{ConnectionPoolError, HealthCheckError, QueryError};

struct ClusterReplica {
    db: Db,
    errors: ErrorCounter,
}

/// Replicas that currently serve traffic. Replaced as a whole on every
/// monitor tick.
#[derive(Debug)]
struct HealthySet {
    shards: Vec<Vec<Db>>,
    replicas: Vec<Db>,
    /// Replicas that passed their last check, as opposed to the fallback lists of
    /// shards with no passing replica.
    live: usize,
}

/// A fixed set of shards, each holding one or more replicas of the same data.
///
/// Replicas within a shard are ordered primaries first; a backup replica
/// (see [`DbBuilder::backup`](crate::DbBuilder::backup)) only serves traffic
/// when no primary of its shard is healthy.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use chnative::{DbBuilder, cluster::Cluster};
/// # use tokio_util::sync::CancellationToken;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let shard1 = vec![DbBuilder::new().addr("ch-1a:9000").build()?, DbBuilder::new().addr("ch-1b:9000").build()?];
/// let shard2 = vec![DbBuilder::new().addr("ch-2a:9000").build()?];
/// let cluster = Arc::new(Cluster::new(0, vec![shard1, shard2]));
///
/// let stop = CancellationToken::new();
/// cluster.spawn_monitor(stop.clone());
/// let db = cluster.replica(42);
/// # Ok(())
/// # }
/// ```
pub struct Cluster {
    id: usize,
    shards: Vec<Vec<Db>>,
    replicas: Vec<Db>,
    all_replicas: Vec<Vec<ClusterReplica>>,
    healthy: ArcSwap<HealthySet>,
    last_error: ArcSwapOption<HealthCheckError>,
    next_replica: AtomicUsize,
    health_check: Arc<dyn HealthCheck>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addrs = |replicas: &[Db]| replicas.iter().map(|db| db.addr().to_owned()).collect::<Vec<_>>();
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("shards", &self.shards.iter().map(|s| addrs(s)).collect::<Vec<_>>())
            .field("healthy", &addrs(&self.healthy.load().replicas))
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Creates a cluster checked by [`ServerHealthCheck`].
    ///
    /// # Panics
    ///
    /// Panics when `shards` is empty or one of the shards has no replica.
    pub fn new(id: usize, shards: Vec<Vec<Db>>) -> Cluster {
        let mut shards = shards;
        assert!(!shards.is_empty(), "a cluster requires at least one replica");
        if let Some(empty) = shards.iter().position(Vec::is_empty) {
            panic!("shard {empty} of cluster {id} has no replica");
        }
        for shard in &mut shards {
            // Stable: primaries keep their relative order.
            shard.sort_by_key(|db| db.config().is_backup);
        }
        let replicas: Vec<Db> = shards.iter().flatten().cloned().collect();
        let all_replicas = shards
            .iter()
            .map(|shard| {
                shard
                    .iter()
                    .map(|db| ClusterReplica {
                        db: db.clone(),
                        errors: ErrorCounter::new(ERROR_WINDOW, ERROR_THRESHOLD),
                    })
                    .collect()
            })
            .collect();
        let healthy = HealthySet {
            shards: shards.clone(),
            replicas: replicas.clone(),
            live: replicas.len(),
        };
        Cluster {
            id,
            shards,
            replicas,
            all_replicas,
            healthy: ArcSwap::from_pointee(healthy),
            last_error: ArcSwapOption::empty(),
            next_replica: AtomicUsize::new(0),
            health_check: Arc::new(ServerHealthCheck::default()),
        }
    }

    /// Replaces the probe run by the monitor.
    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Cluster {
        self.health_check = check;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Every replica of every shard, healthy or not.
    pub fn replicas(&self) -> &[Db] {
        &self.replicas
    }

    /// The first replica of each shard.
    pub fn shards(&self) -> impl Iterator<Item = &Db> {
        self.shards.iter().filter_map(|shard| shard.first())
    }

    /// Replicas currently serving traffic. Never empty: a shard with no healthy
    /// replica contributes all of its replicas.
    pub fn healthy_replicas(&self) -> Vec<Db> {
        self.healthy.load().replicas.clone()
    }

    /// The first healthy replica of each shard.
    pub fn healthy_shards(&self) -> Vec<Db> {
        self.healthy
            .load()
            .shards
            .iter()
            .filter_map(|shard| shard.first().cloned())
            .collect()
    }

    /// Whether at least one replica passed its last health check.
    pub fn has_live_replicas(&self) -> bool {
        self.healthy.load().live > 0
    }

    /// A healthy replica chosen by `client_id`, so the same client keeps landing
    /// on the same replica while the healthy set does not change.
    pub fn replica(&self, client_id: u64) -> Db {
        let healthy = self.healthy.load();
        let idx = (client_id % healthy.replicas.len() as u64) as usize;
        healthy.replicas[idx].clone()
    }

    /// Healthy replicas in turn.
    pub fn rand_replica(&self) -> Db {
        let healthy = self.healthy.load();
        if healthy.replicas.len() == 1 {
            return healthy.replicas[0].clone();
        }
        let i = self.next_replica.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        healthy.replicas[i % healthy.replicas.len()].clone()
    }

    /// Runs `f` on the first replica of every shard concurrently. Waits for all
    /// of them and returns the first error.
    pub async fn for_each_shard<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: FnMut(Db) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        fan_out(self.shards().cloned(), f).await
    }

    /// Like [`for_each_shard`](Self::for_each_shard), on the first healthy
    /// replica of every shard.
    pub async fn for_each_healthy_shard<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: FnMut(Db) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        fan_out(self.healthy_shards(), f).await
    }

    pub async fn for_each_replica<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: FnMut(Db) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        fan_out(self.replicas.iter().cloned(), f).await
    }

    pub async fn for_each_healthy_replica<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: FnMut(Db) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        fan_out(self.healthy_replicas(), f).await
    }

    /// The error of the last replica taken out of rotation by the latest
    /// monitor tick, if any.
    pub fn check_health(&self) -> Result<(), HealthCheckError> {
        match self.last_error.load_full() {
            Some(err) => Err((*err).clone()),
            None => Ok(()),
        }
    }

    /// Refreshes the healthy snapshot every [`MONITOR_INTERVAL`] until `stop`
    /// is cancelled.
    pub async fn monitor(&self, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
            }
            let ctx = Context::with_cancellation(stop.child_token());
            self.refresh_health(&ctx).await;
        }
        debug!("Cluster {} monitor stopped", self.id);
    }

    /// Spawns [`monitor`](Self::monitor) on the current runtime.
    pub fn spawn_monitor(self: &Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let cluster = Arc::clone(self);
        tokio::spawn(async move { cluster.monitor(stop).await })
    }

    /// Checks every replica once and swaps in the new healthy snapshot.
    ///
    /// A failing replica stays in rotation until its failures within the error
    /// window reach the threshold, and returns as soon as it passes again. A
    /// shard with no replica left keeps all of its replicas.
    pub async fn refresh_health(&self, ctx: &Context) {
        let checks = self
            .all_replicas
            .iter()
            .flatten()
            .map(|replica| self.health_check.check(ctx, &replica.db));
        let mut results = join_all(checks).await.into_iter();

        let mut last_error = None;
        let mut live = 0;
        let mut healthy_shards = Vec::with_capacity(self.shards.len());
        for (shard, fallback) in self.all_replicas.iter().zip(&self.shards) {
            let mut healthy: Vec<Db> = Vec::with_capacity(shard.len());
            for (replica, res) in shard.iter().zip(results.by_ref()) {
                let tripped = replica.errors.record(res.is_err());
                if let Err(err) = res {
                    if is_closed(&err) {
                        trace!("[{}] Replica is closed", replica.db.addr());
                    } else if tripped {
                        warn!("Replica is unhealthy: {}", err);
                    } else {
                        debug!("Replica failed a health check: {}", err);
                    }
                    if tripped {
                        last_error = Some(err);
                        continue;
                    }
                }
                live += 1;
                if replica.db.config().is_backup && !healthy.is_empty() {
                    continue;
                }
                healthy.push(replica.db.clone());
            }
            if healthy.is_empty() {
                healthy = fallback.clone();
            }
            healthy_shards.push(healthy);
        }

        let replicas = healthy_shards.iter().flatten().cloned().collect();
        self.healthy.store(Arc::new(HealthySet {
            shards: healthy_shards,
            replicas,
            live,
        }));
        self.last_error.store(last_error.map(Arc::new));
    }
}

fn is_closed(err: &HealthCheckError) -> bool {
    matches!(
        err,
        HealthCheckError::Unreachable {
            source: QueryError::ConnectionPoolError(ConnectionPoolError::Closed),
            ..
        }
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::Config;
    use crate::utils::test_utils::{setup_tracing, test_connection_config, MockDialer, MockServer};
    use assert_matches::assert_matches;
    use chnative_proto::column::TypeRegistry;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails the replicas whose address is in the set.
    #[derive(Debug, Default)]
    pub(crate) struct FailingCheck {
        failing: Mutex<HashSet<String>>,
    }

    impl FailingCheck {
        pub(crate) fn fail(&self, addr: &str) {
            self.failing.lock().unwrap().insert(addr.to_owned());
        }

        pub(crate) fn recover(&self, addr: &str) {
            self.failing.lock().unwrap().remove(addr);
        }
    }

    #[async_trait::async_trait]
    impl HealthCheck for FailingCheck {
        async fn check(&self, _ctx: &Context, replica: &Db) -> Result<(), HealthCheckError> {
            if self.failing.lock().unwrap().contains(replica.addr()) {
                return Err(HealthCheckError::ReplicationQueue {
                    addr: replica.addr().to_owned(),
                    len: 5000,
                });
            }
            Ok(())
        }
    }

    pub(crate) fn replica(addr: &str, is_backup: bool) -> Db {
        let config = Config {
            addr: addr.to_owned(),
            is_backup,
            ..Config::default()
        };
        let dialer = Arc::new(MockDialer::new(MockServer::new(), test_connection_config()));
        Db::with_dialer(config, Arc::new(TypeRegistry::new()), dialer)
    }

    fn addrs(replicas: &[Db]) -> Vec<&str> {
        replicas.iter().map(|db| db.addr()).collect()
    }

    fn two_shards(check: &Arc<FailingCheck>) -> Cluster {
        Cluster::new(
            1,
            vec![
                vec![replica("b1", true), replica("a1", false), replica("a2", false)],
                vec![replica("c1", false)],
            ],
        )
        .with_health_check(check.clone())
    }

    async fn tick(cluster: &Cluster, times: usize) {
        for _ in 0..times {
            cluster.refresh_health(&Context::background()).await;
        }
    }

    #[tokio::test]
    async fn backups_are_ordered_last_and_serve_only_as_fallback() {
        setup_tracing();
        let check = Arc::new(FailingCheck::default());
        let cluster = two_shards(&check);
        assert_eq!(addrs(cluster.replicas()), ["a1", "a2", "b1", "c1"]);
        assert_eq!(
            cluster.shards().map(|db| db.addr()).collect::<Vec<_>>(),
            ["a1", "c1"]
        );

        tick(&cluster, 1).await;
        assert_eq!(addrs(&cluster.healthy_replicas()), ["a1", "a2", "c1"]);

        check.fail("a1");
        check.fail("a2");
        tick(&cluster, ERROR_THRESHOLD).await;
        assert_eq!(addrs(&cluster.healthy_replicas()), ["b1", "c1"]);
        assert_eq!(addrs(&cluster.healthy_shards()), ["b1", "c1"]);
    }

    #[tokio::test]
    async fn replica_is_excluded_after_threshold_failures_and_readmitted() {
        setup_tracing();
        let check = Arc::new(FailingCheck::default());
        let cluster = two_shards(&check);

        check.fail("a2");
        tick(&cluster, ERROR_THRESHOLD - 1).await;
        assert_eq!(addrs(&cluster.healthy_replicas()), ["a1", "a2", "c1"]);
        cluster.check_health().unwrap();

        tick(&cluster, 1).await;
        assert_eq!(addrs(&cluster.healthy_replicas()), ["a1", "c1"]);
        assert_matches!(
            cluster.check_health(),
            Err(HealthCheckError::ReplicationQueue { ref addr, .. }) if addr == "a2"
        );

        check.recover("a2");
        tick(&cluster, 1).await;
        assert_eq!(addrs(&cluster.healthy_replicas()), ["a1", "a2", "c1"]);
        cluster.check_health().unwrap();
    }

    #[tokio::test]
    async fn shard_without_healthy_replicas_keeps_its_last_known_list() {
        setup_tracing();
        let check = Arc::new(FailingCheck::default());
        let cluster = two_shards(&check);

        check.fail("c1");
        tick(&cluster, ERROR_THRESHOLD).await;
        assert_eq!(addrs(&cluster.healthy_replicas()), ["a1", "a2", "c1"]);
        assert!(cluster.has_live_replicas());

        for addr in ["a1", "a2", "b1"] {
            check.fail(addr);
        }
        tick(&cluster, ERROR_THRESHOLD).await;
        assert_eq!(addrs(&cluster.healthy_replicas()), ["a1", "a2", "b1", "c1"]);
        assert!(!cluster.has_live_replicas());
        assert!(cluster.check_health().is_err());
    }

    #[tokio::test]
    async fn replica_selection() {
        let check = Arc::new(FailingCheck::default());
        let cluster = two_shards(&check);
        tick(&cluster, 1).await;

        assert_eq!(cluster.replica(0).addr(), "a1");
        assert_eq!(cluster.replica(4).addr(), "a2");
        assert_eq!(cluster.replica(2).addr(), cluster.replica(5).addr());

        let picked: HashSet<String> = (0..6)
            .map(|_| cluster.rand_replica().addr().to_owned())
            .collect();
        assert_eq!(picked.len(), 3);

        let single = Cluster::new(2, vec![vec![replica("only", false)]]);
        assert_eq!(single.rand_replica().addr(), "only");
    }

    #[tokio::test]
    async fn fan_out_visits_every_target_and_returns_an_error() {
        let check = Arc::new(FailingCheck::default());
        let cluster = two_shards(&check);
        let visited = Mutex::new(Vec::new());

        let res = cluster
            .for_each_replica(|db| {
                let visited = &visited;
                async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    visited.lock().unwrap().push(db.addr().to_owned());
                    if db.addr() == "a2" {
                        return Err(db.addr().to_owned());
                    }
                    Ok(())
                }
            })
            .await;
        assert_eq!(res, Err("a2".to_owned()));
        assert_eq!(visited.lock().unwrap().len(), 4);

        let shards = Mutex::new(Vec::new());
        cluster
            .for_each_shard(|db| {
                shards.lock().unwrap().push(db.addr().to_owned());
                async { Ok::<_, ()>(()) }
            })
            .await
            .unwrap();
        assert_eq!(*shards.lock().unwrap(), ["a1", "c1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_runs_until_stopped() {
        setup_tracing();
        let check = Arc::new(FailingCheck::default());
        let cluster = Arc::new(two_shards(&check));
        check.fail("c1");
        check.fail("a1");

        let stop = CancellationToken::new();
        let handle = cluster.spawn_monitor(stop.clone());
        tokio::time::sleep(MONITOR_INTERVAL * (ERROR_THRESHOLD as u32 + 1)).await;
        assert_eq!(addrs(&cluster.healthy_replicas()), ["a2", "c1"]);

        stop.cancel();
        handle.await.unwrap();
    }

    #[test]
    #[should_panic(expected = "at least one replica")]
    fn cluster_needs_a_replica() {
        Cluster::new(0, Vec::new());
    }

    #[test]
    #[should_panic(expected = "shard 1 of cluster 3 has no replica")]
    fn empty_shards_are_rejected() {
        Cluster::new(3, vec![vec![replica("a1", false)], vec![]]);
    }
}
