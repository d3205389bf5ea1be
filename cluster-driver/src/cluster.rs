//! Cluster handle and the state shared by tending and in-flight requests.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, Host, ReadPolicy};
use crate::digest::{Digest, partition_id};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, TokioLoop};
use crate::node::Node;
use crate::partition::{PartitionTable, PartitionTables};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct ClusterState {
    pub(crate) config: ClusterConfig,
    pub(crate) nodes: RwLock<Vec<Arc<Node>>>,
    pub(crate) seeds: Mutex<Vec<Host>>,
    pub(crate) partitions: PartitionTables,
    pending: Mutex<VecDeque<oneshot::Sender<()>>>,
    loops: Vec<Arc<dyn EventLoop>>,
    next_loop: AtomicUsize,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    /// Serialises tend cycles between the background task and manual calls.
    pub(crate) tend_lock: tokio::sync::Mutex<()>,
}

impl ClusterState {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Loop that runs tending and hostname resolution.
    pub(crate) fn tend_loop(&self) -> &Arc<dyn EventLoop> {
        &self.loops[0]
    }

    pub(crate) fn next_loop(&self) -> Arc<dyn EventLoop> {
        let index = self.next_loop.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[index])
    }

    pub(crate) fn knows_addr(&self, addr: &std::net::SocketAddr) -> bool {
        self.nodes.read().iter().any(|node| node.has_addr(addr))
    }

    pub(crate) fn has_live_node(&self) -> bool {
        self.nodes.read().iter().any(|node| !node.is_dunned())
    }

    /// Picks the node for a request, avoiding dunned nodes and those in `tried`.
    pub(crate) fn route(
        &self,
        namespace: &str,
        digest: &Digest,
        is_write: bool,
        policy: ReadPolicy,
        tried: &[Arc<Node>],
    ) -> Option<Arc<Node>> {
        if let Some(n) = self.partitions.n_partitions() {
            let pid = partition_id(digest, n);
            if let Some(node) = self.partitions.get(namespace, pid, is_write, policy) {
                if !node.is_dunned() && !contains(tried, &node) {
                    return Some(node);
                }
            }
        }
        self.random_node(tried)
    }

    /// A random live node, preferring ones not in `tried`.
    pub(crate) fn random_node(&self, tried: &[Arc<Node>]) -> Option<Arc<Node>> {
        let nodes = self.nodes.read();
        let live: Vec<&Arc<Node>> = nodes.iter().filter(|node| !node.is_dunned()).collect();
        let untried: Vec<&Arc<Node>> = live
            .iter()
            .copied()
            .filter(|node| !contains(tried, node))
            .collect();
        let candidates = if untried.is_empty() { live } else { untried };
        candidates
            .choose(&mut rand::thread_rng())
            .map(|node| Arc::clone(node))
    }

    /// Parks a request until tending finds a node. `None` once the cluster is closed.
    pub(crate) fn enqueue_pending(&self) -> Option<oneshot::Receiver<()>> {
        let mut pending = self.pending.lock();
        if self.is_closed() {
            return None;
        }
        // Requests that timed out or were cancelled while parked left their sender behind.
        pending.retain(|waiter| !waiter.is_closed());
        let (tx, rx) = oneshot::channel();
        pending.push_back(tx);
        Some(rx)
    }

    /// Wakes every parked request if a live node exists.
    pub(crate) fn wake_pending(&self) -> usize {
        if !self.has_live_node() {
            return 0;
        }
        let waiters: Vec<_> = self.pending.lock().drain(..).collect();
        let mut woken = 0;
        for waiter in waiters {
            if waiter.send(()).is_ok() {
                woken += 1;
            }
        }
        woken
    }

    pub(crate) fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_request(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn contains(nodes: &[Arc<Node>], node: &Arc<Node>) -> bool {
    nodes.iter().any(|n| Arc::ptr_eq(n, node))
}

/// Handle to one cluster. Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct Cluster {
    pub(crate) state: Arc<ClusterState>,
}

impl Cluster {
    /// Creates the cluster and starts background tending on `loops[0]`.
    ///
    /// Requests are spread round-robin over `loops`. Nothing is contacted until
    /// the first tend cycle; call [`Cluster::tend`] to run one immediately.
    pub fn new(config: ClusterConfig, loops: Vec<Arc<dyn EventLoop>>) -> Result<Self> {
        if loops.is_empty() {
            return Err(Error::client("a cluster needs at least one event loop"));
        }
        let (shutdown, _) = watch::channel(false);
        let state = Arc::new(ClusterState {
            partitions: PartitionTables::new(config.replica_capacity),
            seeds: Mutex::new(config.seeds.clone()),
            config,
            nodes: RwLock::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            loops,
            next_loop: AtomicUsize::new(0),
            shutdown,
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            tend_lock: tokio::sync::Mutex::new(()),
        });

        let cluster = Self { state };
        cluster.start_tending();
        Ok(cluster)
    }

    /// Creates a cluster that runs everything on the caller's tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn on_current_runtime(config: ClusterConfig) -> Self {
        let tokio_loop: Arc<dyn EventLoop> = Arc::new(TokioLoop::current());
        match Self::new(config, vec![tokio_loop]) {
            Ok(cluster) => cluster,
            Err(_) => unreachable!("one loop was supplied"),
        }
    }

    /// Like [`Cluster::new`] followed by one tend cycle.
    pub async fn connect(config: ClusterConfig, loops: Vec<Arc<dyn EventLoop>>) -> Result<Self> {
        let cluster = Self::new(config, loops)?;
        cluster.tend().await;
        Ok(cluster)
    }

    fn start_tending(&self) {
        let weak: Weak<ClusterState> = Arc::downgrade(&self.state);
        let mut shutdown = self.state.shutdown.subscribe();
        let interval = self.state.config.tend_interval;
        let timers = Arc::clone(self.state.tend_loop());

        self.state.tend_loop().spawn(Box::pin(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = timers.sleep(interval) => {}
                }
                let Some(state) = weak.upgrade() else {
                    break;
                };
                state.tend().await;
            }
            debug!("tending stopped");
        }));
    }

    /// Runs one tend cycle now.
    pub async fn tend(&self) {
        self.state.tend().await;
    }

    /// Tends until a live node and the partition count are known.
    pub async fn wait_until_ready(&self, within: Duration) -> Result<()> {
        let deadline = Instant::now() + within;
        loop {
            self.tend().await;
            if self.is_closed() {
                return Err(Error::ClusterClosed);
            }
            if self.state.has_live_node() && self.n_partitions().is_some() {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::RoutingUnavailable);
            }
            self.state
                .tend_loop()
                .sleep(remaining.min(READY_POLL_INTERVAL))
                .await;
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.state.config
    }

    /// Adds a seed used the next time the node list is empty.
    pub fn add_seed(&self, host: Host) {
        let mut seeds = self.state.seeds.lock();
        if !seeds.contains(&host) {
            info!(seed = %host, "adding seed");
            seeds.push(host);
        }
    }

    pub fn seeds(&self) -> Vec<Host> {
        self.state.seeds.lock().clone()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.state.nodes.read().clone()
    }

    /// Names of every known node, sorted.
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .nodes
            .read()
            .iter()
            .map(|node| node.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.state
            .nodes
            .read()
            .iter()
            .find(|node| node.name() == name)
            .cloned()
    }

    pub fn n_partitions(&self) -> Option<u32> {
        self.state.partitions.n_partitions()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state.partitions.namespaces()
    }

    pub fn partition_table(&self, namespace: &str) -> Option<Arc<PartitionTable>> {
        self.state.partitions.table(namespace)
    }

    /// Node the routing table currently assigns to `digest`, ignoring health.
    pub fn partition_owner(&self, namespace: &str, digest: &Digest, is_write: bool) -> Option<Arc<Node>> {
        let n = self.state.partitions.n_partitions()?;
        self.state.partitions.get(
            namespace,
            partition_id(digest, n),
            is_write,
            self.state.config.read_policy,
        )
    }

    /// Requests parked waiting for a node.
    pub fn pending_len(&self) -> usize {
        let mut pending = self.state.pending.lock();
        pending.retain(|waiter| !waiter.is_closed());
        pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Whether two handles refer to the same cluster.
    pub fn same_cluster(&self, other: &Cluster) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Stops tending and releases every node.
    ///
    /// Parked requests complete with [`Error::ClusterClosed`]. Requests already
    /// talking to a node keep their own node reference and finish normally.
    pub fn close(&self) {
        let state = &self.state;
        if state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        state.shutdown.send_replace(true);

        let parked = std::mem::take(&mut *state.pending.lock()).len();
        let nodes = std::mem::take(&mut *state.nodes.write());
        for node in &nodes {
            node.close_idle();
        }
        state.partitions.clear();

        let in_flight = state.in_flight.load(Ordering::Acquire);
        if in_flight > 0 {
            warn!(in_flight, "cluster closed with requests still in flight");
        }
        info!(nodes = nodes.len(), parked, "cluster closed");
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.node_names())
            .field("n_partitions", &self.n_partitions())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::value::Value;

    fn config() -> ClusterConfig {
        ClusterConfig::new().with_tend_interval(Duration::from_secs(3600))
    }

    fn add_node(cluster: &Cluster, name: &str, port: u16) -> Arc<Node> {
        let node = Arc::new(Node::new(
            name,
            format!("127.0.0.1:{port}").parse().unwrap(),
            4,
            Duration::from_millis(100),
        ));
        cluster.state.nodes.write().push(Arc::clone(&node));
        node
    }

    #[tokio::test]
    async fn routing_uses_table_then_falls_back() {
        let cluster = Cluster::on_current_runtime(config());
        let a = add_node(&cluster, "A", 1);
        let b = add_node(&cluster, "B", 2);
        cluster.state.partitions.set_n_partitions(16);

        let digest = crate::digest::digest("s", &Value::from("k")).unwrap();
        let pid = partition_id(&digest, 16);
        cluster.state.partitions.set(&a, "test", pid, true);

        let routed = cluster.state.route("test", &digest, true, ReadPolicy::RoundRobin, &[]);
        assert!(Arc::ptr_eq(&routed.unwrap(), &a));

        let routed = cluster
            .state
            .route("test", &digest, true, ReadPolicy::RoundRobin, &[Arc::clone(&a)]);
        assert!(Arc::ptr_eq(&routed.unwrap(), &b));

        a.dun(crate::node::DunCause::InfoFail, 800);
        let routed = cluster.state.route("test", &digest, true, ReadPolicy::RoundRobin, &[]);
        assert!(Arc::ptr_eq(&routed.unwrap(), &b));
    }

    #[tokio::test]
    async fn no_live_node_routes_nowhere() {
        let cluster = Cluster::on_current_runtime(config());
        let digest = crate::digest::digest("s", &Value::from(1)).unwrap();
        assert!(
            cluster
                .state
                .route("test", &digest, false, ReadPolicy::RoundRobin, &[])
                .is_none()
        );
    }

    #[tokio::test]
    async fn close_fails_parked_requests_and_drops_nodes() {
        let cluster = Cluster::on_current_runtime(config());
        let node = add_node(&cluster, "A", 1);
        node.dun(crate::node::DunCause::BadName, 800);

        let parked = cluster.state.enqueue_pending().unwrap();
        assert_eq!(cluster.state.wake_pending(), 0);
        assert_eq!(cluster.pending_len(), 1);

        cluster.close();
        assert!(parked.await.is_err());
        assert!(cluster.nodes().is_empty());
        assert_eq!(Arc::strong_count(&node), 1);
        assert!(cluster.state.enqueue_pending().is_none());
    }

    #[tokio::test]
    async fn abandoned_waiters_do_not_pile_up() {
        let cluster = Cluster::on_current_runtime(config());
        for _ in 0..100 {
            drop(cluster.state.enqueue_pending().unwrap());
        }
        assert_eq!(cluster.state.pending.lock().len(), 1);

        let command = crate::wire::Command::get("test", "s", Value::from("k")).unwrap();
        for _ in 0..20 {
            let result = cluster
                .execute(
                    crate::request::SubmitArgs::from_command(&command, Duration::from_millis(5)),
                    crate::config::RequestPolicy::default(),
                    Duration::from_millis(5),
                )
                .await;
            assert!(matches!(result, Err(crate::error::Error::Timeout)));
        }
        assert!(cluster.state.pending.lock().len() <= 1);
    }

    #[tokio::test]
    async fn seeds_are_deduplicated() {
        let cluster = Cluster::on_current_runtime(config().with_seed(Host::new("db1", 3000)));
        cluster.add_seed(Host::new("db1", 3000));
        cluster.add_seed(Host::new("db2", 3000));
        assert_eq!(cluster.seeds().len(), 2);
    }
}
