//! One server process as seen by the client.
//!
//! A [`Node`] is shared as `Arc<Node>` by the cluster's node list, by every
//! partition slot that routes to it and by every in-flight request that picked
//! it. Health is tracked with atomics because requests on every loop thread
//! report into it; the idle connection pool is a bounded lock-free queue.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Generation value meaning "never fetched".
const UNKNOWN_GENERATION: u64 = u64::MAX;

/// Why a node is being penalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DunCause {
    /// The node answered with a different name than the one we registered.
    BadName,
    /// An info exchange with the node failed.
    InfoFail,
    /// Fetching the replica lists failed.
    ReplicasFetch,
    /// The node sent a response we could not parse.
    BadResponse,
    /// Connecting to the node failed.
    NetworkError,
    /// A socket broke in the middle of a request.
    RestartFd,
    /// A user request ran out of time on this node.
    UserTimeout,
}

impl DunCause {
    /// Score added for one occurrence of this cause.
    ///
    /// Control-plane failures weigh enough to cross the default threshold on
    /// their own; user timeouts only accumulate.
    pub const fn weight(self) -> u32 {
        match self {
            DunCause::BadName => 1000,
            DunCause::InfoFail => 1000,
            DunCause::ReplicasFetch => 1000,
            DunCause::BadResponse => 1000,
            DunCause::NetworkError => 50,
            DunCause::RestartFd => 50,
            DunCause::UserTimeout => 1,
        }
    }
}

/// What the tender is currently asking this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoState {
    Idle,
    Checking,
    FetchingReplicas,
}

/// A pooled TCP connection to one node.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Checks an idle connection without blocking.
    ///
    /// The peek only completes if the socket is already readable: zero bytes
    /// means the remote closed, any bytes mean a stray response we cannot
    /// attribute, and an error means the socket is broken. A pending peek is
    /// the healthy case.
    fn is_live(&self) -> bool {
        let mut buf = [0u8; 1];
        match self.stream.peek(&mut buf).now_or_never() {
            None => true,
            Some(Ok(0)) => false,
            Some(Ok(_)) => false,
            Some(Err(err)) => err.kind() == io::ErrorKind::WouldBlock,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("local", &self.stream.local_addr().ok())
            .finish()
    }
}

/// One server in the cluster: its addresses, health and idle connections.
///
/// Shared as `Arc<Node>` by the node list, partition tables and in-flight requests.
pub struct Node {
    name: String,
    addrs: Mutex<Vec<SocketAddr>>,
    successes: AtomicU64,
    failures: AtomicU64,
    dun_score: AtomicU32,
    dunned: AtomicBool,
    partition_generation: AtomicU64,
    pool: ArrayQueue<Connection>,
    connect_timeout: Duration,
    info_state: Mutex<InfoState>,
    last_tended: Mutex<Option<Instant>>,
    last_replicas_fetch: Mutex<Option<Instant>>,
}

impl Node {
    /// A node reachable at `addr` keeping at most `max_conns` idle connections.
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        max_conns: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            addrs: Mutex::new(vec![addr]),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            dun_score: AtomicU32::new(0),
            dunned: AtomicBool::new(false),
            partition_generation: AtomicU64::new(UNKNOWN_GENERATION),
            pool: ArrayQueue::new(max_conns.max(1)),
            connect_timeout,
            info_state: Mutex::new(InfoState::Idle),
            last_tended: Mutex::new(None),
            last_replicas_fetch: Mutex::new(None),
        }
    }

    /// Name the server reports for itself.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every address this node is known by, in discovery order.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.addrs.lock().clone()
    }

    pub fn has_addr(&self, addr: &SocketAddr) -> bool {
        self.addrs.lock().contains(addr)
    }

    /// Records another address for this node. Returns false if it was known.
    pub fn add_addr(&self, addr: SocketAddr) -> bool {
        let mut addrs = self.addrs.lock();
        if addrs.contains(&addr) {
            return false;
        }
        addrs.push(addr);
        true
    }

    /// Address used for control-plane (info) exchanges.
    pub fn primary_addr(&self) -> Option<SocketAddr> {
        self.addrs.lock().first().copied()
    }

    /// Hands out an exclusive connection, reusing an idle one when it is still live.
    pub async fn acquire_connection(&self) -> Result<Connection> {
        while let Some(conn) = self.pool.pop() {
            if conn.is_live() {
                return Ok(conn);
            }
            debug!(node = %self.name, peer = %conn.peer, "discarding stale pooled connection");
        }
        self.open_connection().await
    }

    /// Returns a connection to the idle pool, closing it if the pool is full.
    pub fn release_connection(&self, conn: Connection) {
        if let Err(conn) = self.pool.push(conn) {
            debug!(node = %self.name, peer = %conn.peer, "pool full, closing connection");
        }
    }

    /// Connections waiting in the pool.
    pub fn idle_connections(&self) -> usize {
        self.pool.len()
    }

    /// Closes every idle connection.
    pub fn close_idle(&self) {
        while self.pool.pop().is_some() {}
    }

    async fn open_connection(&self) -> Result<Connection> {
        let addrs = self.addrs();
        let mut last_error = None;
        for addr in addrs {
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(node = %self.name, error = ?err, "failed to set TCP_NODELAY");
                    }
                    return Ok(Connection { stream, peer: addr });
                }
                Ok(Err(err)) => {
                    debug!(node = %self.name, %addr, error = ?err, "connect failed");
                    last_error = Some(err.to_string());
                }
                Err(_) => {
                    debug!(node = %self.name, %addr, "connect timed out");
                    last_error = Some(format!("connect to {addr} timed out"));
                }
            }
        }
        Err(Error::Connection(format!(
            "no reachable address for node {}: {}",
            self.name,
            last_error.unwrap_or_else(|| "no addresses".to_string())
        )))
    }

    /// Counts a successful exchange without touching the dun score.
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed exchange without touching the dun score.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Adds the weight of `cause` to the dun score and returns that weight.
    pub fn score_failure(&self, cause: DunCause) -> u32 {
        let weight = cause.weight();
        // fetch_update only fails when the closure returns None, which it never does.
        let _ = self
            .dun_score
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |score| {
                Some(score.saturating_add(weight))
            });
        debug!(node = %self.name, ?cause, weight, "scored node failure");
        weight
    }

    /// Marks the node dunned once its score exceeds `threshold`.
    pub fn maybe_dun(&self, threshold: u32) -> bool {
        if self.dun_score() > threshold && !self.dunned.swap(true, Ordering::AcqRel) {
            warn!(node = %self.name, score = self.dun_score(), "node dunned");
        }
        self.is_dunned()
    }

    /// Records a failure, scores it and dunns the node if needed.
    pub fn dun(&self, cause: DunCause, threshold: u32) -> bool {
        self.record_failure();
        self.score_failure(cause);
        self.maybe_dun(threshold)
    }

    /// A successful exchange clears the accumulated score.
    pub fn ok(&self) {
        self.record_success();
        self.dun_score.store(0, Ordering::Release);
    }

    /// Weighted failures since the last success.
    pub fn dun_score(&self) -> u32 {
        self.dun_score.load(Ordering::Acquire)
    }

    /// Dunned nodes take no new requests and are removed on the next tend.
    pub fn is_dunned(&self) -> bool {
        self.dunned.load(Ordering::Acquire)
    }

    /// Last `partition-generation` seen, `None` before the first check.
    pub fn partition_generation(&self) -> Option<u64> {
        match self.partition_generation.load(Ordering::Acquire) {
            UNKNOWN_GENERATION => None,
            generation => Some(generation),
        }
    }

    pub fn set_partition_generation(&self, generation: u64) {
        self.partition_generation.store(generation, Ordering::Release);
    }

    /// Where the node is in its tend check.
    pub fn info_state(&self) -> InfoState {
        *self.info_state.lock()
    }

    pub(crate) fn set_info_state(&self, state: InfoState) {
        *self.info_state.lock() = state;
    }

    /// Moves the node from `Idle` to `Checking` if its tend interval elapsed.
    pub(crate) fn try_begin_check(&self, interval: Duration, now: Instant) -> bool {
        let mut state = self.info_state.lock();
        if *state != InfoState::Idle {
            return false;
        }
        let mut last = self.last_tended.lock();
        if last.is_some_and(|at| now.saturating_duration_since(at) < interval) {
            return false;
        }
        *last = Some(now);
        *state = InfoState::Checking;
        true
    }

    /// Whether a replica fetch is allowed now; records the attempt if so.
    pub(crate) fn try_begin_replicas_fetch(&self, min_interval: Duration, now: Instant) -> bool {
        let mut last = self.last_replicas_fetch.lock();
        if last.is_some_and(|at| now.saturating_duration_since(at) < min_interval) {
            return false;
        }
        *last = Some(now);
        true
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("addrs", &*self.addrs.lock())
            .field("dun_score", &self.dun_score())
            .field("dunned", &self.is_dunned())
            .finish()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        debug!(node = %self.name, "node released");
    }
}
