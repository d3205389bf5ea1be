//! Plain configuration values consumed by the cluster and request engine.
//!
//! Loading these from files or flags is the application's job; the binary in
//! this crate maps its `clap` arguments onto [`ClusterConfig`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::Error;

/// Port used when a seed host omits one.
pub const DEFAULT_PORT: u16 = 3000;

/// Score above which a node is considered dead.
pub const DEFAULT_DUN_THRESHOLD: u32 = 800;

/// A seed host as configured by the application: a hostname or IP literal plus a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Host {
    pub name: String,
    pub port: u16,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.contains(':') {
            write!(f, "[{}]:{}", self.name, self.port)
        } else {
            write!(f, "{}:{}", self.name, self.port)
        }
    }
}

impl FromStr for Host {
    type Err = Error;

    /// Parses `host`, `host:port`, `[v6]` or `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::client("empty host"));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (name, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::client(format!("unterminated IPv6 literal in '{s}'")))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, s)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(Error::client(format!("invalid host '{s}'"))),
            };
            return Ok(Host::new(name, port));
        }

        match s.rsplit_once(':') {
            // A bare IPv6 literal has several colons and no port.
            Some((name, _)) if name.contains(':') => Ok(Host::new(s, DEFAULT_PORT)),
            Some((name, port)) => Ok(Host::new(name, parse_port(port, s)?)),
            None => Ok(Host::new(s, DEFAULT_PORT)),
        }
    }
}

fn parse_port(port: &str, whole: &str) -> Result<u16, Error> {
    port.parse()
        .map_err(|_| Error::client(format!("invalid port in '{whole}'")))
}

/// Which replica serves a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ReadPolicy {
    /// Reads always go to the partition master.
    MasterOnly,
    /// Reads rotate over the partition's replica set.
    #[default]
    RoundRobin,
}

/// What to do when the socket fails mid-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum WritePolicy {
    /// Fail the request immediately with a connection error.
    OneShot,
    /// Restart on another node while the deadline allows.
    #[default]
    Retry,
}

/// Per-request knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestPolicy {
    pub read: ReadPolicy,
    pub write: WritePolicy,
}

impl RequestPolicy {
    pub fn with_read_policy(mut self, read: ReadPolicy) -> Self {
        self.read = read;
        self
    }

    pub fn with_write_policy(mut self, write: WritePolicy) -> Self {
        self.write = write;
        self
    }
}

/// Cluster-wide configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Hosts used to bootstrap the topology while no node is known.
    pub seeds: Vec<Host>,
    /// Cluster-wide tending period.
    pub tend_interval: Duration,
    /// Minimum time between two info checks of the same node.
    pub node_tend_interval: Duration,
    /// Minimum time between two replica fetches from the same node.
    pub replicas_min_interval: Duration,
    /// Deadline for one info exchange.
    pub info_timeout: Duration,
    /// Deadline for one TCP connect attempt.
    pub connect_timeout: Duration,
    /// Idle connections kept per node; extra connections are closed on release.
    pub max_conns_per_node: usize,
    /// Dun score above which a node is removed from routing.
    pub dun_threshold: u32,
    /// Replicas remembered per partition slot.
    pub replica_capacity: usize,
    /// Default read routing for requests that do not override it.
    pub read_policy: ReadPolicy,
    /// Consecutive connection failures tolerated before giving up on acquisition.
    pub max_connect_retries: u32,
    /// Deadline used by the convenience `get`/`put` helpers.
    pub default_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            tend_interval: Duration::from_millis(1200),
            node_tend_interval: Duration::from_secs(1),
            replicas_min_interval: Duration::from_secs(1),
            info_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            max_conns_per_node: 300,
            dun_threshold: DEFAULT_DUN_THRESHOLD,
            replica_capacity: 3,
            read_policy: ReadPolicy::RoundRobin,
            max_connect_retries: 3,
            default_timeout: Duration::from_secs(1),
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, host: Host) -> Self {
        self.seeds.push(host);
        self
    }

    pub fn with_tend_interval(mut self, interval: Duration) -> Self {
        self.tend_interval = interval;
        self
    }

    pub fn with_node_tend_interval(mut self, interval: Duration) -> Self {
        self.node_tend_interval = interval;
        self
    }

    pub fn with_replicas_min_interval(mut self, interval: Duration) -> Self {
        self.replicas_min_interval = interval;
        self
    }

    pub fn with_info_timeout(mut self, timeout: Duration) -> Self {
        self.info_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_conns_per_node(mut self, n: usize) -> Self {
        self.max_conns_per_node = n;
        self
    }

    pub fn with_dun_threshold(mut self, threshold: u32) -> Self {
        self.dun_threshold = threshold;
        self
    }

    pub fn with_replica_capacity(mut self, capacity: usize) -> Self {
        self.replica_capacity = capacity;
        self
    }

    pub fn with_read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    pub fn with_max_connect_retries(mut self, retries: u32) -> Self {
        self.max_connect_retries = retries;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}
