//! Tending: keeps the node list and partition tables in step with the servers.
//!
//! One cycle sweeps dunned nodes, resolves seeds while no node is known, ticks
//! every node whose own interval elapsed and finally wakes parked requests.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::ClusterState;
use crate::config::Host;
use crate::error::{Error, Result};
use crate::info::{self, InfoResponse};
use crate::node::{DunCause, InfoState, Node};

const CHECK_NAMES: &str = "node\npartition-generation\nservices";

/// Newly discovered peers are ticked in the same cycle, one level deep.
const DISCOVERY_ROUNDS: usize = 2;

impl ClusterState {
    pub(crate) async fn tend(&self) {
        let _cycle = self.tend_lock.lock().await;
        if self.is_closed() {
            return;
        }

        let removed = self.sweep_dunned();

        let no_nodes = self.nodes.read().is_empty();
        if no_nodes {
            self.resolve_seeds().await;
        }

        for _ in 0..DISCOVERY_ROUNDS {
            let peers = self.tick_due_nodes().await;
            if self.intake_hosts(&peers).await == 0 {
                break;
            }
        }

        let woken = self.wake_pending();
        let nodes = self.nodes.read().len();
        debug!(nodes, removed, woken, "tend cycle complete");
    }

    /// Drops dunned nodes from the routing tables and the node list.
    fn sweep_dunned(&self) -> usize {
        let removed: Vec<Arc<Node>> = {
            let mut nodes = self.nodes.write();
            let (dunned, live): (Vec<_>, Vec<_>) =
                nodes.drain(..).partition(|node| node.is_dunned());
            *nodes = live;
            dunned
        };

        for node in &removed {
            let slots = self.partitions.remove_node(node);
            node.close_idle();
            info!(node = %node.name(), slots, score = node.dun_score(), "removed dunned node");
        }
        removed.len()
    }

    async fn resolve_seeds(&self) {
        let seeds = self.seeds.lock().clone();
        if seeds.is_empty() {
            warn!("no nodes known and no seeds configured");
            return;
        }

        let mut addrs = Vec::new();
        for seed in &seeds {
            addrs.extend(self.resolve_host(seed).await);
        }
        let added = self.intake(addrs).await;
        debug!(seeds = seeds.len(), added, "seed resolution complete");
    }

    async fn resolve_host(&self, host: &Host) -> Vec<SocketAddr> {
        if let Ok(ip) = host.name.parse::<IpAddr>() {
            return vec![SocketAddr::new(ip, host.port)];
        }
        match self.tend_loop().resolve(host).await {
            Ok(addrs) => addrs,
            Err(err) => {
                warn!(host = %host, error = ?err, "failed to resolve host");
                Vec::new()
            }
        }
    }

    async fn intake_hosts(&self, hosts: &[Host]) -> usize {
        let mut addrs = Vec::new();
        for host in hosts {
            addrs.extend(self.resolve_host(host).await);
        }
        self.intake(addrs).await
    }

    /// Probes each unknown address and registers the node behind it.
    ///
    /// Returns the number of nodes created.
    async fn intake(&self, addrs: Vec<SocketAddr>) -> usize {
        let mut fresh: Vec<SocketAddr> = Vec::new();
        for addr in addrs {
            if !fresh.contains(&addr) && !self.knows_addr(&addr) {
                fresh.push(addr);
            }
        }
        if fresh.is_empty() || self.is_closed() {
            return 0;
        }

        let names = if self.partitions.n_partitions().is_some() {
            "node"
        } else {
            "node\npartitions"
        };
        let timeout = self.config.info_timeout;
        let probes = fresh.iter().map(|&addr| async move {
            (addr, info::request(addr, names, timeout).await)
        });

        let mut added = 0;
        for (addr, result) in join_all(probes).await {
            match result.and_then(|response| self.admit(addr, &response)) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(err) => debug!(%addr, error = %err, "address probe failed"),
            }
        }
        added
    }

    /// Attaches `addr` to the node it reported, creating the node if new.
    fn admit(&self, addr: SocketAddr, response: &InfoResponse) -> Result<bool> {
        let name = response.require("node")?.trim();
        if name.is_empty() {
            return Err(Error::protocol("empty node name"));
        }
        if let Some(value) = response.get("partitions") {
            self.learn_partition_count(value)?;
        }
        if self.is_closed() {
            return Ok(false);
        }

        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.iter().find(|node| node.name() == name) {
            if node.add_addr(addr) {
                debug!(node = %name, %addr, "added address to known node");
            }
            return Ok(false);
        }

        nodes.push(Arc::new(Node::new(
            name,
            addr,
            self.config.max_conns_per_node,
            self.config.connect_timeout,
        )));
        info!(node = %name, %addr, "discovered node");
        Ok(true)
    }

    fn learn_partition_count(&self, value: &str) -> Result<()> {
        let n: u32 = info::parse_number("partitions", value)?;
        if self.partitions.set_n_partitions(n) {
            info!(n_partitions = n, "learned partition count");
        }
        Ok(())
    }

    /// Ticks every live node that is due. Returns the peers they advertised.
    async fn tick_due_nodes(&self) -> Vec<Host> {
        let now = Instant::now();
        let interval = self.config.node_tend_interval;
        let due: Vec<Arc<Node>> = self
            .nodes
            .read()
            .iter()
            .filter(|node| !node.is_dunned() && node.try_begin_check(interval, now))
            .cloned()
            .collect();

        let mut peers: Vec<Host> = Vec::new();
        for host in join_all(due.iter().map(|node| self.tick_node(node)))
            .await
            .into_iter()
            .flatten()
        {
            if !peers.contains(&host) {
                peers.push(host);
            }
        }
        peers
    }

    async fn tick_node(&self, node: &Arc<Node>) -> Vec<Host> {
        let peers = match self.check_node(node).await {
            Ok(peers) => peers,
            Err((cause, err)) => {
                warn!(node = %node.name(), ?cause, error = %err, "node check failed");
                node.dun(cause, self.config.dun_threshold);
                Vec::new()
            }
        };
        node.set_info_state(InfoState::Idle);
        peers
    }

    async fn check_node(&self, node: &Arc<Node>) -> std::result::Result<Vec<Host>, (DunCause, Error)> {
        let fail = |err: Error| (DunCause::InfoFail, err);

        let addr = node
            .primary_addr()
            .ok_or_else(|| fail(Error::Connection("node has no address".to_string())))?;
        let response = info::request(addr, CHECK_NAMES, self.config.info_timeout)
            .await
            .map_err(fail)?;

        let name = response.require("node").map_err(fail)?.trim();
        if name != node.name() {
            return Err((
                DunCause::BadName,
                Error::protocol(format!("expected node {}, got {name}", node.name())),
            ));
        }
        node.ok();

        let generation: u64 = response
            .require("partition-generation")
            .and_then(|value| info::parse_number("partition-generation", value))
            .map_err(fail)?;
        if node.partition_generation() != Some(generation)
            && node.try_begin_replicas_fetch(self.config.replicas_min_interval, Instant::now())
        {
            node.set_info_state(InfoState::FetchingReplicas);
            let applied = self
                .fetch_replicas(node, addr)
                .await
                .map_err(|err| (DunCause::ReplicasFetch, err))?;
            node.set_partition_generation(generation);
            debug!(node = %node.name(), generation, applied, "partition map refreshed");
        }

        let peers = match response.get("services") {
            Some(value) => info::parse_services(value).unwrap_or_else(|err| {
                debug!(node = %node.name(), error = %err, "ignoring bad services list");
                Vec::new()
            }),
            None => Vec::new(),
        };
        Ok(peers)
    }

    /// Pulls the node's replica lists and applies them. Returns slots changed.
    async fn fetch_replicas(&self, node: &Arc<Node>, addr: SocketAddr) -> Result<usize> {
        let mut names = String::from("replicas-read\nreplicas-write");
        if self.partitions.n_partitions().is_none() {
            names.push_str("\npartitions");
        }
        let response = info::request(addr, &names, self.config.info_timeout).await?;
        if let Some(value) = response.get("partitions") {
            self.learn_partition_count(value)?;
        }
        let n_partitions = self
            .partitions
            .n_partitions()
            .ok_or_else(|| Error::protocol("partition count unknown"))?;

        let reads = info::parse_replicas(response.require("replicas-read")?)?;
        let writes = info::parse_replicas(response.require("replicas-write")?)?;

        let mut applied = 0;
        let entries = reads
            .iter()
            .map(|entry| (entry, false))
            .chain(writes.iter().map(|entry| (entry, true)));
        for ((namespace, pid), is_write) in entries {
            if *pid >= n_partitions {
                debug!(node = %node.name(), namespace, pid, "partition id out of range");
                continue;
            }
            if self.partitions.set(node, namespace, *pid, is_write) {
                applied += 1;
            }
        }
        node.ok();
        Ok(applied)
    }
}
