#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use cluster_driver::wire::{
    PROTO_HEADER_LEN, ProtoHeader, Response, decode_command, encode_response, frame, info2,
    message_type,
};
use cluster_driver::{ClusterConfig, Digest, Value};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const NAMESPACE: &str = "test";

/// Result code the mock returns for a missing record.
pub const NOT_FOUND: u8 = 2;

/// Config for tests that drive tending by hand.
pub fn manual_config() -> ClusterConfig {
    ClusterConfig::new()
        .with_tend_interval(Duration::from_secs(3600))
        .with_node_tend_interval(Duration::ZERO)
        .with_replicas_min_interval(Duration::ZERO)
        .with_info_timeout(Duration::from_millis(500))
        .with_connect_timeout(Duration::from_millis(500))
}

#[derive(Default)]
struct Shared {
    info: Mutex<BTreeMap<String, String>>,
    records: Mutex<HashMap<Digest, BTreeMap<String, Value>>>,
    fail_info: AtomicBool,
    drop_commands: AtomicBool,
    status_override: AtomicU8,
    response_delay: Mutex<Option<Duration>>,
    commands: AtomicUsize,
    info_requests: AtomicUsize,
}

/// One in-process server that answers info and command requests.
pub struct MockNode {
    pub name: String,
    pub addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MockNode {
    pub async fn start(name: &str) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared::default());
        shared.info.lock().insert("node".into(), name.into());
        shared
            .info
            .lock()
            .insert("partition-generation".into(), "1".into());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            run_until(listener, server, shutdown).await;
        });

        Ok(Self {
            name: name.to_string(),
            addr,
            shared,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn set_info(&self, name: &str, value: impl Into<String>) {
        self.shared.info.lock().insert(name.to_string(), value.into());
    }

    /// Closes every info connection without answering.
    pub fn set_fail_info(&self, fail: bool) {
        self.shared.fail_info.store(fail, Ordering::Release);
    }

    /// Closes the socket as soon as a command arrives.
    pub fn set_drop_commands(&self, drop: bool) {
        self.shared.drop_commands.store(drop, Ordering::Release);
    }

    /// Answers every command with `code` (0 restores normal behaviour).
    pub fn set_status_override(&self, code: u8) {
        self.shared.status_override.store(code, Ordering::Release);
    }

    pub fn set_response_delay(&self, delay: Option<Duration>) {
        *self.shared.response_delay.lock() = delay;
    }

    pub fn commands(&self) -> usize {
        self.shared.commands.load(Ordering::Acquire)
    }

    pub fn info_requests(&self) -> usize {
        self.shared.info_requests.load(Ordering::Acquire)
    }

    pub fn record(&self, digest: &Digest) -> Option<BTreeMap<String, Value>> {
        self.shared.records.lock().get(digest).cloned()
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_until(
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    let mut connections = Vec::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let shared = Arc::clone(&shared);
                connections.push(tokio::spawn(serve(stream, shared)));
            }
        }
    }
    for connection in connections {
        connection.abort();
    }
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    loop {
        let mut header = [0u8; PROTO_HEADER_LEN];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let kind = header[1];
        let Ok(header) = ProtoHeader::decode(header, kind) else {
            return;
        };
        let mut body = vec![0u8; header.size as usize];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }

        let reply = match kind {
            message_type::INFO => {
                shared.info_requests.fetch_add(1, Ordering::AcqRel);
                if shared.fail_info.load(Ordering::Acquire) {
                    return;
                }
                answer_info(&shared, &body)
            }
            message_type::COMMAND => {
                shared.commands.fetch_add(1, Ordering::AcqRel);
                if shared.drop_commands.load(Ordering::Acquire) {
                    return;
                }
                let delay = *shared.response_delay.lock();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                match answer_command(&shared, &body) {
                    Some(reply) => reply,
                    None => return,
                }
            }
            _ => return,
        };
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn answer_info(shared: &Shared, body: &[u8]) -> bytes::Bytes {
    let info = shared.info.lock();
    let mut out = String::new();
    for name in String::from_utf8_lossy(body).split('\n').filter(|n| !n.is_empty()) {
        if let Some(value) = info.get(name) {
            out.push_str(name);
            out.push('\t');
            out.push_str(value);
            out.push('\n');
        }
    }
    frame(message_type::INFO, out.as_bytes())
}

fn answer_command(shared: &Shared, body: &[u8]) -> Option<bytes::Bytes> {
    let command = decode_command(body).ok()?;
    let digest = command.digest?;

    let status = shared.status_override.load(Ordering::Acquire);
    if status != 0 {
        return Some(encode_response(&Response {
            result_code: status,
            ..Default::default()
        }));
    }

    let mut records = shared.records.lock();
    let response = if command.header.info2 & info2::WRITE != 0 {
        let record = records.entry(digest).or_default();
        for (name, value) in command.bins {
            record.insert(name, value);
        }
        Response {
            generation: 1,
            ..Default::default()
        }
    } else {
        match records.get(&digest) {
            Some(bins) => Response {
                generation: 1,
                bins: bins.clone(),
                ..Default::default()
            },
            None => Response {
                result_code: NOT_FOUND,
                ..Default::default()
            },
        }
    };
    Some(encode_response(&response))
}

/// Several mock nodes that agree on one partition map.
///
/// Partition `p` is mastered by node `p % n` and replicated on node `(p + n - 1) % n`.
pub struct MockCluster {
    pub nodes: Vec<MockNode>,
    pub n_partitions: u32,
}

impl MockCluster {
    pub async fn start(names: &[&str], n_partitions: u32) -> Result<Self> {
        let mut nodes = Vec::with_capacity(names.len());
        for name in names {
            nodes.push(MockNode::start(name).await?);
        }

        let count = nodes.len() as u32;
        for (index, node) in nodes.iter().enumerate() {
            let index = index as u32;
            let owned = |offset: u32| {
                (0..n_partitions)
                    .filter(|pid| (pid + offset) % count == index)
                    .map(|pid| format!("{NAMESPACE}:{pid}"))
                    .collect::<Vec<_>>()
                    .join(";")
            };
            let services = nodes
                .iter()
                .filter(|peer| peer.addr != node.addr)
                .map(|peer| peer.addr.to_string())
                .collect::<Vec<_>>()
                .join(";");

            node.set_info("partitions", n_partitions.to_string());
            node.set_info("replicas-write", owned(0));
            node.set_info("replicas-read", owned(count - 1));
            node.set_info("services", services);
        }

        Ok(Self {
            nodes,
            n_partitions,
        })
    }

    pub fn node(&self, name: &str) -> &MockNode {
        self.nodes
            .iter()
            .find(|node| node.name == name)
            .unwrap_or_else(|| panic!("no mock node named {name}"))
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|node| node.addr).collect()
    }

    pub async fn stop(self) {
        for node in self.nodes {
            node.stop().await;
        }
    }
}
