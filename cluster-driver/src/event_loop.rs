//! What the driver needs from an event loop, and the tokio implementation of it.
//!
//! The core only spawns tasks, sleeps and resolves hostnames through
//! [`EventLoop`]. Socket readiness comes from the adapter's stream type, which
//! for the tokio backend is `tokio::net::TcpStream`.
//!
//! [`LoopPool`] runs a fixed number of single-threaded loops, one OS thread
//! each. A request is spawned on one loop and all its callbacks run there.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::Host;

pub trait EventLoop: Send + Sync + 'static {
    /// Runs `task` to completion on this loop.
    fn spawn(&self, task: BoxFuture<'static, ()>);

    /// Completes after `duration`. Dropping the future cancels the timer.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Resolves `host` to socket addresses without blocking the loop.
    fn resolve(&self, host: &Host) -> BoxFuture<'static, io::Result<Vec<SocketAddr>>>;
}

/// [`EventLoop`] backed by a tokio runtime handle.
#[derive(Clone)]
pub struct TokioLoop {
    handle: Handle,
    name: String,
}

impl TokioLoop {
    pub fn new(handle: Handle, name: impl Into<String>) -> Self {
        Self {
            handle,
            name: name.into(),
        }
    }

    /// Wraps the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current(), "current")
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for TokioLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioLoop").field("name", &self.name).finish()
    }
}

impl EventLoop for TokioLoop {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.handle.spawn(task);
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(async move { tokio::time::sleep(duration).await })
    }

    fn resolve(&self, host: &Host) -> BoxFuture<'static, io::Result<Vec<SocketAddr>>> {
        let target = (host.name.clone(), host.port);
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host(target).await?.collect();
            Ok(addrs)
        })
    }
}

struct LoopThread {
    shutdown: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

/// A fixed set of single-threaded event loops.
pub struct LoopPool {
    loops: Vec<Arc<TokioLoop>>,
    threads: Mutex<Vec<LoopThread>>,
    next: AtomicUsize,
}

impl LoopPool {
    /// Starts `n` loops (at least one), each on its own thread.
    pub fn new(n: usize) -> io::Result<Self> {
        let mut loops = Vec::with_capacity(n.max(1));
        let mut threads = Vec::with_capacity(n.max(1));

        for index in 0..n.max(1) {
            let runtime = Builder::new_current_thread().enable_all().build()?;
            let name = format!("event-loop-{index}");
            loops.push(Arc::new(TokioLoop::new(runtime.handle().clone(), name.clone())));

            let (shutdown, stopped) = oneshot::channel::<()>();
            let thread = thread::Builder::new().name(name).spawn(move || {
                runtime.block_on(async {
                    let _ = stopped.await;
                });
            })?;
            threads.push(LoopThread { shutdown, thread });
        }

        debug!(loops = loops.len(), "event loop pool started");
        Ok(Self {
            loops,
            threads: Mutex::new(threads),
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Every loop as a trait object, in index order.
    pub fn loops(&self) -> Vec<Arc<dyn EventLoop>> {
        self.loops
            .iter()
            .map(|l| Arc::clone(l) as Arc<dyn EventLoop>)
            .collect()
    }

    /// Round-robin pick.
    pub fn next(&self) -> Arc<dyn EventLoop> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[index]) as Arc<dyn EventLoop>
    }

    /// Stops every loop and joins its thread. Tasks still queued are dropped;
    /// requests among them complete with `ClusterClosed`.
    pub fn shutdown(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for LoopThread { shutdown, thread } in threads {
            let _ = shutdown.send(());
            if thread.join().is_err() {
                warn!("event loop thread panicked");
            }
        }
    }
}

impl Drop for LoopPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
