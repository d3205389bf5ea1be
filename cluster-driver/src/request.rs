//! The request engine.
//!
//! A submitted request runs as one task on one event loop. It walks an explicit
//! state machine:
//!
//! ```text
//! Init -> AcquiringNode -> AcquiringConnection -> Sending -> ReadingHeader -> ReadingBody -> Done
//!              ^                   |                 |            |               |
//!              +-------------------+-----------------+------------+---------------+  (restart)
//! ```
//!
//! The deadline timer and the cancel signal race the state machine. Whichever
//! wins decides the outcome and the callback fires exactly once.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::cluster::{Cluster, ClusterState};
use crate::config::{RequestPolicy, WritePolicy};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::node::{Connection, DunCause, Node};
use crate::value::Value;
use crate::wire::{
    Command, MSG_HEADER_LEN, PROTO_HEADER_LEN, ProtoHeader, Response, decode_response, message_type,
};

/// Completion callback. Called exactly once per submitted request.
pub type Callback = Box<dyn FnOnce(Result<Response>) + Send + 'static>;

/// What the engine needs to route and send one command.
#[derive(Debug, Clone)]
pub struct SubmitArgs {
    /// Fully framed command, proto header included.
    pub buffer: Bytes,
    pub digest: Digest,
    pub namespace: String,
    pub is_write: bool,
}

impl SubmitArgs {
    pub fn from_command(command: &Command, timeout: Duration) -> Self {
        Self {
            buffer: command.compile(timeout),
            digest: command.digest(),
            namespace: command.namespace().to_string(),
            is_write: command.is_write(),
        }
    }
}

/// Lets the submitter abandon a request.
#[derive(Debug)]
pub struct RequestHandle {
    cancel: Option<oneshot::Sender<()>>,
}

impl RequestHandle {
    fn completed() -> Self {
        Self { cancel: None }
    }

    /// Completes the request with [`Error::Cancelled`] unless it already finished.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Whether the request has already completed.
    pub fn is_finished(&self) -> bool {
        self.cancel.as_ref().is_none_or(|cancel| cancel.is_closed())
    }
}

/// Where a request is in its lifecycle. Logged with every timeout and cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Validating the submitted buffer.
    Init,
    /// Picking a node, or parked until tending finds one.
    AcquiringNode,
    /// Taking a pooled connection or opening a new one.
    AcquiringConnection,
    Sending,
    ReadingHeader,
    ReadingBody,
    /// A response was decoded; the connection is back in the pool.
    Done,
}

/// Owns the callback of one in-flight request.
///
/// Dropping it unfired completes the request with [`Error::ClusterClosed`], which
/// covers a request task dropped by its loop shutting down.
struct Completion {
    cluster: Arc<ClusterState>,
    callback: Option<Callback>,
}

impl Completion {
    fn new(cluster: Arc<ClusterState>, callback: Callback) -> Self {
        cluster.begin_request();
        Self {
            cluster,
            callback: Some(callback),
        }
    }

    fn complete(mut self, result: Result<Response>) {
        self.fire(result);
    }

    fn fire(&mut self, result: Result<Response>) {
        if let Some(callback) = self.callback.take() {
            self.cluster.end_request();
            callback(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.callback.is_some() {
            debug!("request dropped by its event loop");
            self.fire(Err(Error::ClusterClosed));
        }
    }
}

enum Outcome {
    Finished(Result<Response>),
    TimedOut,
    Cancelled,
}

struct Request {
    cluster: Arc<ClusterState>,
    buffer: Bytes,
    digest: Digest,
    namespace: String,
    is_write: bool,
    policy: RequestPolicy,
    deadline: Instant,
    state: State,
    node: Option<Arc<Node>>,
    conn: Option<Connection>,
    tried: Vec<Arc<Node>>,
    attempts: u32,
    connect_failures: u32,
    write_cursor: usize,
    header: [u8; PROTO_HEADER_LEN],
    header_cursor: usize,
    body: Vec<u8>,
    body_cursor: usize,
    response: Option<Result<Response>>,
}

impl Request {
    fn new(cluster: Arc<ClusterState>, args: SubmitArgs, policy: RequestPolicy, deadline: Instant) -> Self {
        Self {
            cluster,
            buffer: args.buffer,
            digest: args.digest,
            namespace: args.namespace,
            is_write: args.is_write,
            policy,
            deadline,
            state: State::Init,
            node: None,
            conn: None,
            tried: Vec::new(),
            attempts: 0,
            connect_failures: 0,
            write_cursor: 0,
            header: [0; PROTO_HEADER_LEN],
            header_cursor: 0,
            body: Vec::new(),
            body_cursor: 0,
            response: None,
        }
    }

    fn threshold(&self) -> u32 {
        self.cluster.config.dun_threshold
    }

    async fn run(
        mut self,
        timer: futures::future::BoxFuture<'static, ()>,
        mut cancel: oneshot::Receiver<()>,
        completion: Completion,
    ) {
        // A response already decoded in the same wake-up as the timer wins.
        let outcome = tokio::select! {
            biased;
            Ok(()) = &mut cancel => Outcome::Cancelled,
            result = self.drive() => Outcome::Finished(result),
            _ = timer => Outcome::TimedOut,
        };

        let result = match outcome {
            Outcome::Finished(result) => result,
            Outcome::TimedOut => {
                if let Some(node) = &self.node {
                    node.dun(DunCause::UserTimeout, self.threshold());
                }
                self.conn = None;
                debug!(namespace = %self.namespace, state = ?self.state, attempts = self.attempts, "request timed out");
                Err(Error::Timeout)
            }
            Outcome::Cancelled => {
                self.conn = None;
                debug!(namespace = %self.namespace, state = ?self.state, "request cancelled");
                Err(Error::Cancelled)
            }
        };

        completion.complete(result);
    }

    async fn drive(&mut self) -> Result<Response> {
        while self.state != State::Done {
            self.state = self.step().await?;
        }
        self.response
            .take()
            .unwrap_or_else(|| Err(Error::protocol("request finished without a response")))
    }

    /// Performs the work of the current state and returns the next one.
    async fn step(&mut self) -> Result<State> {
        match self.state {
            State::Init => self.init(),
            State::AcquiringNode => self.acquire_node().await,
            State::AcquiringConnection => self.acquire_connection().await,
            State::Sending => self.send().await,
            State::ReadingHeader => self.read_header().await,
            State::ReadingBody => self.read_body().await,
            State::Done => Ok(State::Done),
        }
    }

    fn init(&mut self) -> Result<State> {
        if self.buffer.len() < PROTO_HEADER_LEN + MSG_HEADER_LEN {
            return Err(Error::client("command buffer is shorter than its headers"));
        }
        if self.namespace.is_empty() {
            return Err(Error::client("namespace must not be empty"));
        }
        Ok(State::AcquiringNode)
    }

    async fn acquire_node(&mut self) -> Result<State> {
        self.attempts += 1;
        loop {
            if let Some(node) = self.cluster.route(
                &self.namespace,
                &self.digest,
                self.is_write,
                self.policy.read,
                &self.tried,
            ) {
                debug!(node = %node.name(), attempt = self.attempts, "request routed");
                self.node = Some(node);
                return Ok(State::AcquiringConnection);
            }

            let wakeup = self.cluster.enqueue_pending().ok_or(Error::ClusterClosed)?;
            debug!(namespace = %self.namespace, "no node available, request parked");
            wakeup.await.map_err(|_| Error::ClusterClosed)?;
        }
    }

    async fn acquire_connection(&mut self) -> Result<State> {
        let Some(node) = self.node.clone() else {
            return Ok(State::AcquiringNode);
        };
        match node.acquire_connection().await {
            Ok(conn) => {
                self.conn = Some(conn);
                self.connect_failures = 0;
                self.write_cursor = 0;
                self.header_cursor = 0;
                self.body_cursor = 0;
                Ok(State::Sending)
            }
            Err(err) => {
                node.dun(DunCause::NetworkError, self.threshold());
                self.forget_node();
                self.connect_failures += 1;
                if self.connect_failures > self.cluster.config.max_connect_retries {
                    return Err(err);
                }
                debug!(error = %err, failures = self.connect_failures, "connect failed, rerouting");
                Ok(State::AcquiringNode)
            }
        }
    }

    async fn send(&mut self) -> Result<State> {
        let result = match self.conn.as_ref() {
            Some(conn) => flush(conn.stream(), &self.buffer, &mut self.write_cursor).await,
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };
        match result {
            Ok(()) => Ok(State::ReadingHeader),
            Err(err) => self.restart(err),
        }
    }

    async fn read_header(&mut self) -> Result<State> {
        let result = match self.conn.as_ref() {
            Some(conn) => fill(conn.stream(), &mut self.header, &mut self.header_cursor).await,
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };
        if let Err(err) = result {
            return self.restart(err);
        }

        let header = match ProtoHeader::decode(self.header, message_type::COMMAND) {
            Ok(header) => header,
            Err(err) => return self.bad_response(err),
        };
        self.body.clear();
        self.body.resize(header.size as usize, 0);
        self.body_cursor = 0;
        Ok(State::ReadingBody)
    }

    async fn read_body(&mut self) -> Result<State> {
        let result = match self.conn.as_ref() {
            Some(conn) => fill(conn.stream(), &mut self.body, &mut self.body_cursor).await,
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };
        if let Err(err) = result {
            return self.restart(err);
        }

        let response = match decode_response(&self.body) {
            Ok(response) => response,
            Err(err) => return self.bad_response(err),
        };

        if let (Some(node), Some(conn)) = (self.node.as_ref(), self.conn.take()) {
            node.release_connection(conn);
            node.ok();
        }
        self.response = Some(match response.result_code {
            0 => Ok(response),
            code => Err(Error::ServerStatus(code)),
        });
        Ok(State::Done)
    }

    /// Abandons the connection after a socket failure and reroutes if allowed.
    fn restart(&mut self, err: io::Error) -> Result<State> {
        self.conn = None;
        if let Some(node) = &self.node {
            node.dun(DunCause::RestartFd, self.threshold());
            debug!(node = %node.name(), error = %err, "socket failed mid-request");
        }
        self.forget_node();

        if self.policy.write == WritePolicy::OneShot {
            return Err(err.into());
        }
        if Instant::now() >= self.deadline {
            return Err(Error::Timeout);
        }
        Ok(State::AcquiringNode)
    }

    fn bad_response(&mut self, err: Error) -> Result<State> {
        self.conn = None;
        if let Some(node) = &self.node {
            node.dun(DunCause::BadResponse, self.threshold());
        }
        Err(err)
    }

    fn forget_node(&mut self) {
        if let Some(node) = self.node.take() {
            if !self.tried.iter().any(|tried| Arc::ptr_eq(tried, &node)) {
                self.tried.push(node);
            }
        }
    }
}

async fn flush(stream: &TcpStream, buf: &[u8], cursor: &mut usize) -> io::Result<()> {
    while *cursor < buf.len() {
        stream.writable().await?;
        match stream.try_write(&buf[*cursor..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => *cursor += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

async fn fill(stream: &TcpStream, buf: &mut [u8], cursor: &mut usize) -> io::Result<()> {
    while *cursor < buf.len() {
        stream.readable().await?;
        match stream.try_read(&mut buf[*cursor..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => *cursor += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

impl Cluster {
    /// Starts a request and returns immediately.
    ///
    /// `callback` runs exactly once on the loop the request was assigned to,
    /// or inline when the cluster is already closed.
    pub fn submit<F>(
        &self,
        args: SubmitArgs,
        policy: RequestPolicy,
        timeout: Duration,
        callback: F,
    ) -> RequestHandle
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        if self.state.is_closed() {
            callback(Err(Error::ClusterClosed));
            return RequestHandle::completed();
        }

        let deadline = Instant::now() + timeout;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let event_loop = self.state.next_loop();
        let timer = event_loop.sleep(timeout);
        let request = Request::new(Arc::clone(&self.state), args, policy, deadline);
        let completion = Completion::new(Arc::clone(&self.state), Box::new(callback));

        event_loop.spawn(Box::pin(request.run(timer, cancel_rx, completion)));
        RequestHandle {
            cancel: Some(cancel_tx),
        }
    }

    /// Submits and waits for the result.
    pub async fn execute(&self, args: SubmitArgs, policy: RequestPolicy, timeout: Duration) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        let _handle = self.submit(args, policy, timeout, move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| Error::ClusterClosed)?
    }

    /// Runs `command` with the configured read policy and default timeout.
    pub async fn run_command(&self, command: &Command) -> Result<Response> {
        let timeout = self.state.config.default_timeout;
        let policy = RequestPolicy::default().with_read_policy(self.state.config.read_policy);
        self.execute(SubmitArgs::from_command(command, timeout), policy, timeout)
            .await
    }

    /// Reads every bin of one record.
    pub async fn get(&self, namespace: &str, set: &str, key: impl Into<Value>) -> Result<Response> {
        let command = Command::get(namespace, set, key.into())?;
        self.run_command(&command).await
    }

    /// Writes `bins` to one record.
    pub async fn put(
        &self,
        namespace: &str,
        set: &str,
        key: impl Into<Value>,
        bins: Vec<(String, Value)>,
    ) -> Result<Response> {
        let command = Command::put(namespace, set, key.into(), bins)?;
        self.run_command(&command).await
    }
}
