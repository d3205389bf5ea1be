//! Asynchronous client driver for a partitioned key-value cluster.
//!
//! The driver learns the cluster's shape by itself: given one or more seed
//! hosts it discovers every node, learns which node owns each partition and
//! routes single-record commands straight to the owner.
//!
//! - [`digest`] hashes keys and maps digests to partitions.
//! - [`partition`] holds per-namespace routing tables.
//! - [`node`] tracks one server: addresses, health score and a connection pool.
//! - [`cluster`] is the application-facing handle; tending lives in `tend`.
//! - [`request`] is the per-request state machine.
//! - [`info`] and [`wire`] implement the text control protocol and the binary
//!   command protocol.
//! - [`event_loop`] is the boundary to the async runtime.
//! - [`registry`] lets an application shut down every cluster it opened.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod digest;
pub mod error;
pub mod event_loop;
pub mod info;
pub mod node;
pub mod partition;
pub mod registry;
pub mod request;
mod tend;
pub mod value;
pub mod wire;

pub use cluster::Cluster;
pub use config::{ClusterConfig, Host, ReadPolicy, RequestPolicy, WritePolicy};
pub use digest::{Digest, digest, partition_id};
pub use error::{Error, Result, ResultCode};
pub use event_loop::{EventLoop, LoopPool, TokioLoop};
pub use registry::ClusterRegistry;
pub use request::{RequestHandle, State, SubmitArgs};
pub use value::Value;
pub use wire::{Command, Response};
