//! HTTP transport for flocons nodes: the server that fronts a node's
//! storage engine and the client used both for cross-node redirects and
//! for talking to a node from outside the cluster.

pub mod client;
pub mod server;
pub mod util;

pub use client::Client;
pub use server::{HttpServer, WORKER_POOL_SIZE};
