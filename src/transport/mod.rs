// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inter-node messaging.
//!
//! The replica core never touches stdio or sockets directly. It talks to
//! other nodes (and to the store services) through [`Transport`], and it
//! receives requests through [`Handler`]. Two implementations exist:
//!
//! - [`StdioTransport`]: the process transport, one JSON line per message
//! - [`SimNetwork`]: an in-process network with partitions, for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use gossip_replica::protocol::Payload;
//! use gossip_replica::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example(transport: &dyn Transport) -> gossip_replica::Result<()> {
//! for peer in transport.peers() {
//!     let reply = transport
//!         .call(&peer, Payload::Propagate { message: 7.into() }, Duration::from_millis(200))
//!         .await?;
//!     assert_eq!(reply, Payload::PropagateOk);
//! }
//! # Ok(())
//! # }
//! ```

mod sim;
mod stdio;

pub use sim::{SimNetwork, SimTransport};
pub use stdio::StdioTransport;

use crate::error::Result;
use crate::protocol::Payload;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Message delivery between nodes.
///
/// A `call` delivers one request and waits for at most one reply. An
/// `error` reply comes back as `Err(ReplicaError::Remote)`; a missing
/// reply as `Err(ReplicaError::Timeout)`.
pub trait Transport: Send + Sync + 'static {
    /// This node's id. Empty until `init` has been processed.
    fn node_id(&self) -> String;

    /// Every node id in the cluster, in the order given at `init`.
    fn node_ids(&self) -> Vec<String>;

    /// Every node id except this one.
    fn peers(&self) -> Vec<String> {
        let me = self.node_id();
        self.node_ids().into_iter().filter(|id| *id != me).collect()
    }

    /// Fire-and-forget delivery. No reply is expected or awaited.
    fn send(&self, dest: &str, payload: Payload) -> Result<()>;

    /// Request/reply with a caller-supplied timeout.
    fn call(&self, dest: &str, payload: Payload, timeout: Duration) -> BoxFuture<'_, Payload>;
}

/// Receiver side of the transport: answers one inbound request.
///
/// Returning `Ok(None)` means the request kind has no reply (gossip
/// notifications); `Err` is turned into an `error` body by the caller.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, src: String, payload: Payload) -> BoxFuture<'_, Option<Payload>>;
}
