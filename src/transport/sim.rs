//! In-process simulated network.
//!
//! Every node registers a [`Handler`] under its id; a [`SimTransport`]
//! delivers requests by invoking the destination's handler directly.
//! Links can be cut and healed at runtime to reproduce partitions: a call
//! across a cut link waits out its timeout and fails, a send is dropped.
//!
//! Handlers are held weakly so a node owning its transport does not keep
//! itself alive through the network.

use super::{BoxFuture, Handler, Transport};
use crate::error::{ReplicaError, Result};
use crate::protocol::Payload;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::trace;

struct NetworkInner {
    node_ids: Vec<String>,
    handlers: RwLock<HashMap<String, Weak<dyn Handler>>>,
    /// Cut links, stored with the lexically smaller id first.
    cut: RwLock<HashSet<(String, String)>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Shared handle to a simulated cluster network.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<NetworkInner>,
}

impl SimNetwork {
    /// Create a network whose cluster membership is `node_ids`.
    pub fn new<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Arc::new(NetworkInner {
                node_ids: node_ids.into_iter().map(Into::into).collect(),
                handlers: RwLock::new(HashMap::new()),
                cut: RwLock::new(HashSet::new()),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// A transport endpoint for `node_id`.
    pub fn transport(&self, node_id: impl Into<String>) -> SimTransport {
        SimTransport {
            node_id: node_id.into(),
            network: self.clone(),
        }
    }

    /// Route messages for `id` to `handler`. Services such as `lin-kv`
    /// register here too, under their service name.
    pub fn register(&self, id: impl Into<String>, handler: &Arc<dyn Handler>) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), Arc::downgrade(handler));
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn partition(&self, a: &str, b: &str) {
        self.inner
            .cut
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(link(a, b));
    }

    /// Cut every link between `node` and the other cluster members.
    pub fn isolate(&self, node: &str) {
        let others: Vec<String> = self
            .inner
            .node_ids
            .iter()
            .filter(|id| id.as_str() != node)
            .cloned()
            .collect();
        for other in others {
            self.partition(node, &other);
        }
    }

    /// Restore every link.
    pub fn heal(&self) {
        self.inner
            .cut
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Whether a message from `from` can currently reach `to`.
    pub fn reachable(&self, from: &str, to: &str) -> bool {
        !self
            .inner
            .cut
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&link(from, to))
    }

    /// Messages handed to a handler so far.
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Messages lost to cut links so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn handler(&self, id: &str) -> Option<Arc<dyn Handler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .and_then(Weak::upgrade)
    }
}

fn link(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// One node's endpoint on a [`SimNetwork`].
#[derive(Clone)]
pub struct SimTransport {
    node_id: String,
    network: SimNetwork,
}

impl SimTransport {
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }
}

impl Transport for SimTransport {
    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    fn node_ids(&self) -> Vec<String> {
        self.network.inner.node_ids.clone()
    }

    fn send(&self, dest: &str, payload: Payload) -> Result<()> {
        if !self.network.reachable(&self.node_id, dest) {
            self.network.inner.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(from = %self.node_id, to = %dest, kind = payload.kind(), "Send dropped by partition");
            return Ok(());
        }
        let Some(handler) = self.network.handler(dest) else {
            return Err(ReplicaError::transport(dest, "unknown node"));
        };
        let src = self.node_id.clone();
        let network = self.network.clone();
        tokio::spawn(async move {
            network.inner.delivered.fetch_add(1, Ordering::Relaxed);
            let _ = handler.handle(src, payload).await;
        });
        Ok(())
    }

    fn call(&self, dest: &str, payload: Payload, timeout: Duration) -> BoxFuture<'_, Payload> {
        let dest = dest.to_string();
        Box::pin(async move {
            if !self.network.reachable(&self.node_id, &dest) {
                self.network.inner.dropped.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(timeout).await;
                return Err(ReplicaError::timeout(&dest, timeout));
            }
            let handler = self
                .network
                .handler(&dest)
                .ok_or_else(|| ReplicaError::transport(&dest, "unknown node"))?;

            self.network.inner.delivered.fetch_add(1, Ordering::Relaxed);
            let outcome =
                tokio::time::timeout(timeout, handler.handle(self.node_id.clone(), payload)).await;

            match outcome {
                Err(_) => Err(ReplicaError::timeout(&dest, timeout)),
                // The link may have been cut while the request was in flight.
                Ok(_) if !self.network.reachable(&self.node_id, &dest) => {
                    Err(ReplicaError::timeout(&dest, timeout))
                }
                Ok(Ok(Some(reply))) => reply.into_result(&dest),
                Ok(Ok(None)) => Err(ReplicaError::transport(&dest, "no reply")),
                Ok(Err(e)) => Err(ReplicaError::Remote {
                    peer: dest.clone(),
                    code: e.error_code(),
                    text: e.to_string(),
                }),
            }
        })
    }
}
