// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dissemination engine: getting broadcast values and counter deltas to
//! every peer.
//!
//! # Strategies
//!
//! | Strategy | On-path work | Failure handling |
//! |----------|--------------|------------------|
//! | `sync_fanout` | one attempt to every peer | logged, not retried |
//! | `async_retry` | none | per-peer worker retries until acked |
//! | `batched_async_retry` | none | as above, with size/time batch windows |
//! | `pull_backlog` | none | one attempt, then backlogged for the peer to pull |
//!
//! Counter deltas always travel through the retrying outboxes, whatever
//! the strategy: a lost delta would never be recovered otherwise.
//!
//! # Backlog pulls
//!
//! ```text
//! n1: broadcast(7) ──✗──▶ n2         (attempt failed)
//! n1: backlog[n2] = [7]
//! n2: read ──▶ req_failed_msg ──▶ n1
//! n1: take backlog[n2] ──▶ req_failed_msg_ok {messages: [7]} ──▶ n2 merges
//! ```

mod outbox;

pub use outbox::{run_outbox, GossipItem, Outbox};

use crate::batch::BatchConfig;
use crate::config::{DisseminationConfig, Strategy};
use crate::metrics;
use crate::protocol::{DeltaRecord, Payload, Values};
use crate::transport::Transport;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

type Backlog = Arc<RwLock<HashMap<String, Vec<i64>>>>;

/// Fans updates out to peers according to the configured strategy.
pub struct Disseminator {
    transport: Arc<dyn Transport>,
    config: DisseminationConfig,
    outboxes: RwLock<HashMap<String, Arc<Outbox>>>,
    /// Values each peer failed to receive from us, keyed by that peer.
    backlog: Backlog,
    shutdown_rx: watch::Receiver<bool>,
}

impl Disseminator {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: DisseminationConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            config,
            outboxes: RwLock::new(HashMap::new()),
            backlog: Arc::new(RwLock::new(HashMap::new())),
            shutdown_rx,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.config.strategy
    }

    /// Create one outbox per peer and spawn its worker.
    ///
    /// Must run after the node's identity is known.
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        let batch_config = if self.config.batching() {
            BatchConfig {
                max_batch_size: self.config.max_batch_size,
                max_batch_delay: self.config.max_batch_delay_duration(),
            }
        } else {
            BatchConfig::immediate()
        };
        let retry = self.config.retry_config();

        let mut outboxes = self.outboxes.write().await;
        let mut handles = Vec::new();
        for peer in self.transport.peers() {
            if outboxes.contains_key(&peer) {
                continue;
            }
            let outbox = Arc::new(Outbox::new(peer.clone(), batch_config.clone()));
            handles.push(tokio::spawn(run_outbox(
                Arc::clone(&outbox),
                Arc::clone(&self.transport),
                retry.clone(),
                self.shutdown_rx.clone(),
            )));
            outboxes.insert(peer, outbox);
        }

        info!(
            strategy = %self.config.strategy,
            peers = outboxes.len(),
            "Dissemination started"
        );
        handles
    }

    /// Disseminate a broadcast value that was new to this node.
    ///
    /// Only `sync_fanout` does network work before returning.
    pub async fn broadcast(&self, value: i64) {
        match self.config.strategy {
            Strategy::SyncFanout => self.fanout_once(value).await,
            Strategy::AsyncRetry | Strategy::BatchedAsyncRetry => {
                self.enqueue(GossipItem::Value(value)).await;
            }
            Strategy::PullBacklog => self.spawn_attempt_or_backlog(value),
        }
    }

    /// Queue a counter delta on every peer's retrying outbox.
    pub async fn gossip_delta(&self, record: DeltaRecord) {
        self.enqueue(GossipItem::Delta(record)).await;
    }

    /// Hand over (and forget) everything backlogged for `requester`.
    pub async fn take_backlog(&self, requester: &str) -> Vec<i64> {
        let taken = self
            .backlog
            .write()
            .await
            .remove(requester)
            .unwrap_or_default();
        if !taken.is_empty() {
            metrics::set_backlog_depth(requester, 0);
            debug!(peer_id = %requester, count = taken.len(), "Handing over backlog");
        }
        taken
    }

    /// Values currently backlogged for `peer`.
    pub async fn backlog_len(&self, peer: &str) -> usize {
        self.backlog.read().await.get(peer).map_or(0, Vec::len)
    }

    /// Ask every peer for the values it failed to deliver to us.
    ///
    /// Peers that do not answer within `backlog_timeout` are skipped; their
    /// backlog stays with them for the next pull.
    #[instrument(skip(self), fields(peers = self.transport.peers().len()))]
    pub async fn pull_backlogs(&self) -> Vec<i64> {
        let timeout = self.config.backlog_timeout_duration();
        let peers = self.transport.peers();
        let transport = self.transport.as_ref();

        let replies = join_all(peers.iter().map(|peer| async move {
            (peer, transport.call(peer, Payload::ReqFailedMsg, timeout).await)
        }))
        .await;

        let mut pulled = Vec::new();
        for (peer, reply) in replies {
            match reply {
                Ok(Payload::ReqFailedMsgOk { messages }) => {
                    metrics::record_backlog_pull(peer, messages.len(), true);
                    pulled.extend(messages);
                }
                Ok(other) => {
                    metrics::record_backlog_pull(peer, 0, false);
                    warn!(peer_id = %peer, kind = other.kind(), "Unexpected backlog reply");
                }
                Err(e) => {
                    metrics::record_backlog_pull(peer, 0, false);
                    debug!(peer_id = %peer, error = %e, "Backlog pull failed");
                }
            }
        }
        pulled
    }

    /// Updates queued but not yet taken by outbox workers, per peer.
    pub async fn queued(&self) -> HashMap<String, usize> {
        let outboxes: Vec<Arc<Outbox>> = self.outboxes.read().await.values().cloned().collect();
        let mut queued = HashMap::new();
        for outbox in outboxes {
            queued.insert(outbox.peer().to_string(), outbox.queued().await);
        }
        queued
    }

    async fn enqueue(&self, item: GossipItem) {
        let outboxes: Vec<Arc<Outbox>> = self.outboxes.read().await.values().cloned().collect();
        if outboxes.is_empty() && !self.transport.peers().is_empty() {
            warn!("Update queued before dissemination started, dropping");
            return;
        }
        for outbox in outboxes {
            outbox.push(item.clone()).await;
        }
    }

    async fn fanout_once(&self, value: i64) {
        let timeout = self.config.rpc_timeout_duration();
        let transport = self.transport.as_ref();
        let peers = self.transport.peers();

        let results = join_all(peers.iter().map(|peer| async move {
            let payload = Payload::Propagate {
                message: Values::One(value),
            };
            (peer, transport.call(peer, payload, timeout).await)
        }))
        .await;

        for (peer, result) in results {
            metrics::record_gossip_attempt(peer, "propagate", result.is_ok());
            if let Err(e) = result {
                debug!(peer_id = %peer, value, error = %e, "Fan-out attempt failed");
            }
        }
    }

    fn spawn_attempt_or_backlog(&self, value: i64) {
        let timeout = self.config.backlog_timeout_duration();
        let transport = Arc::clone(&self.transport);
        let backlog = Arc::clone(&self.backlog);

        tokio::spawn(async move {
            let peers = transport.peers();
            let results = join_all(peers.iter().map(|peer| {
                let transport = transport.as_ref();
                async move {
                    let payload = Payload::Propagate {
                        message: Values::One(value),
                    };
                    (peer, transport.call(peer, payload, timeout).await)
                }
            }))
            .await;

            let failed: Vec<&String> = results
                .into_iter()
                .filter_map(|(peer, result)| {
                    metrics::record_gossip_attempt(peer, "propagate", result.is_ok());
                    result.is_err().then_some(peer)
                })
                .collect();
            if failed.is_empty() {
                return;
            }

            let mut backlog = backlog.write().await;
            for peer in failed {
                let queue = backlog.entry(peer.clone()).or_default();
                queue.push(value);
                metrics::set_backlog_depth(peer, queue.len());
                debug!(peer_id = %peer, value, "Value backlogged");
            }
        });
    }
}
