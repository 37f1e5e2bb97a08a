// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated per-key append-only log.
//!
//! # Append path
//!
//! ```text
//! send(key, msg)
//!   ├─▶ allocate offset (authority memory, or claim owner_<key>_<offset>)
//!   ├─▶ store (offset, msg) locally
//!   ├─▶ reply send_ok {offset}
//!   └─▶ background:
//!         ├─▶ send window ──▶ gossip_send to every peer
//!         └─▶ concurrently:
//!               ├─▶ seq-kv   entry_<key>_<offset> = msg
//!               └─▶ lin-kv   latest_<key> = max(latest, offset + 1)
//! ```
//!
//! Commits follow the same shape: raise the local marker, reply, gossip the
//! commit, then CAS `commit_<key>` in the linearizable store.
//!
//! Store writes retry until they land, so they never hold up gossip.
//!
//! Gossip here is fire-and-forget. A lost `gossip_send` leaves a peer
//! without the entry until a later batch or the durable copy covers it;
//! `poll` only answers from memory.

pub mod allocator;
pub mod state;

pub use allocator::{authority_for, latest_key, DistributedCas, SingleAuthority};
pub use state::{KeyLog, LogState};

use crate::batch::{BatchConfig, SharedBatchWindow};
use crate::config::{AllocatorKind, LogConfig};
use crate::error::{ReplicaError, Result};
use crate::merge::merge_counter_max;
use crate::protocol::{CommitRecord, LogRecord, Payload};
use crate::resilience::RetryConfig;
use crate::store::{cas_update, write_with_retry, KvStore};
use crate::transport::Transport;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Store key of one log entry.
pub fn entry_key(key: &str, offset: u64) -> String {
    format!("entry_{}_{}", key, offset)
}

/// Store key of a key's committed offset.
pub fn commit_key(key: &str) -> String {
    format!("commit_{}", key)
}

enum Allocator {
    SingleAuthority(SingleAuthority),
    DistributedCas(DistributedCas),
}

/// The log replica for one node.
pub struct CommitLog {
    transport: Arc<dyn Transport>,
    seq_kv: Arc<dyn KvStore>,
    lin_kv: Arc<dyn KvStore>,
    config: LogConfig,
    state: LogState,
    allocator: Allocator,
    send_window: SharedBatchWindow<LogRecord>,
    commit_window: SharedBatchWindow<CommitRecord>,
    shutdown_rx: watch::Receiver<bool>,
}

impl CommitLog {
    pub fn new(
        transport: Arc<dyn Transport>,
        seq_kv: Arc<dyn KvStore>,
        lin_kv: Arc<dyn KvStore>,
        config: LogConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let retry = RetryConfig::store(config.store_timeout_duration());
        let allocator = match config.allocator {
            AllocatorKind::SingleAuthority => {
                Allocator::SingleAuthority(SingleAuthority::new(Arc::clone(&lin_kv)))
            }
            AllocatorKind::DistributedCas => Allocator::DistributedCas(DistributedCas::new(
                Arc::clone(&lin_kv),
                retry,
                transport.node_id(),
            )),
        };
        let window = BatchConfig {
            max_batch_size: config.max_batch_size,
            max_batch_delay: config.max_batch_delay_duration(),
        };

        Self {
            transport,
            seq_kv,
            lin_kv,
            state: LogState::new(),
            allocator,
            send_window: SharedBatchWindow::new(window.clone()),
            commit_window: SharedBatchWindow::new(window),
            config,
            shutdown_rx,
        }
    }

    pub fn state(&self) -> &LogState {
        &self.state
    }

    /// Append `msg` to `key` and return its offset.
    ///
    /// `src` is the requester; under the single-authority allocator a
    /// request from a client to a non-authority node is forwarded, while a
    /// request from another cluster node is always served locally.
    pub async fn append(self: &Arc<Self>, src: &str, key: &str, msg: i64) -> Result<u64> {
        let offset = match &self.allocator {
            Allocator::DistributedCas(allocator) => {
                let mut shutdown = self.shutdown_rx.clone();
                let offset = allocator.allocate(key, &mut shutdown).await?;
                self.state.merge(key, [(offset, msg)]).await;
                offset
            }
            Allocator::SingleAuthority(allocator) => {
                let node_ids = self.transport.node_ids();
                let me = self.transport.node_id();
                let authority = authority_for(key, &node_ids).unwrap_or(me.as_str()).to_string();
                let from_peer = node_ids.iter().any(|id| id == src);

                if authority != me && !from_peer {
                    let offset = self.forward(&authority, key, msg).await?;
                    self.state.merge(key, [(offset, msg)]).await;
                    return Ok(offset);
                }

                let floor = self.state.next_offset(key).await;
                let reservation = allocator.reserve(key, floor).await;
                self.state.merge(key, [(reservation.offset, msg)]).await;
                reservation.offset
            }
        };

        debug!(key = %key, offset, msg, "Appended");
        let this = Arc::clone(self);
        let record = LogRecord {
            key: key.to_string(),
            offset,
            msg,
        };
        tokio::spawn(async move { this.after_append(record).await });
        Ok(offset)
    }

    /// Merge entries gossiped by a peer.
    pub async fn apply_gossip_send(&self, batch: Vec<LogRecord>) -> usize {
        let mut by_key: BTreeMap<String, Vec<(u64, i64)>> = BTreeMap::new();
        for record in batch {
            by_key
                .entry(record.key)
                .or_default()
                .push((record.offset, record.msg));
        }
        let mut inserted = 0;
        for (key, entries) in by_key {
            inserted += self.state.merge(&key, entries).await;
        }
        inserted
    }

    /// Entries at or after each requested offset, from memory.
    pub async fn poll(&self, offsets: &BTreeMap<String, u64>) -> BTreeMap<String, Vec<(u64, i64)>> {
        self.state.poll(offsets).await
    }

    /// Raise commit markers locally, then gossip and persist them.
    pub async fn commit_offsets(self: &Arc<Self>, offsets: BTreeMap<String, u64>) {
        let advanced = self.state.commit(&offsets).await;
        if advanced.is_empty() {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let record = CommitRecord {
                offsets: offsets.clone(),
            };
            if let Some(batch) = this.commit_window.add(record).await {
                this.gossip_commits(batch);
            }
            let writes = advanced
                .iter()
                .filter_map(|key| offsets.get(key).map(|offset| this.persist_commit(key, *offset)));
            join_all(writes).await;
        });
    }

    /// Merge commit markers gossiped by a peer.
    pub async fn apply_gossip_commits(&self, batch: Vec<CommitRecord>) -> usize {
        let mut moved = 0;
        for record in batch {
            moved += self.state.commit(&record.offsets).await.len();
        }
        moved
    }

    /// Committed offsets, optionally restricted to `keys`.
    pub async fn list_committed(&self, keys: Option<&[String]>) -> BTreeMap<String, u64> {
        self.state.committed(keys).await
    }

    /// Flush both gossip windows whose deadline has passed, until shutdown.
    pub async fn run_flusher(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        let tick = (self.config.max_batch_delay_duration() / 4).max(Duration::from_millis(1));
        let span = tracing::info_span!("log_gossip");

        async move {
            debug!(tick_ms = tick.as_millis() as u64, "Starting gossip flusher");
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Some(batch) = self.send_window.take_if_due().await {
                            self.gossip_entries(batch);
                        }
                        if let Some(batch) = self.commit_window.take_if_due().await {
                            self.gossip_commits(batch);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            // Last chance for anything still windowed.
            let entries = self.send_window.take().await;
            if !entries.is_empty() {
                self.gossip_entries(entries);
            }
            let commits = self.commit_window.take().await;
            if !commits.is_empty() {
                self.gossip_commits(commits);
            }
            info!("Gossip flusher stopped");
        }
        .instrument(span)
        .await
    }

    async fn forward(&self, authority: &str, key: &str, msg: i64) -> Result<u64> {
        let payload = Payload::Send {
            key: key.to_string(),
            msg,
        };
        let reply = self
            .transport
            .call(authority, payload, self.config.forward_timeout_duration())
            .await?;
        match reply {
            Payload::SendOk { offset } => {
                debug!(key = %key, authority = %authority, offset, "Send forwarded");
                Ok(offset)
            }
            other => Err(ReplicaError::transport(
                authority,
                format!("unexpected reply {}", other.kind()),
            )),
        }
    }

    async fn after_append(&self, record: LogRecord) {
        if let Some(batch) = self.send_window.add(record.clone()).await {
            self.gossip_entries(batch);
        }
        futures::join!(
            self.persist_entry(&record),
            self.persist_latest(&record.key, record.offset)
        );
    }

    async fn persist_entry(&self, record: &LogRecord) {
        let mut shutdown = self.shutdown_rx.clone();
        let retry = RetryConfig::store(self.config.store_timeout_duration());
        let entry = entry_key(&record.key, record.offset);

        match write_with_retry(self.seq_kv.as_ref(), &entry, record.msg, &retry, &mut shutdown).await {
            Ok(()) | Err(ReplicaError::Shutdown) => {}
            Err(e) => warn!(key = %entry, error = %e, "Entry persist failed"),
        }
    }

    /// Raise `latest_<key>` past `offset`. Both allocators start from it.
    async fn persist_latest(&self, key: &str, offset: u64) {
        let mut shutdown = self.shutdown_rx.clone();
        let retry = RetryConfig::store(self.config.store_timeout_duration());
        let latest = latest_key(key);
        let next = i64::try_from(offset + 1).unwrap_or(i64::MAX);

        let outcome = cas_update(self.lin_kv.as_ref(), &latest, &retry, &mut shutdown, |current| {
            let target = merge_counter_max(current.unwrap_or(0), next);
            (Some(target) != current).then_some(target)
        })
        .await;
        match outcome {
            Ok(_) | Err(ReplicaError::Shutdown) => {}
            Err(e) => warn!(key = %latest, error = %e, "Latest offset persist failed"),
        }
    }

    async fn persist_commit(&self, key: &str, offset: u64) {
        let mut shutdown = self.shutdown_rx.clone();
        let retry = RetryConfig::store(self.config.store_timeout_duration());
        let store_key = commit_key(key);
        let target = i64::try_from(offset).unwrap_or(i64::MAX);

        let outcome = cas_update(self.lin_kv.as_ref(), &store_key, &retry, &mut shutdown, |current| {
            (current.map_or(true, |c| c < target)).then_some(target)
        })
        .await;
        match outcome {
            Ok(_) => {}
            Err(ReplicaError::Shutdown) => {}
            Err(e) => warn!(key = %store_key, error = %e, "Commit persist failed"),
        }
    }

    fn gossip_entries(&self, batch: Vec<LogRecord>) {
        for peer in self.transport.peers() {
            let payload = Payload::GossipSend {
                batch: batch.clone(),
            };
            if let Err(e) = self.transport.send(&peer, payload) {
                debug!(peer_id = %peer, error = %e, "gossip_send not delivered");
            }
        }
    }

    fn gossip_commits(&self, batch: Vec<CommitRecord>) {
        for peer in self.transport.peers() {
            let payload = Payload::GossipCommitOffset {
                batch: batch.clone(),
            };
            if let Err(e) = self.transport.send(&peer, payload) {
                debug!(peer_id = %peer, error = %e, "gossip_commit_offset not delivered");
            }
        }
    }
}
