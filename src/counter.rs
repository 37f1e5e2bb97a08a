// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Counter replication.
//!
//! Increments are applied locally first, so a node always reads its own
//! writes, then travel two ways in the background:
//!
//! 1. Gossip: `{delta, delta_id}` to every peer through the retrying
//!    outboxes. Peers apply each `delta_id` once.
//! 2. Durability: this node's running totals are CAS'd into its own store
//!    keys. Only the originating node writes them.
//!
//! # Value
//!
//! Deltas may be negative. Each origin `o` is tracked as two grow-only
//! totals, `added` and `removed`, so both stay monotone and can be merged
//! with `max`. Durable keys per origin are `counter_<o>` (added) and
//! `counter_<o>_dec` (removed, written only once a decrement happens).
//!
//! The replica holds two lower bounds of each origin's totals: `gossip[o]`
//! (deltas applied here) and `durable[o]` (last values read from the store).
//! The counter value is `Σ (max(gossip, durable).added - max(gossip, durable).removed)`.
//! Neither bound ever counts a delta twice, and the value reaches the
//! network-wide sum once either gossip or the store has caught up.
//!
//! # Restart
//!
//! This node's own totals continue from its durable keys: the first persist
//! (or the startup seed, whichever runs first) reads them once and every
//! later persist writes `base + applied_since_start`.

use crate::config::CounterConfig;
use crate::dissemination::Disseminator;
use crate::error::{ReplicaError, Result};
use crate::merge::{merge_counter, merge_counter_max};
use crate::metrics;
use crate::protocol::DeltaRecord;
use crate::resilience::{sleep_or_shutdown, RetryConfig};
use crate::store::{cas_update, read_optional, KvStore};
use crate::transport::Transport;
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, OnceCell, RwLock};
use tracing::{debug, info, instrument, warn};

/// Increments and decrements from one origin, kept as two grow-only sums.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub added: i64,
    pub removed: i64,
}

impl Totals {
    fn apply(&mut self, delta: i64) {
        if delta >= 0 {
            self.added = merge_counter(self.added, delta);
        } else {
            self.removed = merge_counter(self.removed, delta.saturating_neg());
        }
    }

    fn combine(self, other: Totals) -> Totals {
        Totals {
            added: merge_counter(self.added, other.added),
            removed: merge_counter(self.removed, other.removed),
        }
    }

    fn max(self, other: Totals) -> Totals {
        Totals {
            added: merge_counter_max(self.added, other.added),
            removed: merge_counter_max(self.removed, other.removed),
        }
    }

    pub fn value(self) -> i64 {
        self.added.saturating_sub(self.removed)
    }
}

/// Sequence numbers seen from one origin incarnation.
///
/// Everything up to `contiguous` has been applied; `ahead` holds the
/// out-of-order arrivals above it until the gap closes.
#[derive(Debug, Default)]
struct SeqWindow {
    contiguous: u64,
    ahead: BTreeSet<u64>,
}

impl SeqWindow {
    fn insert(&mut self, seq: u64) -> bool {
        if seq <= self.contiguous || !self.ahead.insert(seq) {
            return false;
        }
        while self.ahead.remove(&(self.contiguous + 1)) {
            self.contiguous += 1;
        }
        true
    }
}

/// Delta ids already applied, compacted per `(origin, incarnation)`.
#[derive(Debug, Default)]
struct AppliedDeltas {
    streams: HashMap<(String, u64), SeqWindow>,
    /// Ids not in `<origin>:<incarnation>:<seq>` form.
    opaque: HashSet<String>,
}

impl AppliedDeltas {
    /// Record `delta_id`; false if it was applied before.
    fn insert(&mut self, delta_id: &str) -> bool {
        match parse_delta_id(delta_id) {
            Some((origin, incarnation, seq)) => self
                .streams
                .entry((origin.to_string(), incarnation))
                .or_default()
                .insert(seq),
            None => self.opaque.insert(delta_id.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct CounterState {
    /// Deltas applied on this node since process start.
    own: Totals,
    /// Per-origin totals of gossiped deltas applied here.
    gossip: HashMap<String, Totals>,
    /// Per-origin totals last read from the durable store.
    durable: HashMap<String, Totals>,
    applied: AppliedDeltas,
}

/// Counter replica for one node.
pub struct CounterReplica {
    transport: Arc<dyn Transport>,
    store: Arc<dyn KvStore>,
    disseminator: Arc<Disseminator>,
    config: CounterConfig,
    state: RwLock<CounterState>,
    /// Durable own totals found at first contact with the store.
    own_base: OnceCell<Totals>,
    incarnation: u64,
    next_seq: AtomicU64,
    shutdown_rx: watch::Receiver<bool>,
}

impl CounterReplica {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn KvStore>,
        disseminator: Arc<Disseminator>,
        config: CounterConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let incarnation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            transport,
            store,
            disseminator,
            config,
            state: RwLock::new(CounterState::default()),
            own_base: OnceCell::new(),
            incarnation,
            next_seq: AtomicU64::new(1),
            shutdown_rx,
        }
    }

    /// Apply a local delta, then persist and gossip it in the background.
    pub async fn add(self: &Arc<Self>, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }

        self.state.write().await.own.apply(delta);

        let me = self.transport.node_id();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let record = DeltaRecord {
            delta,
            delta_id: format!("{}:{}:{}", me, self.incarnation, seq),
        };
        debug!(delta, delta_id = %record.delta_id, "Counter add");

        let this = Arc::clone(self);
        tokio::spawn(async move { this.persist_own().await });
        self.disseminator.gossip_delta(record).await;
        Ok(())
    }

    /// Apply deltas gossiped by `src`, each id at most once.
    ///
    /// Returns how many were new.
    pub async fn apply_remote(&self, src: &str, deltas: Vec<DeltaRecord>) -> usize {
        let me = self.transport.node_id();
        let mut state = self.state.write().await;
        let mut applied = 0;

        for record in deltas {
            let origin = origin_of(&record.delta_id).unwrap_or(src).to_string();
            if origin == me {
                continue;
            }
            if !state.applied.insert(&record.delta_id) {
                continue;
            }
            state.gossip.entry(origin).or_default().apply(record.delta);
            applied += 1;
        }
        applied
    }

    /// Current value; triggers a background resync with the durable store.
    pub async fn read(self: &Arc<Self>) -> i64 {
        let value = self.value().await;
        metrics::set_counter_value(value);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.resync().await });
        value
    }

    /// Current value without touching the store.
    pub async fn value(&self) -> i64 {
        let me = self.transport.node_id();
        let base = self.own_base.get().copied().unwrap_or_default();
        let state = self.state.read().await;

        let mut origins: HashSet<&String> = state.gossip.keys().collect();
        origins.extend(state.durable.keys());

        let own = base
            .combine(state.own)
            .max(state.durable.get(&me).copied().unwrap_or_default());
        let mut total = own.value();
        for origin in origins.into_iter().filter(|o| **o != me) {
            let gossiped = state.gossip.get(origin).copied().unwrap_or_default();
            let durable = state.durable.get(origin).copied().unwrap_or_default();
            total = merge_counter(total, gossiped.max(durable).value());
        }
        total
    }

    /// Seed from the durable store at startup.
    #[instrument(skip(self), fields(node_id = %self.transport.node_id()))]
    pub async fn seed(&self) {
        let mut shutdown = self.shutdown_rx.clone();
        match self.own_base(&mut shutdown).await {
            Ok(base) => {
                self.resync().await;
                let value = self.value().await;
                info!(own_added = base.added, own_removed = base.removed, value, "Counter seeded from store");
            }
            Err(ReplicaError::Shutdown) => {}
            Err(e) => warn!(error = %e, "Counter seed failed"),
        }
    }

    /// Adopt every per-node durable total that is ahead of what we hold.
    pub async fn resync(&self) {
        let ids = self.transport.node_ids();
        let reads = join_all(ids.iter().map(|id| async move { (id, self.read_totals(id).await) })).await;

        let mut state = self.state.write().await;
        for (id, read) in reads {
            match read {
                Ok(Some(totals)) => {
                    let entry = state.durable.entry(id.clone()).or_insert(totals);
                    *entry = entry.max(totals);
                }
                Ok(None) => {}
                Err(e) => debug!(node = %id, error = %e, "Counter resync read failed"),
            }
        }
    }

    /// Both durable totals of `node_id`; `None` when neither key exists.
    async fn read_totals(&self, node_id: &str) -> Result<Option<Totals>> {
        let store = self.store.as_ref();
        let added_key = self.config.node_key(node_id);
        let removed_key = self.config.node_decrement_key(node_id);
        let (added, removed) = futures::join!(
            read_optional(store, &added_key),
            read_optional(store, &removed_key)
        );
        let (added, removed) = (added?, removed?);
        if added.is_none() && removed.is_none() {
            return Ok(None);
        }
        Ok(Some(Totals {
            added: added.unwrap_or(0),
            removed: removed.unwrap_or(0),
        }))
    }

    /// Write `base + own` into this node's durable keys.
    async fn persist_own(&self) {
        let mut shutdown = self.shutdown_rx.clone();
        let base = match self.own_base(&mut shutdown).await {
            Ok(base) => base,
            Err(ReplicaError::Shutdown) => return,
            Err(e) => {
                warn!(error = %e, "Cannot persist counter without its durable base");
                return;
            }
        };
        let target = base.combine(self.state.read().await.own);
        let me = self.transport.node_id();
        let retry = RetryConfig::store(self.config.store_timeout_duration());

        let mut stored = Totals::default();
        let parts = [
            (self.config.node_key(&me), target.added),
            (self.config.node_decrement_key(&me), target.removed),
        ];
        for (index, (key, goal)) in parts.into_iter().enumerate() {
            if goal == 0 {
                continue;
            }
            let outcome = cas_update(self.store.as_ref(), &key, &retry, &mut shutdown, |current| {
                (current.unwrap_or(0) < goal).then_some(goal)
            })
            .await;
            match outcome {
                Ok(outcome) => {
                    let value = outcome.map_or(goal, |o| o.current);
                    if index == 0 {
                        stored.added = value;
                    } else {
                        stored.removed = value;
                    }
                    debug!(key = %key, value, "Counter persisted");
                }
                Err(ReplicaError::Shutdown) => return,
                Err(e) => {
                    warn!(key = %key, error = %e, "Counter persist failed");
                    return;
                }
            }
        }

        let mut state = self.state.write().await;
        let entry = state.durable.entry(me).or_default();
        *entry = entry.max(stored);
    }

    /// Read this node's durable totals once, retrying until it succeeds.
    async fn own_base(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Totals> {
        let me = self.transport.node_id();
        let retry = RetryConfig::store(self.config.store_timeout_duration());

        self.own_base
            .get_or_try_init(|| async move {
                let mut failures = 0usize;
                loop {
                    match self.read_totals(&me).await {
                        Ok(totals) => return Ok(totals.unwrap_or_default()),
                        Err(e) if e.is_retryable() => {
                            failures += 1;
                            if !retry.should_retry(failures)
                                || !sleep_or_shutdown(retry.delay_for_attempt(failures), shutdown)
                                    .await
                            {
                                return Err(ReplicaError::Shutdown);
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
            .await
            .copied()
    }
}

/// Split a delta id `<origin>:<incarnation>:<seq>` into its parts.
fn parse_delta_id(delta_id: &str) -> Option<(&str, u64, u64)> {
    let mut parts = delta_id.splitn(3, ':');
    let origin = parts.next().filter(|origin| !origin.is_empty())?;
    let incarnation = parts.next()?.parse().ok()?;
    let seq = parts.next()?.parse().ok()?;
    Some((origin, incarnation, seq))
}

/// Origin node encoded in a delta id.
fn origin_of(delta_id: &str) -> Option<&str> {
    delta_id.split(':').next().filter(|origin| !origin.is_empty())
}
