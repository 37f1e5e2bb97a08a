//! Per-peer outbox and its delivery worker.
//!
//! Each peer has exactly one worker task. Updates bound for that peer are
//! appended to the peer's batch window; the worker waits until the window
//! is due, takes everything in it, and retries the RPC with a fresh
//! timeout until the peer acknowledges.
//!
//! # Graceful Shutdown
//!
//! The worker observes the shutdown watch both while idle and between
//! retries. Updates still queued or in flight at shutdown are dropped: they
//! are already in local state, and nothing outlives the process.

use crate::batch::{BatchConfig, BatchWindow};
use crate::error::ReplicaError;
use crate::metrics;
use crate::protocol::{DeltaRecord, Payload, Values};
use crate::resilience::{sleep_or_shutdown, RetryConfig};
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn, Instrument};

/// One update waiting for delivery to a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipItem {
    /// A broadcast value.
    Value(i64),
    /// A counter increment.
    Delta(DeltaRecord),
}

/// Updates waiting for one peer.
pub struct Outbox {
    peer: String,
    window: Mutex<BatchWindow<GossipItem>>,
    notify: Notify,
}

impl Outbox {
    pub fn new(peer: impl Into<String>, config: BatchConfig) -> Self {
        Self {
            peer: peer.into(),
            window: Mutex::new(BatchWindow::new(config)),
            notify: Notify::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue one update and wake the worker.
    pub async fn push(&self, item: GossipItem) {
        self.window.lock().await.add(item);
        self.notify.notify_one();
    }

    /// Number of updates not yet handed to the worker.
    pub async fn queued(&self) -> usize {
        self.window.lock().await.len()
    }

    /// Wait until the window is due, then drain it.
    ///
    /// Returns `None` when shutdown is signalled first.
    async fn next_batch(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Vec<GossipItem>> {
        loop {
            let deadline = {
                let mut window = self.window.lock().await;
                if !window.is_empty() && window.should_flush() {
                    return Some(window.take());
                }
                window.deadline()
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                }
            }
        }
    }
}

/// Run the delivery worker for one peer until shutdown.
pub async fn run_outbox(
    outbox: Arc<Outbox>,
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("outbox", peer_id = %outbox.peer);

    async move {
        debug!("Starting outbox worker");

        while let Some(batch) = outbox.next_batch(&mut shutdown).await {
            metrics::record_gossip_batch(&outbox.peer, batch.len());

            let mut values = Vec::new();
            let mut deltas = Vec::new();
            for item in batch {
                match item {
                    GossipItem::Value(v) => values.push(v),
                    GossipItem::Delta(d) => deltas.push(d),
                }
            }

            if !values.is_empty() {
                let payload = Payload::Propagate {
                    message: Values::from(values),
                };
                if !deliver(&outbox.peer, transport.as_ref(), payload, &retry, &mut shutdown).await {
                    break;
                }
            }
            if !deltas.is_empty() {
                let payload = Payload::PropagateDelta { deltas };
                if !deliver(&outbox.peer, transport.as_ref(), payload, &retry, &mut shutdown).await {
                    break;
                }
            }
        }

        info!("Outbox worker stopped");
    }
    .instrument(span)
    .await
}

/// Send `payload` to `peer` until it is acknowledged.
///
/// Returns `false` when shutdown interrupted the retries.
async fn deliver(
    peer: &str,
    transport: &dyn Transport,
    payload: Payload,
    retry: &RetryConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let kind = payload.kind();
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        match transport
            .call(peer, payload.clone(), retry.attempt_timeout)
            .await
        {
            Ok(_) => {
                metrics::record_gossip_attempt(peer, kind, true);
                if attempt > 1 {
                    debug!(kind, attempt, "Gossip delivered after retries");
                }
                return true;
            }
            Err(e) if !e.is_retryable() => {
                metrics::record_gossip_attempt(peer, kind, false);
                warn!(kind, error = %e, "Peer rejected gossip, dropping batch");
                return true;
            }
            Err(e) => {
                metrics::record_gossip_attempt(peer, kind, false);
                if matches!(e, ReplicaError::Timeout { .. }) {
                    debug!(kind, attempt, "Gossip timed out, retrying");
                } else {
                    debug!(kind, attempt, error = %e, "Gossip failed, retrying");
                }
                if !retry.should_retry(attempt) {
                    warn!(kind, attempt, "Giving up on gossip batch");
                    return true;
                }
                if !sleep_or_shutdown(retry.delay_for_attempt(attempt), shutdown).await {
                    return false;
                }
            }
        }
    }
}
