// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable key/value store integration.
//!
//! The replica persists counters, log entries and commit markers in two
//! external stores with different consistency levels (`seq-kv` and
//! `lin-kv`). Both are reached through [`KvStore`]:
//!
//! - [`MaelstromKv`]: talks to a store service over the [`Transport`]
//! - [`MemoryKv`]: in-process map with the same semantics, for tests
//!
//! [`KvServiceHandler`] serves a [`MemoryKv`] over a simulated network so
//! the RPC path can be exercised end to end.
//!
//! # Compare-and-swap loops
//!
//! [`cas_update`] is the one place that turns the store's optimistic
//! primitives into a retrying read-modify-write:
//!
//! ```text
//! read ──▶ update(current) ──▶ cas(current → next) ──▶ done
//!   ▲                               │
//!   └──── Conflict / KeyNotFound ◀──┤
//!   └──── Timeout (after backoff) ◀─┘
//! ```

use crate::error::{codes, ReplicaError, Result};
use crate::metrics;
use crate::protocol::Payload;
use crate::resilience::{sleep_or_shutdown, RetryConfig};
use crate::transport::{BoxFuture, Handler, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

/// Service name of the sequentially consistent store.
pub const SEQ_KV: &str = "seq-kv";
/// Service name of the linearizable store.
pub const LIN_KV: &str = "lin-kv";

/// Typed read / write / compare-and-swap against a durable store.
pub trait KvStore: Send + Sync + 'static {
    /// Store name (for logs and metrics).
    fn name(&self) -> &str;

    /// Read a value. A missing key is `Err(ReplicaError::KeyNotFound)`.
    fn read(&self, key: &str) -> BoxFuture<'_, i64>;

    /// Unconditional write.
    fn write(&self, key: &str, value: i64) -> BoxFuture<'_, ()>;

    /// Replace `from` with `to`. A mismatch is `Err(ReplicaError::Conflict)`;
    /// a missing key is created only when `create_if_missing` is set.
    fn compare_and_swap(
        &self,
        key: &str,
        from: i64,
        to: i64,
        create_if_missing: bool,
    ) -> BoxFuture<'_, ()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MaelstromKv
// ═══════════════════════════════════════════════════════════════════════════════

/// Store client speaking the `read` / `write` / `cas` RPCs to a service node.
pub struct MaelstromKv {
    service: String,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl MaelstromKv {
    pub fn new(service: impl Into<String>, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            service: service.into(),
            transport,
            timeout,
        }
    }

    /// Client for the sequentially consistent store.
    pub fn seq(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self::new(SEQ_KV, transport, timeout)
    }

    /// Client for the linearizable store.
    pub fn lin(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self::new(LIN_KV, transport, timeout)
    }

    async fn rpc(&self, operation: &str, key: &str, payload: Payload) -> Result<Payload> {
        let start = Instant::now();
        let result = self
            .transport
            .call(&self.service, payload, self.timeout)
            .await
            .map_err(|e| classify(e, key));
        let ok = matches!(result, Ok(_) | Err(ReplicaError::KeyNotFound(_)));
        metrics::record_store_op(&self.service, operation, ok, start.elapsed());
        result
    }
}

/// Map store error codes onto the typed variants callers match on.
fn classify(err: ReplicaError, key: &str) -> ReplicaError {
    match err {
        ReplicaError::Remote { code: codes::KEY_DOES_NOT_EXIST, .. } => {
            ReplicaError::KeyNotFound(key.to_string())
        }
        ReplicaError::Remote { code: codes::PRECONDITION_FAILED, .. } => ReplicaError::Conflict {
            key: key.to_string(),
        },
        other => other,
    }
}

fn unexpected(service: &str, reply: &Payload) -> ReplicaError {
    ReplicaError::transport(service, format!("unexpected reply {}", reply.kind()))
}

impl KvStore for MaelstromKv {
    fn name(&self) -> &str {
        &self.service
    }

    fn read(&self, key: &str) -> BoxFuture<'_, i64> {
        let key = key.to_string();
        Box::pin(async move {
            let reply = self
                .rpc("read", &key, Payload::Read { key: Some(key.clone()) })
                .await?;
            match reply {
                Payload::ReadOk { value: Some(value), .. } => Ok(value),
                other => Err(unexpected(&self.service, &other)),
            }
        })
    }

    fn write(&self, key: &str, value: i64) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let reply = self
                .rpc("write", &key, Payload::Write { key: key.clone(), value })
                .await?;
            match reply {
                Payload::WriteOk => Ok(()),
                other => Err(unexpected(&self.service, &other)),
            }
        })
    }

    fn compare_and_swap(
        &self,
        key: &str,
        from: i64,
        to: i64,
        create_if_missing: bool,
    ) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let payload = Payload::Cas {
                key: key.clone(),
                from,
                to,
                create_if_not_exists: create_if_missing,
            };
            match self.rpc("cas", &key, payload).await? {
                Payload::CasOk => Ok(()),
                other => Err(unexpected(&self.service, &other)),
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryKv
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process store with the same semantics as the store services.
#[derive(Default)]
pub struct MemoryKv {
    name: String,
    data: RwLock<HashMap<String, i64>>,
}

impl MemoryKv {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Current contents (for assertions).
    pub async fn snapshot(&self) -> HashMap<String, i64> {
        self.data.read().await.clone()
    }
}

impl KvStore for MemoryKv {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, key: &str) -> BoxFuture<'_, i64> {
        let key = key.to_string();
        Box::pin(async move {
            self.data
                .read()
                .await
                .get(&key)
                .copied()
                .ok_or(ReplicaError::KeyNotFound(key))
        })
    }

    fn write(&self, key: &str, value: i64) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.data.write().await.insert(key, value);
            Ok(())
        })
    }

    fn compare_and_swap(
        &self,
        key: &str,
        from: i64,
        to: i64,
        create_if_missing: bool,
    ) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let mut data = self.data.write().await;
            match data.get(&key).copied() {
                Some(current) if current == from => {
                    data.insert(key, to);
                    Ok(())
                }
                Some(_) => Err(ReplicaError::Conflict { key }),
                None if create_if_missing => {
                    data.insert(key, to);
                    Ok(())
                }
                None => Err(ReplicaError::KeyNotFound(key)),
            }
        })
    }
}

/// Serves a [`KvStore`] as a store service node.
pub struct KvServiceHandler<S: KvStore> {
    store: Arc<S>,
}

impl<S: KvStore> KvServiceHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: KvStore> Handler for KvServiceHandler<S> {
    fn handle(&self, _src: String, payload: Payload) -> BoxFuture<'_, Option<Payload>> {
        Box::pin(async move {
            let reply = match payload {
                Payload::Read { key: Some(key) } => Payload::ReadOk {
                    messages: None,
                    value: Some(self.store.read(&key).await?),
                },
                Payload::Write { key, value } => {
                    self.store.write(&key, value).await?;
                    Payload::WriteOk
                }
                Payload::Cas {
                    key,
                    from,
                    to,
                    create_if_not_exists,
                } => {
                    self.store
                        .compare_and_swap(&key, from, to, create_if_not_exists)
                        .await?;
                    Payload::CasOk
                }
                other => return Err(ReplicaError::NotSupported(other.kind().to_string())),
            };
            Ok(Some(reply))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Read-modify-write helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Read a value, treating a missing key as `None`.
pub async fn read_optional(store: &dyn KvStore, key: &str) -> Result<Option<i64>> {
    match store.read(key).await {
        Ok(value) => Ok(Some(value)),
        Err(ReplicaError::KeyNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Outcome of a successful [`cas_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasOutcome {
    /// Value observed before the swap (`None` if the key was missing).
    pub previous: Option<i64>,
    /// Value now stored.
    pub current: i64,
}

/// Retrying compare-and-swap loop.
///
/// `update` maps the observed value to the desired one, or `None` when the
/// stored value is already good enough (the loop then ends without a write
/// and returns `Ok(None)`). Conflicts and missing keys re-read at once;
/// transient failures back off per `retry`. Stops with
/// `Err(ReplicaError::Shutdown)` when shutdown is signalled, or with the last
/// error once `retry.max_attempts` transient failures have accumulated.
pub async fn cas_update<F>(
    store: &dyn KvStore,
    key: &str,
    retry: &RetryConfig,
    shutdown: &mut watch::Receiver<bool>,
    mut update: F,
) -> Result<Option<CasOutcome>>
where
    F: FnMut(Option<i64>) -> Option<i64>,
{
    let mut failures = 0usize;
    loop {
        if *shutdown.borrow() {
            return Err(ReplicaError::Shutdown);
        }

        let attempt = async {
            let previous = read_optional(store, key).await?;
            let Some(next) = update(previous) else {
                return Ok(None);
            };
            let from = previous.unwrap_or(0);
            store
                .compare_and_swap(key, from, next, previous.is_none())
                .await?;
            Ok::<_, ReplicaError>(Some(CasOutcome { previous, current: next }))
        };

        match attempt.await {
            Ok(outcome) => return Ok(outcome),
            Err(ReplicaError::Conflict { .. }) | Err(ReplicaError::KeyNotFound(_)) => {
                metrics::record_cas_retry(key_kind(key));
                debug!(store = store.name(), key = %key, "CAS lost a race, re-reading");
                tokio::task::yield_now().await;
            }
            Err(e) if e.is_retryable() => {
                failures += 1;
                if !retry.should_retry(failures) {
                    return Err(e);
                }
                warn!(
                    store = store.name(),
                    key = %key,
                    attempt = failures,
                    error = %e,
                    "Store call failed, retrying"
                );
                if !sleep_or_shutdown(retry.delay_for_attempt(failures), shutdown).await {
                    return Err(ReplicaError::Shutdown);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retrying unconditional write.
pub async fn write_with_retry(
    store: &dyn KvStore,
    key: &str,
    value: i64,
    retry: &RetryConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut failures = 0usize;
    loop {
        match store.write(key, value).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                failures += 1;
                if !retry.should_retry(failures) {
                    return Err(e);
                }
                debug!(store = store.name(), key = %key, attempt = failures, error = %e, "Write failed, retrying");
                if !sleep_or_shutdown(retry.delay_for_attempt(failures), shutdown).await {
                    return Err(ReplicaError::Shutdown);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Metric label for a store key: the prefix before the first `_`.
fn key_kind(key: &str) -> &str {
    key.split('_').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimNetwork;

    #[tokio::test]
    async fn test_memory_kv_cas_semantics() {
        let kv = MemoryKv::new(LIN_KV);
        assert!(matches!(kv.read("k").await, Err(ReplicaError::KeyNotFound(_))));
        assert!(matches!(
            kv.compare_and_swap("k", 0, 1, false).await,
            Err(ReplicaError::KeyNotFound(_))
        ));
        kv.compare_and_swap("k", 0, 1, true).await.unwrap();
        assert_eq!(kv.read("k").await.unwrap(), 1);
        assert!(matches!(
            kv.compare_and_swap("k", 0, 2, true).await,
            Err(ReplicaError::Conflict { .. })
        ));
        kv.compare_and_swap("k", 1, 2, false).await.unwrap();
        kv.write("k", 9).await.unwrap();
        assert_eq!(kv.snapshot().await.get("k"), Some(&9));
    }

    #[tokio::test]
    async fn test_cas_update_increments() {
        let kv = MemoryKv::new(LIN_KV);
        let (_tx, mut rx) = watch::channel(false);
        let retry = RetryConfig::testing();

        let first = cas_update(&kv, "latest_x", &retry, &mut rx, |cur| Some(cur.unwrap_or(0) + 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, CasOutcome { previous: None, current: 1 });

        let second = cas_update(&kv, "latest_x", &retry, &mut rx, |cur| Some(cur.unwrap_or(0) + 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, CasOutcome { previous: Some(1), current: 2 });
    }

    #[tokio::test]
    async fn test_cas_update_noop_when_satisfied() {
        let kv = MemoryKv::new(LIN_KV);
        kv.write("commit_x", 5).await.unwrap();
        let (_tx, mut rx) = watch::channel(false);
        let outcome = cas_update(&kv, "commit_x", &RetryConfig::testing(), &mut rx, |cur| {
            (cur.unwrap_or(0) < 3).then_some(3)
        })
        .await
        .unwrap();
        assert!(outcome.is_none());
        assert_eq!(kv.read("commit_x").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_cas_updates_never_lose_increments() {
        let kv = Arc::new(MemoryKv::new(LIN_KV));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let kv = Arc::clone(&kv);
            handles.push(tokio::spawn(async move {
                let (_tx, mut rx) = watch::channel(false);
                cas_update(kv.as_ref(), "latest_k", &RetryConfig::testing(), &mut rx, |cur| {
                    Some(cur.unwrap_or(0) + 1)
                })
                .await
                .unwrap()
                .unwrap()
                .previous
                .unwrap_or(0)
            }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<i64>>());
        assert_eq!(kv.read("latest_k").await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_cas_update_stops_on_shutdown() {
        let kv = MemoryKv::new(LIN_KV);
        let (_tx, mut rx) = watch::channel(true);
        let err = cas_update(&kv, "k", &RetryConfig::testing(), &mut rx, |_| Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::Shutdown));
    }

    #[tokio::test]
    async fn test_maelstrom_kv_over_sim_network() {
        let network = SimNetwork::new(["n1"]);
        let backing = Arc::new(MemoryKv::new(LIN_KV));
        let service: Arc<dyn Handler> = Arc::new(KvServiceHandler::new(Arc::clone(&backing)));
        network.register(LIN_KV, &service);

        let transport: Arc<dyn Transport> = Arc::new(network.transport("n1"));
        let kv = MaelstromKv::lin(transport, Duration::from_secs(1));

        assert!(matches!(kv.read("k").await, Err(ReplicaError::KeyNotFound(_))));
        kv.compare_and_swap("k", 0, 4, true).await.unwrap();
        assert!(matches!(
            kv.compare_and_swap("k", 0, 5, false).await,
            Err(ReplicaError::Conflict { .. })
        ));
        kv.write("k", 7).await.unwrap();
        assert_eq!(kv.read("k").await.unwrap(), 7);
        assert_eq!(backing.snapshot().await.get("k"), Some(&7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cas_update_gives_up_after_max_attempts() {
        let network = SimNetwork::new(["n1"]);
        let backing = Arc::new(MemoryKv::new(LIN_KV));
        let service: Arc<dyn Handler> = Arc::new(KvServiceHandler::new(backing));
        network.register(LIN_KV, &service);
        network.partition("n1", LIN_KV);

        let transport: Arc<dyn Transport> = Arc::new(network.transport("n1"));
        let kv = MaelstromKv::lin(transport, Duration::from_millis(10));
        let (_tx, mut rx) = watch::channel(false);
        let err = cas_update(&kv, "k", &RetryConfig::testing(), &mut rx, |_| Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::Timeout { .. }));
    }

    #[test]
    fn test_key_kind() {
        assert_eq!(key_kind("latest_x"), "latest");
        assert_eq!(key_kind("plain"), "plain");
    }
}
