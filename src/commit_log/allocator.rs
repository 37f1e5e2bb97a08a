//! Offset allocation.
//!
//! Two allocators give each key a gap-free, strictly increasing offset
//! sequence:
//!
//! | Allocator | Where offsets come from | Cost per append |
//! |-----------|-------------------------|-----------------|
//! | [`SingleAuthority`] | memory of the key's authority node | one forward RPC off the authority |
//! | [`DistributedCas`] | claims in the linearizable store | one read plus one CAS per contended offset |
//!
//! The authority for a key is a pure function of the key and the cluster
//! membership, so every node picks the same one without coordination.
//!
//! # Claims
//!
//! [`DistributedCas`] owns offset `o` of `key` once it has created
//! `owner_<key>_<o>` holding a token unique to that allocation:
//!
//! ```text
//! read latest_<key> ──▶ o
//! cas owner_<key>_<o>  token → token (create)
//!   ├─ ok        ─▶ offset o
//!   ├─ conflict  ─▶ someone else owns o, try o + 1
//!   └─ timeout   ─▶ same cas again: succeeds iff the first one landed
//! ```
//!
//! A lost CAS reply therefore never strands an offset. `latest_<key>` is
//! only where the search starts; it is advanced after the append.

use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::resilience::{sleep_or_shutdown, RetryConfig};
use crate::store::{read_optional, KvStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::debug;

/// Store key holding the next offset to hand out for `key`.
pub fn latest_key(key: &str) -> String {
    format!("latest_{}", key)
}

/// Store key recording which allocation owns `offset` of `key`.
pub fn claim_key(key: &str, offset: u64) -> String {
    format!("owner_{}_{}", key, offset)
}

/// 64-bit FNV-1a. Stable across processes and platforms.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Node that assigns offsets for `key` under the single-authority scheme.
pub fn authority_for<'a>(key: &str, node_ids: &'a [String]) -> Option<&'a str> {
    if node_ids.is_empty() {
        return None;
    }
    let index = (fnv1a(key.as_bytes()) % node_ids.len() as u64) as usize;
    node_ids.get(index).map(String::as_str)
}

/// Stored `latest_<key>` as an offset; `None` and negatives count as 0.
fn stored_offset(value: Option<i64>) -> u64 {
    value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

#[derive(Debug, Default)]
struct Slot {
    next: u64,
    /// Whether `latest_<key>` has been read into `next`.
    seeded: bool,
}

/// Per-key counters in the authority's memory.
pub struct SingleAuthority {
    store: Arc<dyn KvStore>,
    keys: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

/// An offset reserved under the key's lock.
///
/// The key stays locked until this is dropped, so the caller can store the
/// entry before the next offset for the same key is handed out.
pub struct Reservation {
    pub offset: u64,
    _guard: OwnedMutexGuard<Slot>,
}

impl SingleAuthority {
    /// `store` is the linearizable store holding `latest_<key>`.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the next offset for `key`, never below `floor`.
    ///
    /// `floor` is the offset after the highest entry known locally. The
    /// first reservation for a key also reads `latest_<key>`, so a restarted
    /// authority continues after the offsets it persisted before. Until that
    /// read succeeds it is repeated on every reservation.
    pub async fn reserve(&self, key: &str, floor: u64) -> Reservation {
        let slot = {
            let mut keys = self.keys.lock().await;
            Arc::clone(keys.entry(key.to_string()).or_default())
        };
        let mut guard = slot.lock_owned().await;

        if !guard.seeded {
            match read_optional(self.store.as_ref(), &latest_key(key)).await {
                Ok(latest) => {
                    guard.next = guard.next.max(stored_offset(latest));
                    guard.seeded = true;
                }
                Err(e) => debug!(key = %key, error = %e, "latest offset unavailable, allocating from memory"),
            }
        }

        let offset = guard.next.max(floor);
        guard.next = offset + 1;
        metrics::record_offset_allocated("single_authority");
        Reservation {
            offset,
            _guard: guard,
        }
    }
}

/// Offsets allocated by claiming them in the linearizable store.
pub struct DistributedCas {
    store: Arc<dyn KvStore>,
    retry: RetryConfig,
    owner: String,
    incarnation: u64,
    next_claim: AtomicU64,
}

impl DistributedCas {
    /// `owner` names this node in claim tokens.
    pub fn new(store: Arc<dyn KvStore>, retry: RetryConfig, owner: impl Into<String>) -> Self {
        let incarnation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            store,
            retry,
            owner: owner.into(),
            incarnation,
            next_claim: AtomicU64::new(1),
        }
    }

    /// Token identifying one allocation. Never zero.
    fn claim_token(&self) -> i64 {
        let seq = self.next_claim.fetch_add(1, Ordering::Relaxed);
        let tag = format!("{}:{}:{}", self.owner, self.incarnation, seq);
        (fnv1a(tag.as_bytes()) as i64) | 1
    }

    /// Claim the lowest free offset of `key` at or after `latest_<key>`.
    pub async fn allocate(&self, key: &str, shutdown: &mut watch::Receiver<bool>) -> Result<u64> {
        let token = self.claim_token();
        let mut offset = self.start_offset(key, shutdown).await?;
        let mut failures = 0usize;

        loop {
            if *shutdown.borrow() {
                return Err(ReplicaError::Shutdown);
            }
            let claim = claim_key(key, offset);
            match self.store.compare_and_swap(&claim, token, token, true).await {
                Ok(()) => break,
                Err(ReplicaError::Conflict { .. }) => {
                    metrics::record_cas_retry("owner");
                    offset += 1;
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    debug!(key = %claim, attempt = failures, error = %e, "Claim outcome unknown, retrying");
                    self.pause(failures, e, shutdown).await?;
                }
                Err(e) => return Err(e),
            }
        }

        metrics::record_offset_allocated("distributed_cas");
        Ok(offset)
    }

    async fn start_offset(&self, key: &str, shutdown: &mut watch::Receiver<bool>) -> Result<u64> {
        let store_key = latest_key(key);
        let mut failures = 0usize;
        loop {
            match read_optional(self.store.as_ref(), &store_key).await {
                Ok(latest) => return Ok(stored_offset(latest)),
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    self.pause(failures, e, shutdown).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Back off after `failures` transient errors, or give up with `err`.
    async fn pause(
        &self,
        failures: usize,
        err: ReplicaError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        if !self.retry.should_retry(failures) {
            return Err(err);
        }
        if !sleep_or_shutdown(self.retry.delay_for_attempt(failures), shutdown).await {
            return Err(ReplicaError::Shutdown);
        }
        Ok(())
    }
}
