//! Merge rules for replicated state.
//!
//! Every replicated structure in the node converges by merging, never by
//! coordination. Each rule here is pure, idempotent and commutative, which
//! is what makes duplicate gossip deliveries and retries harmless.
//!
//! | State | Rule |
//! |-------|------|
//! | Broadcast set | union |
//! | Counter cache | add (one delta), max (durable total) |
//! | Log segment | insert absent offsets, never overwrite |
//! | Commit marker | max |

use crate::error::ReplicaError;
use std::collections::{BTreeMap, BTreeSet};

/// Union `incoming` into `local`, returning the values that were new.
pub fn merge_broadcast<I>(local: &mut BTreeSet<i64>, incoming: I) -> Vec<i64>
where
    I: IntoIterator<Item = i64>,
{
    incoming
        .into_iter()
        .filter(|value| local.insert(*value))
        .collect()
}

/// Apply one counter delta.
pub fn merge_counter(local: i64, delta: i64) -> i64 {
    local.saturating_add(delta)
}

/// Adopt a durable total when it is ahead of the local view.
pub fn merge_counter_max(local: i64, durable: i64) -> i64 {
    local.max(durable)
}

/// Outcome of merging entries into a log segment.
#[derive(Debug, Default)]
pub struct LogMerge {
    /// Offsets that were absent and are now present.
    pub inserted: Vec<u64>,
    /// Offsets where a different value was already held. The held value is kept.
    pub conflicts: Vec<ReplicaError>,
}

/// Insert each `(offset, value)` that is absent from `local`.
///
/// An offset already holding the same value is a duplicate delivery and is
/// skipped silently. An offset holding a different value is reported as a
/// [`ReplicaError::MergeConflict`]; the existing value wins.
pub fn merge_log<I>(key: &str, local: &mut BTreeMap<u64, i64>, entries: I) -> LogMerge
where
    I: IntoIterator<Item = (u64, i64)>,
{
    let mut outcome = LogMerge::default();
    for (offset, value) in entries {
        match local.get(&offset) {
            None => {
                local.insert(offset, value);
                outcome.inserted.push(offset);
            }
            Some(existing) if *existing == value => {}
            Some(existing) => outcome.conflicts.push(ReplicaError::MergeConflict {
                key: key.to_string(),
                offset,
                existing: *existing,
                incoming: value,
            }),
        }
    }
    outcome
}

/// Raise each committed offset to the incoming one when it is higher.
///
/// Returns the keys whose marker moved (including keys seen for the first time).
pub fn merge_commits(
    local: &mut BTreeMap<String, u64>,
    incoming: &BTreeMap<String, u64>,
) -> Vec<String> {
    let mut advanced = Vec::new();
    for (key, offset) in incoming {
        match local.get_mut(key) {
            Some(current) if *current >= *offset => {}
            Some(current) => {
                *current = *offset;
                advanced.push(key.clone());
            }
            None => {
                local.insert(key.clone(), *offset);
                advanced.push(key.clone());
            }
        }
    }
    advanced
}
