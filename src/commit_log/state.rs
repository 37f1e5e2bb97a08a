//! In-memory log segments and commit markers.

use crate::merge::{merge_commits, merge_log};
use crate::metrics;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::error;

/// Entries of one key, offset → value.
#[derive(Debug, Default, Clone)]
pub struct KeyLog {
    entries: BTreeMap<u64, i64>,
}

impl KeyLog {
    /// Offset after the highest one held.
    pub fn next_offset(&self) -> u64 {
        self.entries
            .last_key_value()
            .map_or(0, |(offset, _)| offset + 1)
    }

    /// Every entry at or after `from`, ascending.
    pub fn read_from(&self, from: u64) -> Vec<(u64, i64)> {
        self.entries
            .range(from..)
            .map(|(offset, value)| (*offset, *value))
            .collect()
    }

    pub fn get(&self, offset: u64) -> Option<i64> {
        self.entries.get(&offset).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All log segments and commit markers held by one node.
#[derive(Debug, Default)]
pub struct LogState {
    logs: RwLock<HashMap<String, KeyLog>>,
    committed: RwLock<BTreeMap<String, u64>>,
}

impl LogState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge entries for `key`; returns how many were new.
    ///
    /// A different value at an occupied offset is logged and counted, and
    /// the held value is kept.
    pub async fn merge<I>(&self, key: &str, entries: I) -> usize
    where
        I: IntoIterator<Item = (u64, i64)>,
    {
        let outcome = {
            let mut logs = self.logs.write().await;
            let log = logs.entry(key.to_string()).or_default();
            merge_log(key, &mut log.entries, entries)
        };

        for conflict in &outcome.conflicts {
            metrics::record_merge_conflict(key);
            error!(key = %key, error = %conflict, "Log merge conflict");
        }
        outcome.inserted.len()
    }

    /// Offset after the highest one known locally for `key`.
    pub async fn next_offset(&self, key: &str) -> u64 {
        self.logs
            .read()
            .await
            .get(key)
            .map_or(0, KeyLog::next_offset)
    }

    /// Entries at or after each requested offset.
    ///
    /// Keys this node holds nothing for are left out of the result.
    pub async fn poll(&self, offsets: &BTreeMap<String, u64>) -> BTreeMap<String, Vec<(u64, i64)>> {
        let logs = self.logs.read().await;
        offsets
            .iter()
            .filter_map(|(key, from)| {
                logs.get(key)
                    .filter(|log| !log.is_empty())
                    .map(|log| (key.clone(), log.read_from(*from)))
            })
            .collect()
    }

    /// Snapshot of one key's segment.
    pub async fn key_log(&self, key: &str) -> Option<KeyLog> {
        self.logs.read().await.get(key).cloned()
    }

    /// Raise commit markers; returns the keys that moved.
    pub async fn commit(&self, offsets: &BTreeMap<String, u64>) -> Vec<String> {
        merge_commits(&mut *self.committed.write().await, offsets)
    }

    /// Commit markers, optionally restricted to `keys`.
    pub async fn committed(&self, keys: Option<&[String]>) -> BTreeMap<String, u64> {
        let committed = self.committed.read().await;
        match keys {
            None => committed.clone(),
            Some(keys) => keys
                .iter()
                .filter_map(|key| committed.get(key).map(|offset| (key.clone(), *offset)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn test_poll_returns_entries_from_offset() {
        let state = LogState::new();
        state.merge("x", vec![(0, 10), (1, 20), (2, 30)]).await;

        let result = state.poll(&offsets(&[("x", 1)])).await;
        assert_eq!(result.get("x"), Some(&vec![(1, 20), (2, 30)]));
    }

    #[tokio::test]
    async fn test_poll_omits_unknown_keys() {
        let state = LogState::new();
        state.merge("x", vec![(0, 1)]).await;
        let result = state.poll(&offsets(&[("x", 0), ("y", 0)])).await;
        assert!(result.contains_key("x"));
        assert!(!result.contains_key("y"));
    }

    #[tokio::test]
    async fn test_poll_past_end_is_empty() {
        let state = LogState::new();
        state.merge("x", vec![(0, 1)]).await;
        let result = state.poll(&offsets(&[("x", 5)])).await;
        assert_eq!(result.get("x"), Some(&vec![]));
    }

    #[tokio::test]
    async fn test_merge_counts_new_and_keeps_existing() {
        let state = LogState::new();
        assert_eq!(state.merge("x", vec![(0, 1), (1, 2)]).await, 2);
        assert_eq!(state.merge("x", vec![(1, 2), (1, 99), (2, 3)]).await, 1);

        let log = state.key_log("x").await.unwrap();
        assert_eq!(log.get(1), Some(2));
        assert_eq!(log.len(), 3);
        assert_eq!(state.next_offset("x").await, 3);
        assert_eq!(state.next_offset("nope").await, 0);
    }

    #[tokio::test]
    async fn test_commits_are_monotone_and_filterable() {
        let state = LogState::new();
        state.commit(&offsets(&[("x", 4), ("y", 1)])).await;
        state.commit(&offsets(&[("x", 2)])).await;

        let all = state.committed(None).await;
        assert_eq!(all, offsets(&[("x", 4), ("y", 1)]));

        let keys = vec!["y".to_string(), "z".to_string()];
        assert_eq!(state.committed(Some(&keys)).await, offsets(&[("y", 1)]));
    }
}
