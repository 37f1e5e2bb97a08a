// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replica node.
//!
//! Configuration can be constructed programmatically or deserialized from
//! JSON. Every field has a default, so an empty object is a valid config.
//!
//! # Quick Start
//!
//! ```rust
//! use gossip_replica::config::{ReplicaConfig, Strategy, Workload};
//!
//! let mut config = ReplicaConfig::for_testing(Workload::Broadcast);
//! config.dissemination.strategy = Strategy::PullBacklog;
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicaConfig
//! ├── workload: Workload              # broadcast | counter | log
//! ├── dissemination: DisseminationConfig
//! │   ├── strategy                    # sync_fanout | async_retry | batched_async_retry | pull_backlog
//! │   ├── rpc_timeout / backlog_timeout
//! │   └── max_batch_size / max_batch_delay
//! ├── counter: CounterConfig          # durable store keys and timeouts
//! └── log: LogConfig                  # allocator, gossip window, store timeouts
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "workload": "log",
//!   "dissemination": { "strategy": "batched_async_retry", "max_batch_size": 2 },
//!   "log": { "allocator": "distributed_cas", "store_timeout": "500ms" }
//! }
//! ```

use crate::error::{ReplicaError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicaService::new()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Which workload answers the ambiguous `read` request.
    #[serde(default)]
    pub workload: Workload,

    /// How broadcast values and counter deltas reach peers.
    #[serde(default)]
    pub dissemination: DisseminationConfig,

    /// Counter replication settings.
    #[serde(default)]
    pub counter: CounterConfig,

    /// Log replication settings.
    #[serde(default)]
    pub log: LogConfig,
}

impl ReplicaConfig {
    /// Create a config with short timeouts for in-process tests.
    pub fn for_testing(workload: Workload) -> Self {
        Self {
            workload,
            dissemination: DisseminationConfig::for_testing(),
            counter: CounterConfig::for_testing(),
            log: LogConfig::for_testing(),
        }
    }

    /// Parse a config from a JSON string and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ReplicaError::Config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ReplicaError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.dissemination.max_batch_size == 0 {
            return Err(ReplicaError::Config(
                "dissemination.max_batch_size must be at least 1".into(),
            ));
        }
        if self.log.max_batch_size == 0 {
            return Err(ReplicaError::Config(
                "log.max_batch_size must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("dissemination.rpc_timeout", &self.dissemination.rpc_timeout),
            ("dissemination.backlog_timeout", &self.dissemination.backlog_timeout),
            ("dissemination.max_batch_delay", &self.dissemination.max_batch_delay),
            ("counter.store_timeout", &self.counter.store_timeout),
            ("log.store_timeout", &self.log.store_timeout),
            ("log.forward_timeout", &self.log.forward_timeout),
            ("log.max_batch_delay", &self.log.max_batch_delay),
        ] {
            if humantime::parse_duration(value).is_err() {
                return Err(ReplicaError::Config(format!(
                    "{} is not a duration: {:?}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// The workload served by this node.
///
/// All request handlers are always registered; the workload only decides
/// the shape of the `read` reply and which startup tasks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    #[default]
    Broadcast,
    Counter,
    Log,
}

impl std::fmt::Display for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Workload::Broadcast => write!(f, "broadcast"),
            Workload::Counter => write!(f, "counter"),
            Workload::Log => write!(f, "log"),
        }
    }
}

impl std::str::FromStr for Workload {
    type Err = ReplicaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "broadcast" => Ok(Workload::Broadcast),
            "counter" | "g-counter" => Ok(Workload::Counter),
            "log" | "kafka" => Ok(Workload::Log),
            other => Err(ReplicaError::Config(format!("unknown workload: {}", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DisseminationConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// How a broadcast value reaches every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One attempt to every peer before replying.
    SyncFanout,
    /// Reply, then retry each peer until it acknowledges.
    AsyncRetry,
    /// As `AsyncRetry`, coalescing values per peer into size/time windows.
    #[default]
    BatchedAsyncRetry,
    /// Reply, try each peer once; failures wait in a backlog the peer pulls on read.
    PullBacklog,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::SyncFanout => write!(f, "sync_fanout"),
            Strategy::AsyncRetry => write!(f, "async_retry"),
            Strategy::BatchedAsyncRetry => write!(f, "batched_async_retry"),
            Strategy::PullBacklog => write!(f, "pull_backlog"),
        }
    }
}

/// Dissemination engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisseminationConfig {
    #[serde(default)]
    pub strategy: Strategy,

    /// Per-attempt RPC timeout for gossip (e.g. "200ms").
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: String,

    /// Timeout of the single attempt made before backlogging a value.
    #[serde(default = "default_backlog_timeout")]
    pub backlog_timeout: String,

    /// Flush a peer's batch once it holds this many updates.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Flush a peer's batch this long after its first update.
    #[serde(default = "default_max_batch_delay")]
    pub max_batch_delay: String,

    /// Ceiling for the pause between retries to an unreachable peer (ms).
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_rpc_timeout() -> String {
    "200ms".to_string()
}

fn default_backlog_timeout() -> String {
    "100ms".to_string()
}

fn default_max_batch_size() -> usize {
    2
}

fn default_max_batch_delay() -> String {
    "250ms".to_string()
}

fn default_retry_max_delay_ms() -> u64 {
    1000
}

impl Default for DisseminationConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            rpc_timeout: default_rpc_timeout(),
            backlog_timeout: default_backlog_timeout(),
            max_batch_size: default_max_batch_size(),
            max_batch_delay: default_max_batch_delay(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl DisseminationConfig {
    /// Short windows for tests.
    pub fn for_testing() -> Self {
        Self {
            strategy: Strategy::default(),
            rpc_timeout: "50ms".to_string(),
            backlog_timeout: "30ms".to_string(),
            max_batch_size: 2,
            max_batch_delay: "20ms".to_string(),
            retry_max_delay_ms: 50,
        }
    }

    pub fn rpc_timeout_duration(&self) -> Duration {
        parse_or(&self.rpc_timeout, Duration::from_millis(200))
    }

    pub fn backlog_timeout_duration(&self) -> Duration {
        parse_or(&self.backlog_timeout, Duration::from_millis(100))
    }

    pub fn max_batch_delay_duration(&self) -> Duration {
        parse_or(&self.max_batch_delay, Duration::from_millis(250))
    }

    /// Retry schedule for per-peer gossip workers (never gives up).
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::gossip(
            self.rpc_timeout_duration(),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    /// Whether per-peer outboxes coalesce updates into batch windows.
    pub fn batching(&self) -> bool {
        self.strategy == Strategy::BatchedAsyncRetry
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CounterConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Counter replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Prefix of the per-node durable keys (`<prefix>_<node_id>`).
    #[serde(default = "default_counter_key_prefix")]
    pub key_prefix: String,

    /// Per-call timeout against the durable store.
    #[serde(default = "default_counter_store_timeout")]
    pub store_timeout: String,
}

fn default_counter_key_prefix() -> String {
    "counter".to_string()
}

fn default_counter_store_timeout() -> String {
    "200ms".to_string()
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_counter_key_prefix(),
            store_timeout: default_counter_store_timeout(),
        }
    }
}

impl CounterConfig {
    pub fn for_testing() -> Self {
        Self {
            store_timeout: "50ms".to_string(),
            ..Default::default()
        }
    }

    pub fn store_timeout_duration(&self) -> Duration {
        parse_or(&self.store_timeout, Duration::from_millis(200))
    }

    /// Durable key holding the sum of increments that originated on `node_id`.
    pub fn node_key(&self, node_id: &str) -> String {
        format!("{}_{}", self.key_prefix, node_id)
    }

    /// Durable key holding the magnitude of decrements from `node_id`.
    pub fn node_decrement_key(&self, node_id: &str) -> String {
        format!("{}_{}_dec", self.key_prefix, node_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LogConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// How log offsets are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    /// One node per key assigns offsets from memory; others forward to it.
    SingleAuthority,
    /// Any node assigns offsets with a CAS loop on the linearizable store.
    #[default]
    DistributedCas,
}

/// Log replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub allocator: AllocatorKind,

    /// Per-call timeout against either durable store.
    #[serde(default = "default_log_store_timeout")]
    pub store_timeout: String,

    /// Timeout of a `send` forwarded to the key's authority.
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout: String,

    /// Flush gossip windows once they hold this many records.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Flush gossip windows this long after their first record.
    #[serde(default = "default_max_batch_delay")]
    pub max_batch_delay: String,
}

fn default_log_store_timeout() -> String {
    "500ms".to_string()
}

fn default_forward_timeout() -> String {
    "1s".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            allocator: AllocatorKind::default(),
            store_timeout: default_log_store_timeout(),
            forward_timeout: default_forward_timeout(),
            max_batch_size: default_max_batch_size(),
            max_batch_delay: default_max_batch_delay(),
        }
    }
}

impl LogConfig {
    pub fn for_testing() -> Self {
        Self {
            allocator: AllocatorKind::default(),
            store_timeout: "50ms".to_string(),
            forward_timeout: "100ms".to_string(),
            max_batch_size: 2,
            max_batch_delay: "20ms".to_string(),
        }
    }

    pub fn store_timeout_duration(&self) -> Duration {
        parse_or(&self.store_timeout, Duration::from_millis(500))
    }

    pub fn forward_timeout_duration(&self) -> Duration {
        parse_or(&self.forward_timeout, Duration::from_secs(1))
    }

    pub fn max_batch_delay_duration(&self) -> Duration {
        parse_or(&self.max_batch_delay, Duration::from_millis(250))
    }
}

/// Parse a humantime duration, falling back when the string is invalid.
fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dissemination_defaults() {
        let config = DisseminationConfig::default();
        assert_eq!(config.strategy, Strategy::BatchedAsyncRetry);
        assert_eq!(config.rpc_timeout_duration(), Duration::from_millis(200));
        assert_eq!(config.backlog_timeout_duration(), Duration::from_millis(100));
        assert_eq!(config.max_batch_size, 2);
        assert_eq!(config.max_batch_delay_duration(), Duration::from_millis(250));
        assert!(config.batching());
    }

    #[test]
    fn test_batching_only_for_batched_strategy() {
        for (strategy, expected) in [
            (Strategy::SyncFanout, false),
            (Strategy::AsyncRetry, false),
            (Strategy::BatchedAsyncRetry, true),
            (Strategy::PullBacklog, false),
        ] {
            let config = DisseminationConfig {
                strategy,
                ..Default::default()
            };
            assert_eq!(config.batching(), expected, "strategy {}", strategy);
        }
    }

    #[test]
    fn test_duration_parsing_formats() {
        let cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("250ms", Duration::from_millis(250)),
        ];
        for (input, expected) in cases {
            let config = DisseminationConfig {
                rpc_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.rpc_timeout_duration(), expected, "input {}", input);
        }
    }

    #[test]
    fn test_invalid_duration_falls_back() {
        let config = LogConfig {
            store_timeout: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.store_timeout_duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_workload_from_str() {
        assert_eq!("broadcast".parse::<Workload>().unwrap(), Workload::Broadcast);
        assert_eq!("g-counter".parse::<Workload>().unwrap(), Workload::Counter);
        assert_eq!("kafka".parse::<Workload>().unwrap(), Workload::Log);
        assert!(matches!("txn".parse::<Workload>(), Err(ReplicaError::Config(_))));
    }

    #[test]
    fn test_counter_node_key() {
        let config = CounterConfig::default();
        assert_eq!(config.node_key("n1"), "counter_n1");
        assert_eq!(config.node_decrement_key("n1"), "counter_n1_dec");
    }

    #[test]
    fn test_empty_json_is_default() {
        let config = ReplicaConfig::from_json("{}").unwrap();
        assert_eq!(config.workload, Workload::Broadcast);
        assert_eq!(config.dissemination.strategy, Strategy::BatchedAsyncRetry);
        assert_eq!(config.log.allocator, AllocatorKind::DistributedCas);
    }

    #[test]
    fn test_json_snake_case_enums() {
        let config = ReplicaConfig::from_json(
            r#"{
                "workload": "log",
                "dissemination": {"strategy": "pull_backlog"},
                "log": {"allocator": "single_authority", "store_timeout": "1s"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.workload, Workload::Log);
        assert_eq!(config.dissemination.strategy, Strategy::PullBacklog);
        assert_eq!(config.log.allocator, AllocatorKind::SingleAuthority);
        assert_eq!(config.log.store_timeout_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = ReplicaConfig::default();
        config.dissemination.max_batch_size = 0;
        assert!(matches!(config.validate(), Err(ReplicaError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_duration() {
        let err = ReplicaConfig::from_json(r#"{"counter": {"store_timeout": "later"}}"#).unwrap_err();
        assert!(err.to_string().contains("counter.store_timeout"));
    }

    #[test]
    fn test_for_testing_is_valid() {
        for workload in [Workload::Broadcast, Workload::Counter, Workload::Log] {
            let config = ReplicaConfig::for_testing(workload);
            assert!(config.validate().is_ok());
            assert_eq!(config.workload, workload);
        }
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = ReplicaConfig::for_testing(Workload::Counter);
        config.counter.key_prefix = "g".to_string();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplicaConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.workload, Workload::Counter);
        assert_eq!(parsed.counter.node_key("n2"), "g_n2");
        assert_eq!(parsed.dissemination.rpc_timeout, "50ms");
    }
}
