//! # Gossip Replica
//!
//! Replica nodes for an unreliable, partitionable network speaking the
//! Maelstrom JSON-lines protocol. One binary serves three workloads:
//!
//! - **Broadcast**: every node ends up with every value, via retry-until-ack
//!   gossip with batching, or a pull-on-read backlog.
//! - **Grow-only counter**: delta gossip plus per-node totals in a durable
//!   compare-and-swap store.
//! - **Offset log**: per-key append-only logs with offset allocation, poll
//!   and commit tracking.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              gossip-replica                               │
//! │                                                                           │
//! │  ┌─────────┐    ┌────────────────┐    ┌────────────┐                      │
//! │  │ Runtime │───►│ ReplicaService │───►│ merge core │ (union / add / max)  │
//! │  │ (stdio) │    │ (per node)     │    └────────────┘                      │
//! │  └─────────┘    └────────────────┘                                        │
//! │       ▲            │     │      │                                         │
//! │       │            ▼     ▼      ▼                                         │
//! │       │  ┌──────────────┐ ┌─────────┐ ┌───────────┐                       │
//! │       │  │ Disseminator │ │ Counter │ │ CommitLog │──► allocator          │
//! │       │  │ (outboxes)   │ │         │ │           │                       │
//! │       │  └──────────────┘ └─────────┘ └───────────┘                       │
//! │       │          │              │            │                            │
//! │       └──────────┴── Transport ─┴── KvStore ─┘ (seq-kv / lin-kv)          │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests are answered from local state at once; gossip and durable
//! writes continue in background tasks until a shutdown signal.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gossip_replica::{ReplicaConfig, Runtime, Workload};
//! use tokio::io::BufReader;
//!
//! #[tokio::main]
//! async fn main() -> gossip_replica::Result<()> {
//!     let config = ReplicaConfig::for_testing(Workload::Broadcast);
//!     let reader = BufReader::new(tokio::io::stdin());
//!     Runtime::run(config, reader, tokio::io::stdout()).await
//! }
//! ```

pub mod batch;
pub mod commit_log;
pub mod config;
pub mod counter;
pub mod dissemination;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod protocol;
pub mod replica;
pub mod resilience;
pub mod runtime;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use commit_log::CommitLog;
pub use config::{
    AllocatorKind, CounterConfig, DisseminationConfig, LogConfig, ReplicaConfig, Strategy, Workload,
};
pub use counter::CounterReplica;
pub use dissemination::Disseminator;
pub use error::{ReplicaError, Result};
pub use protocol::{Message, Payload};
pub use replica::ReplicaService;
pub use runtime::Runtime;
pub use store::{KvStore, MaelstromKv, MemoryKv};
pub use transport::{Handler, SimNetwork, SimTransport, StdioTransport, Transport};
pub use types::NodeState;
