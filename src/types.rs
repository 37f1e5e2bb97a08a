//! Node lifecycle state.
//!
//! # State Transitions
//!
//! ```text
//!            start()
//! Created ─────────────→ Running
//!    │                      │
//!    │ shutdown()           │ shutdown()
//!    ↓                      ↓
//!    └──────────────→ ShuttingDown ──→ Stopped
//! ```
//!
//! - **Created**: after `ReplicaService::new()`. Identity known, no workers.
//! - **Running**: outbox workers and the log flusher are live.
//! - **ShuttingDown**: shutdown signalled, background tasks draining.
//! - **Stopped**: every task joined or abandoned. Safe to drop.

/// Lifecycle state of a replica node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Built but not started.
    Created,

    /// Serving requests and gossiping.
    Running,

    /// Background tasks are flushing and exiting.
    ShuttingDown,

    /// Shutdown complete.
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}
