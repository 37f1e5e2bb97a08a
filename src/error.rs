// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replica node.
//!
//! Errors are categorized by where they come from (network, durable store,
//! inbound request, local state) and carry enough context to log them
//! without extra bookkeeping.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Timeout` | Yes | RPC or store call exceeded its deadline |
//! | `Transport` | Yes | Message could not be delivered or no reply arrived |
//! | `Remote` | Depends | Peer or store answered with an error body |
//! | `KeyNotFound` | Yes | Store has no value yet (seed a create-if-missing CAS) |
//! | `Conflict` | Yes | CAS expectation mismatch (re-read and retry) |
//! | `MalformedRequest` | No | Request body missing or mistyped fields |
//! | `MergeConflict` | No | Two values claim the same log offset |
//! | `NotSupported` | No | Request kind not served by this workload |
//! | `Config` | No | Configuration invalid |
//! | `Codec` | No | JSON encode/decode failure |
//! | `Io` | No | Reading or writing the process streams failed |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Node is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Error Replies
//!
//! Failures that reach a client are turned into `error` bodies using
//! [`ReplicaError::error_code()`], which follows the numeric codes of the
//! Maelstrom protocol (see [`codes`]).

use thiserror::Error;

/// Result type alias for replica operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Numeric error codes carried in `error` reply bodies.
pub mod codes {
    pub const TIMEOUT: u32 = 0;
    pub const NODE_NOT_FOUND: u32 = 1;
    pub const NOT_SUPPORTED: u32 = 10;
    pub const TEMPORARILY_UNAVAILABLE: u32 = 11;
    pub const MALFORMED_REQUEST: u32 = 12;
    pub const CRASH: u32 = 13;
    pub const ABORT: u32 = 14;
    pub const KEY_DOES_NOT_EXIST: u32 = 20;
    pub const KEY_ALREADY_EXISTS: u32 = 21;
    pub const PRECONDITION_FAILED: u32 = 22;
    pub const TXN_CONFLICT: u32 = 30;
}

/// Errors that can occur while serving requests or replicating state.
#[derive(Error, Debug)]
pub enum ReplicaError {
    /// An RPC or store call did not complete before its deadline.
    ///
    /// Never surfaced to a client whose request was already acknowledged;
    /// background work retries or backlogs instead.
    #[error("RPC to {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: String, timeout_ms: u64 },

    /// The message could not be handed to the transport, or the peer
    /// accepted it without replying.
    #[error("Transport error ({peer}): {message}")]
    Transport { peer: String, message: String },

    /// The peer (or store service) replied with an `error` body.
    #[error("Remote error from {peer} (code {code}): {text}")]
    Remote { peer: String, code: u32, text: String },

    /// The durable store holds no value for this key.
    ///
    /// Treated as "no prior value" by every caller.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Compare-and-swap expectation did not match the stored value.
    #[error("Compare-and-swap conflict on {key}")]
    Conflict { key: String },

    /// The request body is missing a required field or has the wrong shape.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Two different values claim the same offset of the same key.
    ///
    /// Cannot happen under a correct allocator. The existing value is kept.
    #[error("Merge conflict on {key}@{offset}: holding {existing}, received {incoming}")]
    MergeConflict {
        key: String,
        offset: u64,
        existing: i64,
        incoming: i64,
    },

    /// The request kind is not served by the configured workload.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON encode or decode failure.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The process's standard streams failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lifecycle violation (e.g. `start()` called twice).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicaError {
    /// Create a transport error.
    pub fn transport(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error from the deadline that expired.
    pub fn timeout(peer: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            peer: peer.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Check if the failed operation may succeed when attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport { .. } => true,
            Self::Remote { code, .. } => matches!(
                *code,
                codes::TIMEOUT | codes::TEMPORARILY_UNAVAILABLE | codes::CRASH
            ),
            Self::KeyNotFound(_) => true, // re-read seeds a create-if-missing CAS
            Self::Conflict { .. } => true,
            Self::MalformedRequest(_) => false,
            Self::MergeConflict { .. } => false,
            Self::NotSupported(_) => false,
            Self::Config(_) => false,
            Self::Codec(_) => false,
            Self::Io(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Numeric code used when this error is sent back as an `error` body.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::Transport { .. } => codes::TEMPORARILY_UNAVAILABLE,
            Self::Remote { code, .. } => *code,
            Self::KeyNotFound(_) => codes::KEY_DOES_NOT_EXIST,
            Self::Conflict { .. } => codes::PRECONDITION_FAILED,
            Self::MalformedRequest(_) | Self::Codec(_) => codes::MALFORMED_REQUEST,
            Self::NotSupported(_) => codes::NOT_SUPPORTED,
            Self::Shutdown => codes::TEMPORARILY_UNAVAILABLE,
            Self::MergeConflict { .. }
            | Self::Config(_)
            | Self::Io(_)
            | Self::InvalidState { .. }
            | Self::Internal(_) => codes::CRASH,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Transport { .. } => "transport",
            Self::Remote { .. } => "remote",
            Self::KeyNotFound(_) => "key_not_found",
            Self::Conflict { .. } => "conflict",
            Self::MalformedRequest(_) => "malformed_request",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::NotSupported(_) => "not_supported",
            Self::Config(_) => "config",
            Self::Codec(_) => "codec",
            Self::Io(_) => "io",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
