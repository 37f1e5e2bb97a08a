//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Request handling per message type
//! - Gossip attempts, batch sizes and backlog depth
//! - Durable store operations and CAS contention
//! - Log offsets allocated and merge conflicts
//! - Node lifecycle state
//!
//! No recorder is installed by the library; without one every call is a no-op.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replica_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use gossip_replica::metrics;
//! use std::time::Duration;
//!
//! metrics::record_request("broadcast", Duration::from_micros(80));
//! metrics::record_gossip_attempt("n2", "propagate", true);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a handled client or peer request.
pub fn record_request(kind: &str, duration: Duration) {
    counter!("replica_requests_total", "type" => kind.to_string()).increment(1);
    histogram!("replica_request_duration_seconds", "type" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record a request answered with an error body.
pub fn record_request_error(kind: &str, error_kind: &str) {
    counter!(
        "replica_request_errors_total",
        "type" => kind.to_string(),
        "error" => error_kind.to_string()
    )
    .increment(1);
}

/// Record an inbound line that could not be decoded.
pub fn record_malformed_message() {
    counter!("replica_malformed_messages_total").increment(1);
}

/// Record one gossip RPC attempt to a peer.
pub fn record_gossip_attempt(peer: &str, kind: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replica_gossip_attempts_total",
        "peer" => peer.to_string(),
        "type" => kind.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record the size of a gossip batch sent to a peer.
pub fn record_gossip_batch(peer: &str, size: usize) {
    histogram!("replica_gossip_batch_size", "peer" => peer.to_string()).record(size as f64);
}

/// Record how many values wait in a peer's backlog.
pub fn set_backlog_depth(peer: &str, depth: usize) {
    gauge!("replica_backlog_depth", "peer" => peer.to_string()).set(depth as f64);
}

/// Record a backlog pull from a peer.
pub fn record_backlog_pull(peer: &str, values: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replica_backlog_pulls_total", "peer" => peer.to_string(), "status" => status)
        .increment(1);
    if values > 0 {
        counter!("replica_backlog_values_pulled_total").increment(values as u64);
    }
}

/// Record a durable store call.
pub fn record_store_op(store: &str, operation: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replica_store_ops_total",
        "store" => store.to_string(),
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "replica_store_op_duration_seconds",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a compare-and-swap that had to be retried.
pub fn record_cas_retry(key_kind: &str) {
    counter!("replica_cas_retries_total", "key" => key_kind.to_string()).increment(1);
}

/// Record two different values claiming one log offset.
pub fn record_merge_conflict(key: &str) {
    counter!("replica_merge_conflicts_total", "key" => key.to_string()).increment(1);
}

/// Record a log offset assignment.
pub fn record_offset_allocated(allocator: &str) {
    counter!("replica_offsets_allocated_total", "allocator" => allocator.to_string()).increment(1);
}

/// Record the node's lifecycle state as a numeric gauge.
pub fn set_node_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("replica_node_state").set(value);
}

/// Record the locally known counter value.
pub fn set_counter_value(value: i64) {
    gauge!("replica_counter_value").set(value as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these are no-ops; the tests pin the
    // label shapes so a recorder never sees mismatched keys.

    #[test]
    fn test_record_request() {
        record_request("broadcast", Duration::from_micros(50));
        record_request_error("send", "timeout");
        record_malformed_message();
    }

    #[test]
    fn test_record_gossip() {
        record_gossip_attempt("n2", "propagate", true);
        record_gossip_attempt("n2", "propagate_delta", false);
        record_gossip_batch("n2", 2);
    }

    #[test]
    fn test_record_backlog() {
        set_backlog_depth("n3", 4);
        record_backlog_pull("n3", 4, true);
        record_backlog_pull("n3", 0, false);
    }

    #[test]
    fn test_record_store() {
        record_store_op("lin-kv", "cas", true, Duration::from_millis(3));
        record_cas_retry("latest");
        record_offset_allocated("distributed_cas");
        record_merge_conflict("k1");
    }

    #[test]
    fn test_set_node_state_all_variants() {
        for state in ["Created", "Running", "ShuttingDown", "Stopped", "Unknown"] {
            set_node_state(state);
        }
        set_counter_value(42);
    }
}
