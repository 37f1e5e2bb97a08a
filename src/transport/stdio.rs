//! Process transport: JSON lines on stdin/stdout.
//!
//! Outbound messages are queued on an unbounded channel drained by the
//! runtime's writer task, so `send` never blocks a request handler. Replies
//! to our own RPCs are matched to their waiting caller by `in_reply_to`.
//!
//! ```text
//! call() ──▶ pending[msg_id] = oneshot ──▶ outbound queue ──▶ stdout
//!                    ▲
//! stdin ──▶ runtime ─┴── resolve(in_reply_to, payload)
//! ```

use super::{BoxFuture, Transport};
use crate::error::{ReplicaError, Result};
use crate::protocol::{Body, Message, Payload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, trace};

/// Own id plus the full cluster membership, learned from `init`.
#[derive(Debug, Clone, Default)]
struct Identity {
    node_id: String,
    node_ids: Vec<String>,
}

/// Transport over the process's standard streams.
pub struct StdioTransport {
    identity: watch::Sender<Identity>,
    next_msg_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Payload>>>,
    outbound: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Create the transport and the receiving end of its outbound queue.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (identity, _) = watch::channel(Identity::default());
        let transport = Self {
            identity,
            next_msg_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound,
            closed: AtomicBool::new(false),
        };
        (transport, rx)
    }

    /// Record this node's id and the cluster membership.
    pub fn set_identity(&self, node_id: String, node_ids: Vec<String>) {
        self.identity.send_replace(Identity { node_id, node_ids });
    }

    /// Answer the request `in_reply_to` that `dest` sent us.
    pub fn reply(&self, dest: &str, in_reply_to: Option<u64>, payload: Payload) -> Result<()> {
        self.push(dest, None, in_reply_to, payload)
    }

    /// Hand a reply to the caller waiting on `in_reply_to`.
    ///
    /// Returns `false` when nobody is waiting (the call already timed out).
    pub async fn resolve(&self, in_reply_to: u64, payload: Payload) -> bool {
        let waiter = self.pending.lock().await.remove(&in_reply_to);
        match waiter {
            Some(tx) => tx.send(payload).is_ok(),
            None => {
                debug!(in_reply_to, kind = payload.kind(), "Late or unsolicited reply dropped");
                false
            }
        }
    }

    /// Stop accepting outbound messages.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Number of RPCs waiting for a reply.
    pub async fn pending_calls(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn push(
        &self,
        dest: &str,
        msg_id: Option<u64>,
        in_reply_to: Option<u64>,
        payload: Payload,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplicaError::transport(dest, "transport closed"));
        }
        trace!(dest = %dest, kind = payload.kind(), ?msg_id, ?in_reply_to, "Queueing message");
        let message = Message {
            src: self.node_id(),
            dest: dest.to_string(),
            body: Body {
                msg_id,
                in_reply_to,
                payload,
            },
        };
        self.outbound
            .send(message)
            .map_err(|_| ReplicaError::transport(dest, "writer stopped"))
    }
}

impl Transport for StdioTransport {
    fn node_id(&self) -> String {
        self.identity.borrow().node_id.clone()
    }

    fn node_ids(&self) -> Vec<String> {
        self.identity.borrow().node_ids.clone()
    }

    fn send(&self, dest: &str, payload: Payload) -> Result<()> {
        self.push(dest, None, None, payload)
    }

    fn call(&self, dest: &str, payload: Payload, timeout: Duration) -> BoxFuture<'_, Payload> {
        let dest = dest.to_string();
        Box::pin(async move {
            let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            self.pending.lock().await.insert(msg_id, tx);

            if let Err(e) = self.push(&dest, Some(msg_id), None, payload) {
                self.pending.lock().await.remove(&msg_id);
                return Err(e);
            }

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => reply.into_result(&dest),
                Ok(Err(_)) => Err(ReplicaError::transport(&dest, "reply channel dropped")),
                Err(_) => {
                    self.pending.lock().await.remove(&msg_id);
                    Err(ReplicaError::timeout(&dest, timeout))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_identity_and_peers() {
        let (transport, _rx) = StdioTransport::new();
        assert_eq!(transport.node_id(), "");
        transport.set_identity("n2".into(), vec!["n1".into(), "n2".into(), "n3".into()]);
        assert_eq!(transport.node_id(), "n2");
        assert_eq!(transport.peers(), vec!["n1".to_string(), "n3".to_string()]);
    }

    #[tokio::test]
    async fn test_send_queues_message() {
        let (transport, mut rx) = StdioTransport::new();
        transport.set_identity("n1".into(), vec!["n1".into()]);
        transport.send("n2", Payload::PropagateOk).unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.src, "n1");
        assert_eq!(message.dest, "n2");
        assert_eq!(message.body.msg_id, None);
        assert_eq!(message.body.payload, Payload::PropagateOk);
    }

    #[tokio::test]
    async fn test_call_resolved_by_reply() {
        let (transport, mut rx) = StdioTransport::new();
        let transport = Arc::new(transport);
        transport.set_identity("n1".into(), vec!["n1".into(), "n2".into()]);

        let caller = Arc::clone(&transport);
        let call = tokio::spawn(async move {
            caller
                .call("n2", Payload::ReqFailedMsg, Duration::from_secs(5))
                .await
        });

        let request = rx.recv().await.unwrap();
        let msg_id = request.body.msg_id.unwrap();
        assert!(
            transport
                .resolve(msg_id, Payload::ReqFailedMsgOk { messages: vec![4] })
                .await
        );

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply, Payload::ReqFailedMsgOk { messages: vec![4] });
        assert_eq!(transport.pending_calls().await, 0);
    }

    #[tokio::test]
    async fn test_call_error_reply_is_remote() {
        let (transport, mut rx) = StdioTransport::new();
        let transport = Arc::new(transport);
        transport.set_identity("n1".into(), vec!["n1".into()]);

        let caller = Arc::clone(&transport);
        let call = tokio::spawn(async move {
            caller
                .call("lin-kv", Payload::Read { key: Some("k".into()) }, Duration::from_secs(5))
                .await
        });

        let request = rx.recv().await.unwrap();
        transport
            .resolve(
                request.body.msg_id.unwrap(),
                Payload::Error { code: 20, text: "not found".into() },
            )
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ReplicaError::Remote { code: 20, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out_and_forgets() {
        let (transport, _rx) = StdioTransport::new();
        transport.set_identity("n1".into(), vec!["n1".into(), "n2".into()]);

        let err = transport
            .call("n2", Payload::PropagateOk, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::Timeout { timeout_ms: 100, .. }));
        assert_eq!(transport.pending_calls().await, 0);
        assert!(!transport.resolve(1, Payload::PropagateOk).await);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_sends() {
        let (transport, _rx) = StdioTransport::new();
        transport.close();
        let err = transport.send("n2", Payload::PropagateOk).unwrap_err();
        assert!(matches!(err, ReplicaError::Transport { .. }));
    }
}
