//! Process loop.
//!
//! ```text
//! reader ──▶ decode ──┬─ in_reply_to ──▶ transport.resolve (waiting call)
//!                     ├─ init ─────────▶ identity, stores, service.start()
//!                     └─ request ──────▶ spawn(service.handle) ──▶ reply
//!                                                            │
//! writer ◀── encode ◀── outbound queue ◀─────────────────────┘
//! ```
//!
//! Every request runs as its own task, so a handler waiting on an RPC never
//! holds up the replies that RPC depends on. EOF on the reader shuts the
//! service down and drains the outbound queue before returning.

use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::protocol::{decode, encode, Inbound, Message, Payload};
use crate::replica::ReplicaService;
use crate::store::{KvStore, MaelstromKv};
use crate::transport::{Handler, StdioTransport, Transport};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Drives one node over a line-oriented reader and writer.
pub struct Runtime {
    config: ReplicaConfig,
    transport: Arc<StdioTransport>,
    service: Option<Arc<ReplicaService>>,
}

impl Runtime {
    pub fn new(config: ReplicaConfig) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (transport, outbound) = StdioTransport::new();
        let runtime = Self {
            config,
            transport: Arc::new(transport),
            service: None,
        };
        (runtime, outbound)
    }

    /// Serve until `reader` reaches EOF.
    pub async fn run<R, W>(config: ReplicaConfig, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (mut runtime, outbound) = Self::new(config);
        let (stop_tx, stop_rx) = watch::channel(false);
        let writer_handle = spawn_writer(outbound, writer, stop_rx);

        let mut lines = reader.lines();
        let outcome = loop {
            match lines.next_line().await {
                Ok(Some(line)) => runtime.dispatch(&line).await,
                Ok(None) => break Ok(()),
                Err(e) => break Err(ReplicaError::from(e)),
            }
        };
        info!("Input closed");

        if let Some(service) = runtime.service.take() {
            service.shutdown().await;
        }
        runtime.transport.close();
        let _ = stop_tx.send(true);
        match writer_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Writer failed"),
            Err(e) => warn!(error = %e, "Writer task panicked"),
        }
        outcome
    }

    /// Handle one inbound line.
    pub async fn dispatch(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let message = match decode(line) {
            Ok(Inbound::Message(message)) => message,
            Ok(Inbound::Malformed {
                src, msg_id, reason, ..
            }) => {
                metrics::record_malformed_message();
                warn!(src = %src, reason = %reason, "Malformed request");
                if msg_id.is_some() {
                    let err = ReplicaError::MalformedRequest(reason);
                    self.reply(&src, msg_id, Payload::error(&err));
                }
                return;
            }
            Err(e) => {
                metrics::record_malformed_message();
                warn!(error = %e, "Unreadable line dropped");
                return;
            }
        };

        let Message { src, body, .. } = message;
        if let Some(in_reply_to) = body.in_reply_to {
            self.transport.resolve(in_reply_to, body.payload).await;
            return;
        }

        let Some(service) = self.service.clone() else {
            let reply = match body.payload {
                Payload::Init { node_id, node_ids } => match self.init(node_id, node_ids).await {
                    Ok(()) => Payload::InitOk,
                    Err(e) => {
                        error!(error = %e, "Init failed");
                        Payload::error(&e)
                    }
                },
                payload => {
                    debug!(src = %src, kind = payload.kind(), "Request before init");
                    Payload::error(&ReplicaError::InvalidState {
                        expected: "Running".to_string(),
                        actual: "uninitialized".to_string(),
                    })
                }
            };
            self.reply(&src, body.msg_id, reply);
            return;
        };

        let transport = Arc::clone(&self.transport);
        let msg_id = body.msg_id;
        let payload = body.payload;
        let span = tracing::debug_span!("request", src = %src, kind = payload.kind(), ?msg_id);
        tokio::spawn(
            async move {
                let reply = match service.handle(src.clone(), payload).await {
                    Ok(Some(reply)) => reply,
                    Ok(None) => return,
                    Err(e) => Payload::error(&e),
                };
                // Notifications without a msg_id get no answer, errors included.
                if msg_id.is_none() {
                    return;
                }
                if let Err(e) = transport.reply(&src, msg_id, reply) {
                    debug!(error = %e, "Reply not sent");
                }
            }
            .instrument(span),
        );
    }

    /// The running service, once `init` has been processed.
    pub fn service(&self) -> Option<&Arc<ReplicaService>> {
        self.service.as_ref()
    }

    async fn init(&mut self, node_id: String, node_ids: Vec<String>) -> Result<()> {
        info!(node_id = %node_id, nodes = node_ids.len(), "Init");
        self.transport.set_identity(node_id, node_ids);

        let transport: Arc<dyn Transport> = self.transport.clone();
        let seq_kv: Arc<dyn KvStore> = Arc::new(MaelstromKv::seq(
            Arc::clone(&transport),
            self.config.counter.store_timeout_duration(),
        ));
        let lin_kv: Arc<dyn KvStore> = Arc::new(MaelstromKv::lin(
            Arc::clone(&transport),
            self.config.log.store_timeout_duration(),
        ));

        let service = Arc::new(ReplicaService::new(
            self.config.clone(),
            transport,
            seq_kv,
            lin_kv,
        ));
        service.start().await?;
        self.service = Some(service);
        Ok(())
    }

    fn reply(&self, dest: &str, in_reply_to: Option<u64>, payload: Payload) {
        if let Err(e) = self.transport.reply(dest, in_reply_to, payload) {
            debug!(dest = %dest, error = %e, "Reply not sent");
        }
    }
}

/// Write every queued message as one line until stopped, then drain.
fn spawn_writer<W>(
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut writer: W,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = outbound.recv() => match message {
                    Some(message) => write_line(&mut writer, &message).await?,
                    None => break,
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        while let Ok(message) = outbound.try_recv() {
            write_line(&mut writer, &message).await?;
        }
        writer.flush().await?;
        debug!("Writer stopped");
        Ok::<(), ReplicaError>(())
    })
}

async fn write_line<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = encode(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Workload;

    fn line(src: &str, body: &str) -> String {
        format!(r#"{{"src":"{}","dest":"n1","body":{}}}"#, src, body)
    }

    #[tokio::test]
    async fn test_init_then_request() {
        let (mut runtime, mut outbound) = Runtime::new(ReplicaConfig::for_testing(Workload::Broadcast));
        runtime
            .dispatch(&line("c0", r#"{"type":"init","msg_id":1,"node_id":"n1","node_ids":["n1"]}"#))
            .await;
        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.dest, "c0");
        assert_eq!(reply.src, "n1");
        assert_eq!(reply.body.in_reply_to, Some(1));
        assert_eq!(reply.body.payload, Payload::InitOk);
        assert!(runtime.service().is_some());

        runtime
            .dispatch(&line("c1", r#"{"type":"broadcast","msg_id":2,"message":7}"#))
            .await;
        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.body.in_reply_to, Some(2));
        assert_eq!(reply.body.payload, Payload::BroadcastOk);

        if let Some(service) = runtime.service() {
            service.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_malformed_body_gets_error_reply() {
        let (mut runtime, mut outbound) = Runtime::new(ReplicaConfig::for_testing(Workload::Broadcast));
        runtime
            .dispatch(&line("c1", r#"{"type":"broadcast","msg_id":4}"#))
            .await;
        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.body.in_reply_to, Some(4));
        match reply.body.payload {
            Payload::Error { code, .. } => assert_eq!(code, crate::error::codes::MALFORMED_REQUEST),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_before_init_is_rejected() {
        let (mut runtime, mut outbound) = Runtime::new(ReplicaConfig::for_testing(Workload::Counter));
        runtime
            .dispatch(&line("c1", r#"{"type":"read","msg_id":9}"#))
            .await;
        let reply = outbound.recv().await.unwrap();
        assert!(matches!(reply.body.payload, Payload::Error { .. }));
    }

    #[tokio::test]
    async fn test_garbage_is_dropped() {
        let (mut runtime, mut outbound) = Runtime::new(ReplicaConfig::for_testing(Workload::Log));
        runtime.dispatch("not json").await;
        runtime.dispatch("   ").await;
        assert!(outbound.try_recv().is_err());
    }
}
