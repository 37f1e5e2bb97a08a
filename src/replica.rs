// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica service: one node's state and request handlers.
//!
//! Ties together:
//! - Broadcast set and its [`Disseminator`]
//! - Grow-only counter via [`CounterReplica`]
//! - Per-key log via [`CommitLog`]
//!
//! # Request path
//!
//! Every handler mutates local state through the merge core and returns
//! its reply at once. Gossip and durable writes run in background tasks
//! that stop on the shutdown signal. The exceptions are the CAS allocator
//! round trips and the `sync_fanout` strategy, which wait by definition.

use crate::commit_log::CommitLog;
use crate::config::{ReplicaConfig, Strategy, Workload};
use crate::counter::CounterReplica;
use crate::dissemination::Disseminator;
use crate::error::{ReplicaError, Result};
use crate::merge::merge_broadcast;
use crate::metrics;
use crate::protocol::Payload;
use crate::store::KvStore;
use crate::transport::{BoxFuture, Handler, Transport};
use crate::types::NodeState;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long shutdown waits for each background task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// All per-node state plus the workers that replicate it.
pub struct ReplicaService {
    config: ReplicaConfig,

    transport: Arc<dyn Transport>,

    /// Broadcast values seen by this node.
    messages: RwLock<BTreeSet<i64>>,

    disseminator: Arc<Disseminator>,

    counter: Arc<CounterReplica>,

    log: Arc<CommitLog>,

    /// Node state (broadcast to watchers)
    state_tx: watch::Sender<NodeState>,

    state_rx: watch::Receiver<NodeState>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Background task handles (outboxes, flusher, seed)
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicaService {
    /// Build the service for a node whose identity the transport already knows.
    ///
    /// `seq_kv` backs entries and counter totals, `lin_kv` backs offsets
    /// and commits.
    pub fn new(
        config: ReplicaConfig,
        transport: Arc<dyn Transport>,
        seq_kv: Arc<dyn KvStore>,
        lin_kv: Arc<dyn KvStore>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(NodeState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let disseminator = Arc::new(Disseminator::new(
            Arc::clone(&transport),
            config.dissemination.clone(),
            shutdown_rx.clone(),
        ));
        let counter = Arc::new(CounterReplica::new(
            Arc::clone(&transport),
            Arc::clone(&seq_kv),
            Arc::clone(&disseminator),
            config.counter.clone(),
            shutdown_rx.clone(),
        ));
        let log = Arc::new(CommitLog::new(
            Arc::clone(&transport),
            seq_kv,
            lin_kv,
            config.log.clone(),
            shutdown_rx,
        ));

        Self {
            config,
            transport,
            messages: RwLock::new(BTreeSet::new()),
            disseminator,
            counter,
            log,
            state_tx,
            state_rx,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes state changes.
    pub fn state_receiver(&self) -> watch::Receiver<NodeState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    pub fn node_id(&self) -> String {
        self.transport.node_id()
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn disseminator(&self) -> &Arc<Disseminator> {
        &self.disseminator
    }

    pub fn counter(&self) -> &Arc<CounterReplica> {
        &self.counter
    }

    pub fn log(&self) -> &Arc<CommitLog> {
        &self.log
    }

    /// Snapshot of the broadcast set.
    pub async fn messages(&self) -> BTreeSet<i64> {
        self.messages.read().await.clone()
    }

    /// Spawn the outbox workers, the log flusher and (for the counter) the
    /// store seed.
    pub async fn start(&self) -> Result<()> {
        let current = self.state();
        if current != NodeState::Created {
            return Err(ReplicaError::InvalidState {
                expected: "Created".to_string(),
                actual: current.to_string(),
            });
        }

        let mut handles = self.disseminator.start().await;
        handles.push(tokio::spawn(Arc::clone(&self.log).run_flusher()));
        if self.config.workload == Workload::Counter {
            let counter = Arc::clone(&self.counter);
            handles.push(tokio::spawn(async move { counter.seed().await }));
        }
        let task_count = handles.len();
        self.handles.lock().await.extend(handles);

        let _ = self.state_tx.send(NodeState::Running);
        metrics::set_node_state("Running");
        info!(
            node_id = %self.transport.node_id(),
            workload = %self.config.workload,
            peers = self.transport.peers().len(),
            task_count,
            "Replica running"
        );
        Ok(())
    }

    /// Signal every background task to stop and wait for them to drain.
    pub async fn shutdown(&self) {
        if self.state() == NodeState::Stopped {
            return;
        }
        info!("Shutting down replica");
        let _ = self.state_tx.send(NodeState::ShuttingDown);
        metrics::set_node_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().await);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        let _ = self.state_tx.send(NodeState::Stopped);
        metrics::set_node_state("Stopped");
        info!("Replica stopped");
    }

    /// Answer one request from `src`.
    ///
    /// `Ok(None)` means the kind gets no reply.
    pub async fn handle_request(&self, src: &str, payload: Payload) -> Result<Option<Payload>> {
        let reply = match payload {
            Payload::Topology { topology } => {
                // Every node gossips to every peer; the suggested topology is unused.
                debug!(nodes = topology.len(), "Topology received");
                Payload::TopologyOk
            }

            // Broadcast
            Payload::Broadcast { message } => {
                let fresh = merge_broadcast(&mut *self.messages.write().await, [message]);
                if !fresh.is_empty() {
                    self.disseminator.broadcast(message).await;
                }
                Payload::BroadcastOk
            }
            Payload::Propagate { message } => {
                let fresh = merge_broadcast(&mut *self.messages.write().await, message.into_vec());
                if !fresh.is_empty() {
                    debug!(src = %src, count = fresh.len(), "Merged propagated values");
                }
                Payload::PropagateOk
            }
            Payload::ReqFailedMsg => {
                Payload::ReqFailedMsgOk {
                    messages: self.disseminator.take_backlog(src).await,
                }
            }
            Payload::Read { key: None } => self.read().await?,

            // Counter
            Payload::Add { delta } => {
                self.counter.add(delta).await?;
                Payload::AddOk
            }
            Payload::PropagateDelta { deltas } => {
                self.counter.apply_remote(src, deltas).await;
                Payload::PropagateDeltaOk
            }

            // Log
            Payload::Send { key, msg } => {
                Payload::SendOk {
                    offset: self.log.append(src, &key, msg).await?,
                }
            }
            Payload::Poll { offsets } => {
                Payload::PollOk {
                    msgs: self.log.poll(&offsets).await,
                }
            }
            Payload::CommitOffsets { offsets } => {
                self.log.commit_offsets(offsets).await;
                Payload::CommitOffsetsOk
            }
            Payload::ListCommittedOffsets { keys } => {
                Payload::ListCommittedOffsetsOk {
                    offsets: self.log.list_committed(keys.as_deref()).await,
                }
            }
            Payload::GossipSend { batch } => {
                let inserted = self.log.apply_gossip_send(batch).await;
                debug!(src = %src, inserted, "Merged gossiped entries");
                return Ok(None);
            }
            Payload::GossipCommitOffset { batch } => {
                let moved = self.log.apply_gossip_commits(batch).await;
                debug!(src = %src, moved, "Merged gossiped commits");
                return Ok(None);
            }

            Payload::Init { .. } => {
                return Err(ReplicaError::InvalidState {
                    expected: "uninitialized".to_string(),
                    actual: self.state().to_string(),
                });
            }
            other @ (Payload::Read { key: Some(_) } | Payload::Write { .. } | Payload::Cas { .. }) => {
                return Err(ReplicaError::NotSupported(format!(
                    "{} is served by the store services",
                    other.kind()
                )));
            }

            // Replies that arrive without a waiting caller.
            other => {
                debug!(src = %src, kind = other.kind(), "Dropping unsolicited reply");
                return Ok(None);
            }
        };
        Ok(Some(reply))
    }

    async fn read(&self) -> Result<Payload> {
        match self.config.workload {
            Workload::Broadcast => {
                if self.disseminator.strategy() == Strategy::PullBacklog {
                    let pulled = self.disseminator.pull_backlogs().await;
                    merge_broadcast(&mut *self.messages.write().await, pulled);
                }
                let messages = self.messages.read().await.iter().copied().collect();
                Ok(Payload::ReadOk {
                    messages: Some(messages),
                    value: None,
                })
            }
            Workload::Counter => Ok(Payload::ReadOk {
                messages: None,
                value: Some(self.counter.read().await),
            }),
            Workload::Log => Err(ReplicaError::NotSupported("read".to_string())),
        }
    }

}

impl Handler for ReplicaService {
    fn handle(&self, src: String, payload: Payload) -> BoxFuture<'_, Option<Payload>> {
        Box::pin(async move {
            let kind = payload.kind();
            let start = Instant::now();
            let result = self.handle_request(&src, payload).await;
            metrics::record_request(kind, start.elapsed());
            if let Err(e) = &result {
                metrics::record_request_error(kind, e.kind());
                debug!(src = %src, kind, error = %e, "Request failed");
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeltaRecord, Values};
    use crate::store::MemoryKv;
    use crate::transport::SimNetwork;
    use std::collections::BTreeMap;

    fn service(workload: Workload) -> ReplicaService {
        let network = SimNetwork::new(["n1"]);
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new("seq-kv"));
        let lin: Arc<dyn KvStore> = Arc::new(MemoryKv::new("lin-kv"));
        ReplicaService::new(
            ReplicaConfig::for_testing(workload),
            Arc::new(network.transport("n1")),
            store,
            lin,
        )
    }

    #[tokio::test]
    async fn test_initial_state() {
        let svc = service(Workload::Broadcast);
        assert_eq!(svc.state(), NodeState::Created);
        assert!(!svc.is_running());
        assert_eq!(svc.node_id(), "n1");
        assert_eq!(*svc.state_receiver().borrow(), NodeState::Created);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let svc = service(Workload::Broadcast);
        svc.start().await.unwrap();
        assert!(svc.is_running());

        match svc.start().await {
            Err(ReplicaError::InvalidState { expected, actual }) => {
                assert_eq!(expected, "Created");
                assert_eq!(actual, "Running");
            }
            other => panic!("Expected InvalidState, got {:?}", other),
        }
        svc.shutdown().await;
        assert_eq!(svc.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_from_created() {
        let svc = service(Workload::Counter);
        svc.shutdown().await;
        assert_eq!(svc.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_broadcast_then_read() {
        let svc = service(Workload::Broadcast);
        for value in [3, 1, 3] {
            let reply = svc.handle_request("c1", Payload::Broadcast { message: value }).await;
            assert_eq!(reply.unwrap(), Some(Payload::BroadcastOk));
        }
        let reply = svc
            .handle_request("c1", Payload::Propagate { message: Values::Many(vec![2, 1]) })
            .await
            .unwrap();
        assert_eq!(reply, Some(Payload::PropagateOk));

        let read = svc.handle_request("c1", Payload::Read { key: None }).await.unwrap();
        assert_eq!(
            read,
            Some(Payload::ReadOk {
                messages: Some(vec![1, 2, 3]),
                value: None
            })
        );
    }

    #[tokio::test]
    async fn test_counter_add_and_read() {
        let svc = service(Workload::Counter);
        svc.handle_request("c1", Payload::Add { delta: 5 }).await.unwrap();
        svc.handle_request(
            "n2",
            Payload::PropagateDelta {
                deltas: vec![DeltaRecord {
                    delta: 2,
                    delta_id: "n2:1:1".to_string(),
                }],
            },
        )
        .await
        .unwrap();

        let read = svc.handle_request("c1", Payload::Read { key: None }).await.unwrap();
        assert_eq!(
            read,
            Some(Payload::ReadOk {
                messages: None,
                value: Some(7)
            })
        );
    }

    #[tokio::test]
    async fn test_negative_add_decrements() {
        let svc = service(Workload::Counter);
        for delta in [4, -1] {
            let reply = svc.handle_request("c1", Payload::Add { delta }).await.unwrap();
            assert_eq!(reply, Some(Payload::AddOk));
        }
        let read = svc.handle_request("c1", Payload::Read { key: None }).await.unwrap();
        assert_eq!(
            read,
            Some(Payload::ReadOk {
                messages: None,
                value: Some(3)
            })
        );
    }

    #[tokio::test]
    async fn test_log_send_poll_commit() {
        let svc = service(Workload::Log);
        let first = svc
            .handle_request("c1", Payload::Send { key: "x".into(), msg: 10 })
            .await
            .unwrap();
        assert_eq!(first, Some(Payload::SendOk { offset: 0 }));
        let second = svc
            .handle_request("c1", Payload::Send { key: "x".into(), msg: 20 })
            .await
            .unwrap();
        assert_eq!(second, Some(Payload::SendOk { offset: 1 }));

        let offsets: BTreeMap<String, u64> = [("x".to_string(), 0)].into_iter().collect();
        let poll = svc
            .handle_request("c1", Payload::Poll { offsets: offsets.clone() })
            .await
            .unwrap();
        let expected: BTreeMap<String, Vec<(u64, i64)>> =
            [("x".to_string(), vec![(0, 10), (1, 20)])].into_iter().collect();
        assert_eq!(poll, Some(Payload::PollOk { msgs: expected }));

        svc.handle_request("c1", Payload::CommitOffsets { offsets: offsets.clone() })
            .await
            .unwrap();
        let listed = svc
            .handle_request("c1", Payload::ListCommittedOffsets { keys: Some(vec!["x".into()]) })
            .await
            .unwrap();
        assert_eq!(listed, Some(Payload::ListCommittedOffsetsOk { offsets }));
    }

    #[tokio::test]
    async fn test_store_kinds_not_supported() {
        let svc = service(Workload::Log);
        let err = svc
            .handle_request("c1", Payload::Write { key: "k".into(), value: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::NotSupported(_)));

        let err = svc.handle_request("c1", Payload::Read { key: None }).await.unwrap_err();
        assert!(matches!(err, ReplicaError::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_topology_and_replies() {
        let svc = service(Workload::Broadcast);
        let reply = svc
            .handle_request("c1", Payload::Topology { topology: Default::default() })
            .await
            .unwrap();
        assert_eq!(reply, Some(Payload::TopologyOk));

        let none = svc.handle_request("n2", Payload::BroadcastOk).await.unwrap();
        assert_eq!(none, None);
    }
}
