//! Shared test utilities for the cluster tests.
//!
//! This module provides:
//! - An in-process cluster of replica nodes on a simulated network
//! - Shared in-memory `seq-kv` / `lin-kv` stores that can be taken down
//! - Polling helpers for eventually-consistent assertions

#![allow(dead_code)]

use gossip_replica::transport::BoxFuture;
use gossip_replica::{
    Handler, KvStore, MemoryKv, Payload, ReplicaConfig, ReplicaError, ReplicaService, SimNetwork,
    Workload,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default wait for convergence assertions.
pub const CONVERGE: Duration = Duration::from_secs(5);

/// In-memory store that times out every call while down.
pub struct OutageKv {
    inner: MemoryKv,
    down: AtomicBool,
}

impl OutageKv {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryKv::new(name),
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> HashMap<String, i64> {
        self.inner.snapshot().await
    }

    fn outage<T: Send + 'static>(&self) -> Option<BoxFuture<'_, T>> {
        if !self.down.load(Ordering::SeqCst) {
            return None;
        }
        let name = self.inner.name().to_string();
        Some(Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(ReplicaError::timeout(name, Duration::from_millis(50)))
        }))
    }
}

impl KvStore for OutageKv {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn read(&self, key: &str) -> BoxFuture<'_, i64> {
        self.outage().unwrap_or_else(|| self.inner.read(key))
    }

    fn write(&self, key: &str, value: i64) -> BoxFuture<'_, ()> {
        self.outage().unwrap_or_else(|| self.inner.write(key, value))
    }

    fn compare_and_swap(&self, key: &str, from: i64, to: i64, create: bool) -> BoxFuture<'_, ()> {
        self.outage()
            .unwrap_or_else(|| self.inner.compare_and_swap(key, from, to, create))
    }
}

/// A running cluster `n1..=nN` that shares one pair of stores.
pub struct Cluster {
    pub network: SimNetwork,
    pub seq_kv: Arc<OutageKv>,
    pub lin_kv: Arc<OutageKv>,
    pub nodes: Vec<Arc<ReplicaService>>,
}

impl Cluster {
    /// Build and start `size` nodes with the given config.
    pub async fn start(size: usize, config: ReplicaConfig) -> Self {
        let ids: Vec<String> = (1..=size).map(|i| format!("n{}", i)).collect();
        let network = SimNetwork::new(ids.clone());
        let seq_kv = Arc::new(OutageKv::new("seq-kv"));
        let lin_kv = Arc::new(OutageKv::new("lin-kv"));

        let mut cluster = Self {
            network,
            seq_kv,
            lin_kv,
            nodes: Vec::new(),
        };
        for id in &ids {
            let node = cluster.spawn_node(id, config.clone());
            cluster.nodes.push(node);
        }
        for node in &cluster.nodes {
            node.start().await.expect("node start");
        }
        cluster
    }

    /// A broadcast/counter/log cluster with test timeouts.
    pub async fn with_workload(size: usize, workload: Workload) -> Self {
        Self::start(size, ReplicaConfig::for_testing(workload)).await
    }

    /// Create (but do not start) a node on this network and register it.
    pub fn spawn_node(&self, id: &str, config: ReplicaConfig) -> Arc<ReplicaService> {
        let node = Arc::new(ReplicaService::new(
            config,
            Arc::new(self.network.transport(id)),
            self.seq_kv.clone(),
            self.lin_kv.clone(),
        ));
        let handler: Arc<dyn Handler> = node.clone();
        self.network.register(id, &handler);
        node
    }

    /// Stop node `index` and bring up a fresh process in its place.
    pub async fn restart(&mut self, index: usize, config: ReplicaConfig) {
        self.nodes[index].shutdown().await;
        let id = self.nodes[index].node_id();
        let node = self.spawn_node(&id, config);
        node.start().await.expect("node restart");
        self.nodes[index] = node;
    }

    pub fn node(&self, index: usize) -> &Arc<ReplicaService> {
        &self.nodes[index]
    }

    /// Issue a client request to node `index` and unwrap its reply.
    pub async fn request(&self, index: usize, payload: Payload) -> Payload {
        self.nodes[index]
            .handle_request("c1", payload)
            .await
            .expect("request failed")
            .expect("request had no reply")
    }

    pub async fn broadcast(&self, index: usize, message: i64) {
        let reply = self.request(index, Payload::Broadcast { message }).await;
        assert_eq!(reply, Payload::BroadcastOk);
    }

    pub async fn read_messages(&self, index: usize) -> Vec<i64> {
        match self.request(index, Payload::Read { key: None }).await {
            Payload::ReadOk {
                messages: Some(messages),
                ..
            } => messages,
            other => panic!("Expected read_ok with messages, got {:?}", other),
        }
    }

    pub async fn add(&self, index: usize, delta: i64) {
        let reply = self.request(index, Payload::Add { delta }).await;
        assert_eq!(reply, Payload::AddOk);
    }

    pub async fn read_value(&self, index: usize) -> i64 {
        match self.request(index, Payload::Read { key: None }).await {
            Payload::ReadOk {
                value: Some(value), ..
            } => value,
            other => panic!("Expected read_ok with value, got {:?}", other),
        }
    }

    pub async fn send(&self, index: usize, key: &str, msg: i64) -> u64 {
        let payload = Payload::Send {
            key: key.to_string(),
            msg,
        };
        match self.request(index, payload).await {
            Payload::SendOk { offset } => offset,
            other => panic!("Expected send_ok, got {:?}", other),
        }
    }

    pub async fn poll(&self, index: usize, offsets: &[(&str, u64)]) -> BTreeMap<String, Vec<(u64, i64)>> {
        let payload = Payload::Poll {
            offsets: offsets_map(offsets),
        };
        match self.request(index, payload).await {
            Payload::PollOk { msgs } => msgs,
            other => panic!("Expected poll_ok, got {:?}", other),
        }
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

pub fn offsets_map(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
