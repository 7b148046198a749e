//! Shared cluster harness: fully connected in-memory transports, one engine
//! per node, and a key-value state machine that records apply order.

use bytes::Bytes;
use miso_raft::correlate;
use miso_raft::transport::RpcReceiver;
use miso_raft::{
    ConfiguredQuorum, EngineConfig, InMemoryTransport, LogEntry, LogIndex, MemoryLog, NodeId,
    RaftEngine, StateMachine,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// `SET key value` state machine; queries are bare keys.
pub struct KvStore {
    pub data: HashMap<String, String>,
    /// Every index handed to `apply`, in arrival order.
    pub applied: Vec<LogIndex>,
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            applied: Vec::new(),
        }
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, index: LogIndex, command: &Bytes) -> Bytes {
        self.applied.push(index);
        let text = String::from_utf8_lossy(command);
        let mut parts = text.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("SET"), Some(key), Some(value)) => {
                self.data.insert(key.to_string(), value.to_string());
                Bytes::from("OK")
            }
            _ => Bytes::from("ERR bad command"),
        }
    }

    fn query(&self, query: &Bytes) -> Bytes {
        let key = String::from_utf8_lossy(query);
        match self.data.get(key.as_ref()) {
            Some(value) => Bytes::from(value.clone()),
            None => Bytes::new(),
        }
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub engine: Arc<RaftEngine>,
    pub transport: Arc<InMemoryTransport>,
    pub log: Arc<MemoryLog>,
    pub machine: Arc<Mutex<KvStore>>,
}

pub struct Cluster {
    pub nodes: Vec<TestNode>,
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Build a fully connected cluster. `tune` adjusts each node's config after
/// the test defaults are set.
pub fn build_cluster(ids: &[&str], tune: impl Fn(&mut EngineConfig)) -> Cluster {
    let node_ids: Vec<NodeId> = ids.iter().map(|id| NodeId::new(*id)).collect();

    let mut senders = HashMap::new();
    let mut receivers: HashMap<NodeId, RpcReceiver> = HashMap::new();
    for id in &node_ids {
        let (tx, rx) = mpsc::channel(256);
        senders.insert(id.clone(), tx);
        receivers.insert(id.clone(), rx);
    }

    let mut nodes = Vec::new();
    for id in &node_ids {
        let mut config = EngineConfig::new(id.clone(), node_ids.clone());
        config.election_timeout_min = Duration::from_millis(300);
        config.election_timeout_max = Duration::from_millis(600);
        config.heartbeat_interval = Duration::from_millis(50);
        config.rpc_timeout = Duration::from_millis(100);
        config.propose_timeout = Duration::from_millis(2000);
        tune(&mut config);

        let peers: HashMap<NodeId, _> = senders
            .iter()
            .filter(|(peer_id, _)| *peer_id != id)
            .map(|(peer_id, tx)| (peer_id.clone(), tx.clone()))
            .collect();

        let transport = Arc::new(InMemoryTransport::new(
            id.clone(),
            peers,
            correlate::from_kind(config.correlation),
            config.rpc_timeout,
        ));
        let log = Arc::new(MemoryLog::new());
        let machine = Arc::new(Mutex::new(KvStore::new()));
        let machine_dyn: Arc<Mutex<dyn StateMachine>> = machine.clone();

        let engine = Arc::new(
            RaftEngine::new(
                config.clone(),
                log.clone(),
                transport.clone(),
                Arc::new(ConfiguredQuorum::from_config(&config)),
                machine_dyn,
                receivers.remove(id).expect("receiver per node"),
            )
            .expect("valid test config"),
        );

        nodes.push(TestNode {
            id: id.clone(),
            engine,
            transport,
            log,
            machine,
        });
    }

    Cluster { nodes }
}

impl Cluster {
    pub async fn start_all(&self) {
        for node in &self.nodes {
            node.engine.start().await.expect("start");
        }
    }

    pub fn stop_all(&self) {
        for node in &self.nodes {
            node.engine.stop();
        }
    }

    /// Wait until the given subset agrees on a single leader; returns its
    /// position in `self.nodes`.
    pub async fn wait_for_leader_among(&self, subset: &[usize]) -> usize {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;

            let leaders: Vec<usize> = subset
                .iter()
                .copied()
                .filter(|&i| self.nodes[i].engine.is_leader())
                .collect();
            if leaders.len() != 1 {
                continue;
            }
            let leader = leaders[0];
            let leader_id = self.nodes[leader].id.clone();
            let term = self.nodes[leader].engine.current_term();

            let agreed = subset.iter().all(|&i| {
                self.nodes[i].engine.current_term() == term
                    && self.nodes[i].engine.leader() == Some(leader_id.clone())
            });
            if agreed {
                return leader;
            }
        }
        panic!("no stable leader emerged");
    }

    pub async fn wait_for_leader(&self) -> usize {
        let all: Vec<usize> = (0..self.nodes.len()).collect();
        self.wait_for_leader_among(&all).await
    }

    /// Cut both directions between `index` and the rest of the cluster.
    pub fn isolate(&self, index: usize) {
        self.nodes[index].transport.block_all();
        for (i, node) in self.nodes.iter().enumerate() {
            if i != index {
                node.transport.block_link(&self.nodes[index].id);
            }
        }
    }

    pub fn heal(&self, index: usize) {
        self.nodes[index].transport.unblock_all();
        for (i, node) in self.nodes.iter().enumerate() {
            if i != index {
                node.transport.unblock_link(&self.nodes[index].id);
            }
        }
    }

    /// Log matching property: wherever two logs both hold an index, the
    /// entries are identical.
    pub async fn assert_logs_match(&self) {
        for a in 0..self.nodes.len() {
            for b in (a + 1)..self.nodes.len() {
                let last = std::cmp::min(
                    last_index(&self.nodes[a]).await,
                    last_index(&self.nodes[b]).await,
                );
                let entries_a = entries_through(&self.nodes[a], last).await;
                let entries_b = entries_through(&self.nodes[b], last).await;
                assert_eq!(
                    entries_a, entries_b,
                    "logs of {} and {} diverge",
                    self.nodes[a].id, self.nodes[b].id
                );
            }
        }
    }

    /// Wait until every node's log and applied state converge to the same
    /// frontier.
    pub async fn wait_for_convergence(&self) {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;

            let mut frontiers = Vec::new();
            for node in &self.nodes {
                frontiers.push((last_index(node).await, node.engine.last_applied()));
            }
            let (last, applied) = frontiers[0];
            if last == applied && frontiers.iter().all(|f| *f == (last, applied)) {
                self.assert_logs_match().await;
                return;
            }
        }
        panic!("cluster never converged");
    }
}

pub async fn last_index(node: &TestNode) -> LogIndex {
    use miso_raft::LogStore;
    node.log.last_index().await
}

pub async fn entries_through(node: &TestNode, last: LogIndex) -> Vec<LogEntry> {
    use miso_raft::LogStore;
    node.log.range(LogIndex(1), last.next()).await.expect("log read")
}
