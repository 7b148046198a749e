//! miso-raft: Raft consensus engine for replicated state machines.
//!
//! Keeps an ordered command log synchronized across a cluster and applies
//! committed commands to a user-supplied state machine in the same order on
//! every node, tolerating node failures and partitions while a majority
//! remains reachable. Features:
//! - Leader election with randomized timeouts
//! - Log replication with hint-based backtracking
//! - Quorum-based commitment with pluggable read/write quorum policies
//! - Heartbeat-driven failure detection
//! - Lifecycle/role/commit event subscriptions
//!
//! Based on the Raft paper (Ongaro & Ousterhout, 2014). Storage and
//! transport are injected behind narrow traits; in-memory implementations
//! of both ship with the crate.

pub mod apply;
pub mod config;
pub mod correlate;
pub mod election;
pub mod engine;
pub mod error;
pub mod event;
pub mod log;
pub mod quorum;
pub mod replication;
pub mod state;
pub mod timer;
pub mod transport;
pub mod types;

pub use apply::StateMachine;
pub use config::{CorrelationKind, EngineConfig};
pub use engine::RaftEngine;
pub use error::{RaftError, Result};
pub use event::{Event, EventKind, SubscriptionId};
pub use log::{LogStore, MemoryLog};
pub use quorum::{ConfiguredQuorum, Fixed, Majority, OpKind, QuorumStrategy};
pub use transport::{InMemoryTransport, Transport};
pub use types::*;

/// High-level handle to a replicated command log.
///
/// Implemented by [`RaftEngine`]; exists so applications can depend on the
/// capability rather than the engine type.
#[async_trait::async_trait]
pub trait CommandLog: Send + Sync {
    /// Replicate a command and return its state-machine outcome.
    ///
    /// Fails with `NotLeader` on non-leaders; the error carries a leader
    /// hint when one is known.
    async fn propose(&self, command: bytes::Bytes) -> Result<bytes::Bytes>;

    /// Query the state machine under the configured read-quorum policy.
    async fn read(&self, query: bytes::Bytes) -> Result<bytes::Bytes>;

    /// Whether this node currently believes it is the leader.
    fn is_leader(&self) -> bool;

    /// The current leader, if known.
    fn leader(&self) -> Option<NodeId>;
}

#[async_trait::async_trait]
impl CommandLog for RaftEngine {
    async fn propose(&self, command: bytes::Bytes) -> Result<bytes::Bytes> {
        RaftEngine::propose(self, command).await
    }

    async fn read(&self, query: bytes::Bytes) -> Result<bytes::Bytes> {
        RaftEngine::read(self, query).await
    }

    fn is_leader(&self) -> bool {
        RaftEngine::is_leader(self)
    }

    fn leader(&self) -> Option<NodeId> {
        RaftEngine::leader(self)
    }
}
