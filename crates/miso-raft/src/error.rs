//! Engine error types.

use thiserror::Error;

use crate::types::NodeId;

/// Errors surfaced by the consensus engine.
///
/// Protocol-internal conditions (stale terms, log mismatches, per-RPC
/// timeouts) are resolved by state transitions and retries and never appear
/// here; clients only ever see `NotLeader`, `NoQuorum`, `CommitTimeout`,
/// `Stopped`, or their command's own result.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader; the caller should retry against `leader` if known.
    #[error("not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// Quorum could not be reached for a write or strict read.
    #[error("no quorum (need {needed}, acked {acked})")]
    NoQuorum { needed: usize, acked: usize },

    /// A proposed entry did not commit within the configured window.
    #[error("commit timeout after {elapsed_ms}ms")]
    CommitTimeout { elapsed_ms: u64 },

    /// The engine is shut down or shutting down.
    #[error("engine stopped")]
    Stopped,

    /// Rejected configuration (caught at construction, never lazily).
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Transport failure for a single RPC; retried on the next tick.
    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: std::io::Error,
    },

    /// Durable storage failure. Fatal to this node.
    #[error("storage error: {reason}")]
    Storage { reason: String },

    /// Invariant violation (bug).
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

pub type Result<T> = std::result::Result<T, RaftError>;
