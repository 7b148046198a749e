//! Quorum policies for writes, elections, and strict reads.
//!
//! A quorum strategy is pure policy: given the current membership view and
//! an operation class, it answers how many affirmative members are required.
//! It holds no state and must be deterministic for a given view, so the
//! consensus engine can consult it synchronously from inside a transition.

use crate::config::EngineConfig;
use crate::types::ClusterView;

/// Operation class a quorum is being computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

/// Minimum acknowledgment count per operation class.
///
/// The write quorum also governs elections: a candidate becomes leader once
/// that many distinct members (itself included) grant their vote.
pub trait QuorumStrategy: Send + Sync {
    fn required(&self, view: &ClusterView, op: OpKind) -> usize;
}

/// Strict majority for both classes. The safe default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Majority;

impl QuorumStrategy for Majority {
    fn required(&self, view: &ClusterView, _op: OpKind) -> usize {
        view.majority()
    }
}

/// A fixed acknowledgment count, clamped to the view size.
///
/// Sizes below majority trade durability for latency; the cluster operator
/// owns that call.
#[derive(Debug, Clone, Copy)]
pub struct Fixed {
    pub size: usize,
}

impl QuorumStrategy for Fixed {
    fn required(&self, view: &ClusterView, _op: OpKind) -> usize {
        self.size.clamp(1, view.len().max(1))
    }
}

/// The policy described by an [`EngineConfig`]: per-class fixed overrides
/// falling back to majority, with relaxed (leader-only) reads when
/// `require_read_quorum` is off.
#[derive(Debug, Clone, Copy)]
pub struct ConfiguredQuorum {
    write: Option<usize>,
    read: Option<usize>,
    require_read_quorum: bool,
}

impl ConfiguredQuorum {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            write: config.write_quorum,
            read: config.read_quorum,
            require_read_quorum: config.require_read_quorum,
        }
    }
}

impl QuorumStrategy for ConfiguredQuorum {
    fn required(&self, view: &ClusterView, op: OpKind) -> usize {
        let fixed = match op {
            OpKind::Write => self.write,
            OpKind::Read => {
                if !self.require_read_quorum {
                    return 1;
                }
                self.read
            }
        };
        match fixed {
            Some(size) => Fixed { size }.required(view, op),
            None => view.majority(),
        }
    }
}
