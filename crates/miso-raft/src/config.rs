//! Engine configuration (timeouts, quorum policy, log bounds).

use std::time::Duration;

use crate::error::{RaftError, Result};
use crate::types::{ClusterView, NodeId};

/// Which correlation strategy the engine should use for outbound RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationKind {
    /// Process-local monotonic counter. Cheap, unique per node lifetime.
    Sequence,
    /// Random v4 UUIDs, unique across restarts and nodes.
    Uuid,
}

/// Immutable engine configuration.
///
/// Validated once at engine construction; invalid combinations are rejected
/// immediately rather than surfacing later as protocol misbehavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's identity. Must appear in `members`.
    pub node_id: NodeId,

    /// Initial cluster membership, including this node.
    pub members: Vec<NodeId>,

    /// Lower bound of the randomized election timeout.
    ///
    /// Default: 300ms
    pub election_timeout_min: Duration,

    /// Upper bound of the randomized election timeout.
    ///
    /// Default: 600ms
    pub election_timeout_max: Duration,

    /// Leader heartbeat/replication interval. Must be well below
    /// `election_timeout_min` or followers will start spurious elections.
    ///
    /// Default: 75ms
    pub heartbeat_interval: Duration,

    /// Per-RPC deadline; a call that misses it is retried on the next tick.
    ///
    /// Default: 150ms
    pub rpc_timeout: Duration,

    /// How long `propose` waits for its entry to commit and apply.
    ///
    /// Default: 5000ms
    pub propose_timeout: Duration,

    /// When true, reads confirm leadership against a read quorum before
    /// serving; when false, the leader answers from local state immediately.
    ///
    /// Default: true
    pub require_read_quorum: bool,

    /// Fixed write-quorum size override; `None` means strict majority.
    pub write_quorum: Option<usize>,

    /// Fixed read-quorum size override; `None` means strict majority
    /// (only consulted when `require_read_quorum` is set).
    pub read_quorum: Option<usize>,

    /// Cap on entries carried by a single AppendEntries RPC.
    ///
    /// Default: 1000
    pub max_entries_per_append: usize,

    /// Applied-entry count above which the log is compacted down to the
    /// applied prefix.
    ///
    /// Default: 1,000,000
    pub max_log_entries: u64,

    /// Correlation id scheme for outbound RPCs.
    ///
    /// Default: Sequence
    pub correlation: CorrelationKind,
}

impl EngineConfig {
    /// Configuration with defaults for everything but identity and membership.
    pub fn new(node_id: NodeId, members: Vec<NodeId>) -> Self {
        Self {
            node_id,
            members,
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(75),
            rpc_timeout: Duration::from_millis(150),
            propose_timeout: Duration::from_millis(5000),
            require_read_quorum: true,
            write_quorum: None,
            read_quorum: None,
            max_entries_per_append: 1000,
            max_log_entries: 1_000_000,
            correlation: CorrelationKind::Sequence,
        }
    }

    /// Check configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(RaftError::InvalidConfig {
                reason: "member list is empty".to_string(),
            });
        }

        if !self.members.contains(&self.node_id) {
            return Err(RaftError::InvalidConfig {
                reason: format!("node {} is not in the member list", self.node_id),
            });
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig {
                reason: format!(
                    "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                    self.heartbeat_interval, self.election_timeout_min
                ),
            });
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::InvalidConfig {
                reason: format!(
                    "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                    self.election_timeout_min, self.election_timeout_max
                ),
            });
        }

        let cluster_size = ClusterView::new(self.members.clone()).len();
        for (name, quorum) in [("write_quorum", self.write_quorum), ("read_quorum", self.read_quorum)] {
            if let Some(q) = quorum {
                if q == 0 || q > cluster_size {
                    return Err(RaftError::InvalidConfig {
                        reason: format!("{name} ({q}) must be in 1..={cluster_size}"),
                    });
                }
            }
        }

        if self.max_entries_per_append == 0 {
            return Err(RaftError::InvalidConfig {
                reason: "max_entries_per_append must be > 0".to_string(),
            });
        }

        if self.max_log_entries == 0 {
            return Err(RaftError::InvalidConfig {
                reason: "max_log_entries must be > 0".to_string(),
            });
        }

        Ok(())
    }

    /// Random duration in `[election_timeout_min, election_timeout_max]`.
    ///
    /// Each arming draws fresh so competing candidates fall out of step.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(random_ms)
    }

    /// The membership view this configuration describes.
    pub fn initial_view(&self) -> ClusterView {
        ClusterView::new(self.members.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_config() -> EngineConfig {
        EngineConfig::new(
            NodeId::new("n1"),
            vec![NodeId::new("n1"), NodeId::new("n2"), NodeId::new("n3")],
        )
    }

    #[test]
    fn default_config_valid() {
        assert!(three_node_config().validate().is_ok());
    }

    #[test]
    fn rejects_heartbeat_not_below_election_timeout() {
        let mut config = three_node_config();
        config.heartbeat_interval = Duration::from_millis(400);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_election_timeout_range() {
        let mut config = three_node_config();
        config.election_timeout_min = Duration::from_millis(700);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_node_outside_membership() {
        let mut config = three_node_config();
        config.node_id = NodeId::new("stranger");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_quorum() {
        let mut config = three_node_config();
        config.write_quorum = Some(4);
        assert!(config.validate().is_err());

        config.write_quorum = Some(0);
        assert!(config.validate().is_err());

        config.write_quorum = Some(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn random_election_timeout_in_range() {
        let config = three_node_config();
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout <= config.election_timeout_max);
        }
    }
}
