//! Core types: terms, log indices, entries, roles, RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Election epoch (monotonically increasing).
///
/// Terms are the logical clock of the protocol. Each term has at most one
/// leader; a node increments its term when it starts an election and adopts
/// any higher term it observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log position (1-indexed, 0 is the "before the log" sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Cluster member identity.
///
/// A string so deployments can use DNS names, UUIDs, or host:port pairs;
/// the transport resolves it to an actual address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry payload discriminator.
///
/// `Noop` entries are appended by a freshly elected leader to anchor its
/// term in the log; they never reach the user state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Normal,
    Noop,
}

/// A single replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub kind: EntryKind,
    pub command: Bytes,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Bytes) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Normal,
            command,
        }
    }

    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Noop,
            command: Bytes::new(),
        }
    }
}

/// Node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// The set of cluster members as currently known.
///
/// Owned by the node state machine; replication reads it to enumerate
/// followers. The view can be replaced at runtime for membership changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    members: Vec<NodeId>,
}

impl ClusterView {
    pub fn new(mut members: Vec<NodeId>) -> Self {
        members.sort();
        members.dedup();
        Self { members }
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.iter().any(|m| m == id)
    }

    /// All members except `id` (the replication fan-out set).
    pub fn others(&self, id: &NodeId) -> Vec<NodeId> {
        self.members.iter().filter(|m| *m != id).cloned().collect()
    }

    /// Strict majority of the view.
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

/// RequestVote RPC.
///
/// Sent by a candidate to every other member; carries the candidate's last
/// log position so voters can enforce the up-to-dateness check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Voter's term, for the candidate to update itself.
    pub term: Term,
    pub granted: bool,
}

/// AppendEntries RPC (replication and heartbeat; empty `entries` = heartbeat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On rejection, the follower's hint for where the leader should resume.
    pub match_hint: Option<LogIndex>,
    /// Follower's last log index, caps the hint.
    pub last_log_index: LogIndex,
}

/// Tagged union of the RPC requests a node can receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    Vote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
}

/// Tagged union of the corresponding responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    Vote(VoteResponse),
    AppendEntries(AppendEntriesResponse),
}
