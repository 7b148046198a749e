//! Node state machine: roles, terms, votes, and the RPC handlers.
//!
//! All mutable consensus state lives behind two locks (persistent and
//! volatile halves, split the way the Raft paper splits them). Every
//! transition (timer fire, RPC arrival, response arrival, client write)
//! takes the locks for the duration of the transition and never across an
//! `.await`, which is what makes a term check and the transition it causes
//! atomic with respect to every other incoming event. Log and transport
//! calls happen outside the locks; their completions re-enter as new
//! transitions.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::config::EngineConfig;
use crate::error::{RaftError, Result};
use crate::event::{Event, EventNotifier};
use crate::log::LogStore;
use crate::quorum::{OpKind, QuorumStrategy};
use crate::timer::ElectionTimer;
use crate::types::*;

/// A client write waiting for its entry to commit and apply.
pub struct PendingRequest {
    /// Term the entry was appended under; a mismatch at apply time means the
    /// slot was overwritten by another leader.
    pub term: Term,
    pub tx: oneshot::Sender<Result<Bytes>>,
}

/// Leader-only bookkeeping, created on winning an election and discarded on
/// losing leadership.
pub struct LeaderState {
    /// Next log index to send each follower.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Highest index known replicated on each follower.
    pub match_index: HashMap<NodeId, LogIndex>,
    /// Client writes awaiting commitment, keyed by log index.
    pub pending: HashMap<LogIndex, PendingRequest>,
}

impl LeaderState {
    fn new(view: &ClusterView, node_id: &NodeId, last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for member in view.others(node_id) {
            next_index.insert(member.clone(), last_log_index.next());
            match_index.insert(member, LogIndex::ZERO);
        }
        Self {
            next_index,
            match_index,
            pending: HashMap::new(),
        }
    }
}

struct PersistentState {
    current_term: Term,
    voted_for: Option<NodeId>,
}

pub struct VolatileState {
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub view: ClusterView,
    pub leader: Option<LeaderState>,
}

/// Per-node consensus state and transition logic.
pub struct NodeState {
    node_id: NodeId,
    persistent: RwLock<PersistentState>,
    volatile: RwLock<VolatileState>,
    log: Arc<dyn LogStore>,
    quorum: Arc<dyn QuorumStrategy>,
    timer: Arc<ElectionTimer>,
    notifier: Arc<EventNotifier>,
}

impl NodeState {
    pub fn new(
        config: EngineConfig,
        log: Arc<dyn LogStore>,
        quorum: Arc<dyn QuorumStrategy>,
        timer: Arc<ElectionTimer>,
        notifier: Arc<EventNotifier>,
    ) -> Self {
        let view = config.initial_view();
        Self {
            node_id: config.node_id,
            persistent: RwLock::new(PersistentState {
                current_term: Term::ZERO,
                voted_for: None,
            }),
            volatile: RwLock::new(VolatileState {
                role: Role::Follower,
                leader_id: None,
                commit_index: LogIndex::ZERO,
                last_applied: LogIndex::ZERO,
                view,
                leader: None,
            }),
            log,
            quorum,
            timer,
            notifier,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn role(&self) -> Role {
        self.volatile.read().role
    }

    pub fn current_term(&self) -> Term {
        self.persistent.read().current_term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.volatile.read().leader_id.clone()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.volatile.read().commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.volatile.read().last_applied
    }

    pub fn view(&self) -> ClusterView {
        self.volatile.read().view.clone()
    }

    pub fn log(&self) -> &Arc<dyn LogStore> {
        &self.log
    }

    pub fn quorum_required(&self, op: OpKind) -> usize {
        let volatile = self.volatile.read();
        self.quorum.required(&volatile.view, op)
    }

    pub fn volatile_state(&self) -> &RwLock<VolatileState> {
        &self.volatile
    }

    #[cfg(test)]
    pub fn set_current_term(&self, term: Term) {
        self.persistent.write().current_term = term;
    }

    /// Handle a RequestVote RPC.
    pub async fn handle_vote_request(&self, request: VoteRequest) -> VoteResponse {
        // Log position read before the locks; only this node appends to its
        // own log, and never concurrently with vote handling.
        let last_log_term = self.log.last_term().await;
        let last_log_index = self.log.last_index().await;

        let mut persistent = self.persistent.write();
        let mut volatile = self.volatile.write();

        if request.term > persistent.current_term {
            self.step_down_inner(&mut persistent, &mut volatile, request.term);
        }

        let mut granted = false;
        if request.term >= persistent.current_term {
            let voted_elsewhere = persistent
                .voted_for
                .as_ref()
                .map_or(false, |id| id != &request.candidate_id);

            if !voted_elsewhere {
                // Up-to-dateness: compare last entry term, then index.
                let log_ok = request.last_log_term > last_log_term
                    || (request.last_log_term == last_log_term
                        && request.last_log_index >= last_log_index);

                if log_ok {
                    granted = true;
                    persistent.voted_for = Some(request.candidate_id.clone());
                    self.timer.reset();
                }
            }
        }

        tracing::debug!(
            term = %persistent.current_term,
            candidate = %request.candidate_id,
            granted,
            "vote request"
        );

        VoteResponse {
            term: persistent.current_term,
            granted,
        }
    }

    /// Handle an AppendEntries RPC (replication or heartbeat).
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        // Phase 1: term accounting and leadership acceptance, under lock.
        let (current_term, rejected) = {
            let mut persistent = self.persistent.write();
            let mut volatile = self.volatile.write();

            if request.term > persistent.current_term {
                self.step_down_inner(&mut persistent, &mut volatile, request.term);
            }

            let rejected = request.term < persistent.current_term;
            if !rejected {
                volatile.leader_id = Some(request.leader_id.clone());
                if volatile.role != Role::Follower {
                    // Another leader established itself in this term.
                    if volatile.role == Role::Leader {
                        tracing::warn!(
                            term = %persistent.current_term,
                            leader = %request.leader_id,
                            "stepping down: append-entries from a peer leader"
                        );
                    }
                    self.demote_inner(&mut volatile, persistent.current_term);
                }
                self.timer.reset();
            }

            (persistent.current_term, rejected)
        };

        if rejected {
            let last_log_index = self.log.last_index().await;
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                match_hint: None,
                last_log_index,
            });
        }

        // Phase 2: consistency check at (prev_log_index, prev_log_term).
        let last_log_index = self.log.last_index().await;
        let log_ok = if request.prev_log_index == LogIndex::ZERO {
            true
        } else {
            self.log.term_at(request.prev_log_index).await? == Some(request.prev_log_term)
        };

        if !log_ok {
            // Hint the highest index worth retrying from.
            let hint = request
                .prev_log_index
                .prev()
                .map(|p| p.min(last_log_index))
                .unwrap_or(LogIndex::ZERO);
            tracing::debug!(
                prev_index = %request.prev_log_index,
                hint = %hint,
                "append-entries consistency check failed"
            );
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                match_hint: Some(hint),
                last_log_index,
            });
        }

        // Phase 3: append, truncating a conflicting suffix first. Entries
        // the log already holds with the right term are skipped so a
        // retransmission never discards a longer valid suffix.
        let mut to_append = Vec::new();
        let mut conflict_at = None;
        for entry in &request.entries {
            match self.log.term_at(entry.index).await? {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    conflict_at = Some(entry.index);
                    to_append = request
                        .entries
                        .iter()
                        .filter(|e| e.index >= entry.index)
                        .cloned()
                        .collect();
                    break;
                }
                None => {
                    to_append = request
                        .entries
                        .iter()
                        .filter(|e| e.index >= entry.index)
                        .cloned()
                        .collect();
                    break;
                }
            }
        }

        if let Some(index) = conflict_at {
            tracing::debug!(from = %index, "truncating conflicting log suffix");
            self.log.truncate_from(index).await?;
        }
        if !to_append.is_empty() {
            self.log.append_batch(to_append).await?;
        }

        // Phase 4: follow the leader's commit index.
        let last_new_index = self.log.last_index().await;
        self.advance_commit(request.leader_commit.min(last_new_index), current_term);

        Ok(AppendEntriesResponse {
            term: current_term,
            success: true,
            match_hint: None,
            last_log_index: last_new_index,
        })
    }

    /// Election timeout fired: become candidate for the next term.
    ///
    /// Returns the vote request parameters, or `None` when this node is
    /// already leader (stale timer fire).
    pub async fn start_election(&self) -> Option<(Term, LogIndex, Term)> {
        let last_log_index = self.log.last_index().await;
        let last_log_term = self.log.last_term().await;

        let mut persistent = self.persistent.write();
        let mut volatile = self.volatile.write();

        if volatile.role == Role::Leader {
            return None;
        }

        persistent.current_term = persistent.current_term.next();
        persistent.voted_for = Some(self.node_id.clone());
        volatile.role = Role::Candidate;
        volatile.leader_id = None;
        self.timer.reset();

        let term = persistent.current_term;
        self.notifier.publish(Event::TermChanged { term });
        self.notifier.publish(Event::RoleChanged {
            term,
            role: Role::Candidate,
        });
        tracing::info!(term = %term, "election started");

        Some((term, last_log_index, last_log_term))
    }

    /// Quorum of votes arrived: take leadership for `term`.
    ///
    /// Appends the term-anchoring no-op entry. Returns `false` when the
    /// candidacy was already lost (term moved on or role changed).
    pub async fn become_leader(&self, term: Term) -> Result<bool> {
        let last_log_index = self.log.last_index().await;

        {
            let persistent = self.persistent.read();
            let mut volatile = self.volatile.write();

            if persistent.current_term != term || volatile.role != Role::Candidate {
                return Ok(false);
            }

            volatile.role = Role::Leader;
            volatile.leader_id = Some(self.node_id.clone());
            volatile.leader = Some(LeaderState::new(&volatile.view, &self.node_id, last_log_index));
            self.timer.disarm();

            self.notifier.publish(Event::RoleChanged {
                term,
                role: Role::Leader,
            });
            self.notifier.publish(Event::LeaderElected {
                term,
                leader: self.node_id.clone(),
            });
        }

        tracing::info!(term = %term, "became leader");

        // Anchor the new term: entries from prior terms only commit
        // transitively once this one does.
        self.log
            .append(LogEntry::noop(term, last_log_index.next()))
            .await?;

        Ok(true)
    }

    /// Raise the commit index to `index` if that is an advance.
    ///
    /// The commit index never regresses and never exceeds the local log,
    /// which callers guarantee by construction.
    pub fn advance_commit(&self, index: LogIndex, term: Term) -> bool {
        {
            let mut volatile = self.volatile.write();
            if index <= volatile.commit_index {
                return false;
            }
            volatile.commit_index = index;
        }
        self.notifier.publish(Event::EntryCommitted { index, term });
        true
    }

    /// Adopt `term` if it is newer, stepping down to follower.
    pub fn observe_term(&self, term: Term) {
        let mut persistent = self.persistent.write();
        let mut volatile = self.volatile.write();
        if term > persistent.current_term {
            self.step_down_inner(&mut persistent, &mut volatile, term);
        }
    }

    /// Replace the membership view (cluster reconfiguration).
    pub fn update_members(&self, view: ClusterView) {
        {
            let mut volatile = self.volatile.write();
            volatile.view = view.clone();
            if let Some(leader) = volatile.leader.as_mut() {
                leader.next_index.retain(|id, _| view.contains(id));
                leader.match_index.retain(|id, _| view.contains(id));
                for member in view.others(&self.node_id) {
                    leader.next_index.entry(member.clone()).or_insert(LogIndex(1));
                    leader.match_index.entry(member).or_insert(LogIndex::ZERO);
                }
            }
        }

        self.notifier.publish(Event::MembershipChanged {
            members: view.members().to_vec(),
        });
        tracing::info!(members = view.len(), "membership updated");
    }

    /// Record a client write awaiting commitment at `index`.
    pub fn register_pending(
        &self,
        index: LogIndex,
        term: Term,
        tx: oneshot::Sender<Result<Bytes>>,
    ) -> Result<()> {
        let mut volatile = self.volatile.write();
        match volatile.leader.as_mut() {
            Some(leader) => {
                leader.pending.insert(index, PendingRequest { term, tx });
                Ok(())
            }
            None => Err(RaftError::NotLeader {
                leader: volatile.leader_id.clone(),
            }),
        }
    }

    /// Abandon the pending request at `index` (propose timed out).
    pub fn drop_pending(&self, index: LogIndex) {
        let mut volatile = self.volatile.write();
        if let Some(leader) = volatile.leader.as_mut() {
            leader.pending.remove(&index);
        }
    }

    /// Acknowledgment count for `index`: the leader plus every follower
    /// whose match index covers it.
    pub fn write_acks_at(&self, index: LogIndex) -> usize {
        let volatile = self.volatile.read();
        match volatile.leader.as_ref() {
            Some(leader) => {
                1 + leader
                    .match_index
                    .values()
                    .filter(|m| **m >= index)
                    .count()
            }
            None => 0,
        }
    }

    /// Mark `index` applied, resolving its pending request if any.
    ///
    /// Called by the applier strictly in index order.
    pub fn mark_applied(&self, index: LogIndex, term: Term, outcome: Option<Bytes>) {
        let mut volatile = self.volatile.write();
        debug_assert_eq!(index, volatile.last_applied.next(), "apply order violated");
        volatile.last_applied = index;

        if let Some(leader) = volatile.leader.as_mut() {
            if let Some(pending) = leader.pending.remove(&index) {
                let reply = if pending.term == term {
                    Ok(outcome.unwrap_or_default())
                } else {
                    // Slot was overwritten by a different leader's entry.
                    Err(RaftError::NotLeader {
                        leader: volatile.leader_id.clone(),
                    })
                };
                let _ = pending.tx.send(reply);
            }
        }

        self.notifier.publish(Event::EntryApplied { index, term });
    }

    /// Fail every pending request with `Stopped` (engine shutdown).
    pub fn fail_pending_stopped(&self) {
        let mut volatile = self.volatile.write();
        if let Some(leader) = volatile.leader.as_mut() {
            for (_, pending) in leader.pending.drain() {
                let _ = pending.tx.send(Err(RaftError::Stopped));
            }
        }
    }

    /// Step down to follower because a higher term was observed.
    ///
    /// Both locks must be held by the caller.
    fn step_down_inner(
        &self,
        persistent: &mut PersistentState,
        volatile: &mut VolatileState,
        new_term: Term,
    ) {
        tracing::debug!(
            old_term = %persistent.current_term,
            new_term = %new_term,
            role = %volatile.role,
            "adopting higher term"
        );
        persistent.current_term = new_term;
        persistent.voted_for = None;
        self.notifier.publish(Event::TermChanged { term: new_term });

        volatile.leader_id = None;
        self.demote_inner(volatile, new_term);
        self.timer.reset();
    }

    /// Demote to follower within the current term, failing pending writes.
    fn demote_inner(&self, volatile: &mut VolatileState, term: Term) {
        if volatile.role == Role::Follower {
            return;
        }
        tracing::info!(term = %term, from = %volatile.role, "stepping down to follower");
        volatile.role = Role::Follower;
        if let Some(mut leader) = volatile.leader.take() {
            for (_, pending) in leader.pending.drain() {
                let _ = pending.tx.send(Err(RaftError::NotLeader {
                    leader: volatile.leader_id.clone(),
                }));
            }
        }
        self.timer.reset();
        self.notifier.publish(Event::RoleChanged {
            term,
            role: Role::Follower,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::log::MemoryLog;
    use crate::quorum::Majority;

    fn test_state() -> Arc<NodeState> {
        let config = EngineConfig::new(
            NodeId::new("n1"),
            vec![NodeId::new("n1"), NodeId::new("n2"), NodeId::new("n3")],
        );
        let timer = Arc::new(ElectionTimer::new(config.clone()));
        Arc::new(NodeState::new(
            config,
            Arc::new(MemoryLog::new()),
            Arc::new(Majority),
            timer,
            Arc::new(EventNotifier::new()),
        ))
    }

    #[tokio::test]
    async fn initial_state_is_follower() {
        let state = test_state();
        assert_eq!(state.role(), Role::Follower);
        assert_eq!(state.current_term(), Term::ZERO);
        assert_eq!(state.leader(), None);
        assert_eq!(state.commit_index(), LogIndex::ZERO);
    }

    #[tokio::test]
    async fn grants_vote_to_up_to_date_candidate() {
        let state = test_state();

        let response = state
            .handle_vote_request(VoteRequest {
                term: Term(5),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .await;

        assert!(response.granted);
        assert_eq!(response.term, Term(5));
        assert_eq!(state.current_term(), Term(5));
    }

    #[tokio::test]
    async fn rejects_stale_term_vote() {
        let state = test_state();
        state.set_current_term(Term(10));

        let response = state
            .handle_vote_request(VoteRequest {
                term: Term(5),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .await;

        assert!(!response.granted);
        assert_eq!(response.term, Term(10));
    }

    #[tokio::test]
    async fn votes_at_most_once_per_term() {
        let state = test_state();

        let first = state
            .handle_vote_request(VoteRequest {
                term: Term(3),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .await;
        assert!(first.granted);

        let second = state
            .handle_vote_request(VoteRequest {
                term: Term(3),
                candidate_id: NodeId::new("n3"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .await;
        assert!(!second.granted);

        // The same candidate asking again is re-granted (idempotent).
        let repeat = state
            .handle_vote_request(VoteRequest {
                term: Term(3),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .await;
        assert!(repeat.granted);
    }

    #[tokio::test]
    async fn rejects_candidate_with_stale_log() {
        let state = test_state();
        state
            .log()
            .append(LogEntry::new(Term(2), LogIndex(1), Bytes::from("x")))
            .await
            .unwrap();

        // Candidate's last log term is older.
        let response = state
            .handle_vote_request(VoteRequest {
                term: Term(3),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex(5),
                last_log_term: Term(1),
            })
            .await;
        assert!(!response.granted);

        // Same term but shorter log.
        let response = state
            .handle_vote_request(VoteRequest {
                term: Term(4),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term(2),
            })
            .await;
        assert!(!response.granted);
    }

    #[tokio::test]
    async fn heartbeat_accepts_leader_and_term() {
        let state = test_state();

        let response = state
            .handle_append_entries(AppendEntriesRequest {
                term: Term(2),
                leader_id: NodeId::new("n2"),
                prev_log_index: LogIndex::ZERO,
                prev_log_term: Term::ZERO,
                entries: vec![],
                leader_commit: LogIndex::ZERO,
            })
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(state.current_term(), Term(2));
        assert_eq!(state.leader(), Some(NodeId::new("n2")));
    }

    #[tokio::test]
    async fn append_entries_rejects_stale_leader() {
        let state = test_state();
        state.set_current_term(Term(7));

        let response = state
            .handle_append_entries(AppendEntriesRequest {
                term: Term(3),
                leader_id: NodeId::new("n2"),
                prev_log_index: LogIndex::ZERO,
                prev_log_term: Term::ZERO,
                entries: vec![],
                leader_commit: LogIndex::ZERO,
            })
            .await
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.term, Term(7));
        // Stale leader never captured leadership.
        assert_eq!(state.leader(), None);
    }

    #[tokio::test]
    async fn append_entries_detects_gap() {
        let state = test_state();

        let response = state
            .handle_append_entries(AppendEntriesRequest {
                term: Term(1),
                leader_id: NodeId::new("n2"),
                prev_log_index: LogIndex(5),
                prev_log_term: Term(1),
                entries: vec![LogEntry::new(Term(1), LogIndex(6), Bytes::from("x"))],
                leader_commit: LogIndex::ZERO,
            })
            .await
            .unwrap();

        assert!(!response.success);
        // Empty log: retry from the start.
        assert_eq!(response.match_hint, Some(LogIndex::ZERO));
    }

    #[tokio::test]
    async fn append_entries_truncates_conflicting_suffix() {
        let state = test_state();

        // Local log has uncommitted entries from term 1.
        for i in 1..=3 {
            state
                .log()
                .append(LogEntry::new(Term(1), LogIndex(i), Bytes::from("old")))
                .await
                .unwrap();
        }

        // New leader (term 2) replaces indices 2..=3.
        let response = state
            .handle_append_entries(AppendEntriesRequest {
                term: Term(2),
                leader_id: NodeId::new("n2"),
                prev_log_index: LogIndex(1),
                prev_log_term: Term(1),
                entries: vec![
                    LogEntry::new(Term(2), LogIndex(2), Bytes::from("new2")),
                    LogEntry::new(Term(2), LogIndex(3), Bytes::from("new3")),
                ],
                leader_commit: LogIndex(1),
            })
            .await
            .unwrap();

        assert!(response.success);
        let entry = state.log().entry_at(LogIndex(2)).await.unwrap().unwrap();
        assert_eq!(entry.term, Term(2));
        assert_eq!(entry.command, Bytes::from("new2"));
        assert_eq!(state.log().last_index().await, LogIndex(3));
        assert_eq!(state.commit_index(), LogIndex(1));
    }

    #[tokio::test]
    async fn append_entries_is_idempotent_for_matching_entries() {
        let state = test_state();

        let entries = vec![
            LogEntry::new(Term(1), LogIndex(1), Bytes::from("a")),
            LogEntry::new(Term(1), LogIndex(2), Bytes::from("b")),
        ];

        for _ in 0..2 {
            let response = state
                .handle_append_entries(AppendEntriesRequest {
                    term: Term(1),
                    leader_id: NodeId::new("n2"),
                    prev_log_index: LogIndex::ZERO,
                    prev_log_term: Term::ZERO,
                    entries: entries.clone(),
                    leader_commit: LogIndex::ZERO,
                })
                .await
                .unwrap();
            assert!(response.success);
        }

        assert_eq!(state.log().last_index().await, LogIndex(2));
    }

    #[tokio::test]
    async fn commit_index_never_exceeds_local_log() {
        let state = test_state();
        state
            .log()
            .append(LogEntry::new(Term(1), LogIndex(1), Bytes::from("a")))
            .await
            .unwrap();

        let response = state
            .handle_append_entries(AppendEntriesRequest {
                term: Term(1),
                leader_id: NodeId::new("n2"),
                prev_log_index: LogIndex(1),
                prev_log_term: Term(1),
                entries: vec![],
                leader_commit: LogIndex(10),
            })
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(state.commit_index(), LogIndex(1));
    }

    #[tokio::test]
    async fn election_increments_term_and_votes_self() {
        let state = test_state();

        let (term, last_index, last_term) = state.start_election().await.unwrap();
        assert_eq!(term, Term(1));
        assert_eq!(last_index, LogIndex::ZERO);
        assert_eq!(last_term, Term::ZERO);
        assert_eq!(state.role(), Role::Candidate);

        // Having voted for itself, it refuses other candidates this term.
        let response = state
            .handle_vote_request(VoteRequest {
                term: Term(1),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .await;
        assert!(!response.granted);
    }

    #[tokio::test]
    async fn become_leader_appends_noop_and_initializes_progress() {
        let state = test_state();

        let (term, _, _) = state.start_election().await.unwrap();
        assert!(state.become_leader(term).await.unwrap());

        assert_eq!(state.role(), Role::Leader);
        assert_eq!(state.leader(), Some(NodeId::new("n1")));

        let noop = state.log().entry_at(LogIndex(1)).await.unwrap().unwrap();
        assert_eq!(noop.kind, EntryKind::Noop);
        assert_eq!(noop.term, term);

        let volatile = state.volatile_state().read();
        let leader = volatile.leader.as_ref().unwrap();
        assert_eq!(leader.next_index.len(), 2);
        assert_eq!(leader.match_index.len(), 2);
    }

    #[tokio::test]
    async fn become_leader_refused_after_term_moves_on() {
        let state = test_state();

        let (term, _, _) = state.start_election().await.unwrap();
        state.observe_term(term.next());

        assert!(!state.become_leader(term).await.unwrap());
        assert_eq!(state.role(), Role::Follower);
    }

    #[tokio::test]
    async fn higher_term_fails_pending_requests() {
        let state = test_state();

        let (term, _, _) = state.start_election().await.unwrap();
        state.become_leader(term).await.unwrap();

        let (tx, rx) = oneshot::channel();
        state.register_pending(LogIndex(2), term, tx).unwrap();

        state.observe_term(term.next());

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(RaftError::NotLeader { .. })));
        assert_eq!(state.role(), Role::Follower);
    }

    #[tokio::test]
    async fn mark_applied_resolves_pending_with_outcome() {
        let state = test_state();

        let (term, _, _) = state.start_election().await.unwrap();
        state.become_leader(term).await.unwrap();

        let (tx, rx) = oneshot::channel();
        state.register_pending(LogIndex(1), term, tx).unwrap();

        state.mark_applied(LogIndex(1), term, Some(Bytes::from("done")));

        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from("done"));
        assert_eq!(state.last_applied(), LogIndex(1));
    }

    #[tokio::test]
    async fn membership_update_extends_leader_progress() {
        let state = test_state();

        let (term, _, _) = state.start_election().await.unwrap();
        state.become_leader(term).await.unwrap();

        state.update_members(ClusterView::new(vec![
            NodeId::new("n1"),
            NodeId::new("n2"),
            NodeId::new("n3"),
            NodeId::new("n4"),
        ]));

        let volatile = state.volatile_state().read();
        let leader = volatile.leader.as_ref().unwrap();
        assert!(leader.next_index.contains_key(&NodeId::new("n4")));
        assert_eq!(leader.next_index.len(), 3);
    }
}
