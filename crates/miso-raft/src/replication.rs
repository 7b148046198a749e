//! Log replication: follower catch-up and commit advancement.
//!
//! Leader-only logic. The heartbeat loop fans AppendEntries out to every
//! follower at a fixed interval (or immediately when poked after a propose
//! or an election win); each round updates per-follower progress and then
//! tries to advance the commit index under the write-quorum rule.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::time::interval;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::log::LogStore;
use crate::quorum::OpKind;
use crate::state::NodeState;
use crate::transport::Transport;
use crate::types::*;

/// Send one AppendEntries to `follower` and fold the response into its
/// progress. Returns `true` when the follower acknowledged up through what
/// was sent; `false` on rejection, transport failure, or lost leadership
/// (all retried on the next tick).
pub async fn replicate_to_follower(
    state: &Arc<NodeState>,
    follower: &NodeId,
    transport: &Arc<dyn Transport>,
    max_batch: usize,
) -> Result<bool> {
    let next_index = {
        let volatile = state.volatile_state().read();
        match volatile.leader.as_ref() {
            Some(leader) => leader
                .next_index
                .get(follower)
                .copied()
                .unwrap_or(LogIndex(1)),
            None => return Ok(false),
        }
    };

    // Consistency tag for the entry right before the batch.
    let prev_log_index = next_index.prev().unwrap_or(LogIndex::ZERO);
    let prev_log_term = if prev_log_index == LogIndex::ZERO {
        Term::ZERO
    } else {
        match state.log().term_at(prev_log_index).await? {
            Some(term) => term,
            None => {
                // The entries this follower needs were compacted away; it
                // cannot catch up from the log alone.
                tracing::warn!(
                    follower = %follower,
                    next_index = %next_index,
                    "follower behind compaction point, cannot replicate from log"
                );
                return Ok(false);
            }
        }
    };

    let last_log_index = state.log().last_index().await;
    let entries = if next_index <= last_log_index {
        let to = LogIndex((last_log_index.as_u64() + 1).min(next_index.as_u64() + max_batch as u64));
        state.log().range(next_index, to).await?
    } else {
        Vec::new() // heartbeat
    };

    let current_term = state.current_term();
    let sent_through = entries.last().map(|e| e.index).unwrap_or(prev_log_index);

    let request = AppendEntriesRequest {
        term: current_term,
        leader_id: state.node_id().clone(),
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit: state.commit_index(),
    };

    let response = match transport.append_entries(follower, request).await {
        Ok(response) => response,
        Err(error) => {
            tracing::debug!(follower = %follower, error = %error, "append-entries failed");
            return Ok(false);
        }
    };

    if response.term > current_term {
        state.observe_term(response.term);
        return Ok(false);
    }

    let mut volatile = state.volatile_state().write();
    let Some(leader) = volatile.leader.as_mut() else {
        return Ok(false);
    };

    if response.success {
        // Guard against a slow response from an earlier round regressing
        // the progress a newer round already recorded.
        let match_entry = leader
            .match_index
            .entry(follower.clone())
            .or_insert(LogIndex::ZERO);
        if sent_through > *match_entry {
            *match_entry = sent_through;
        }
        let next_entry = leader
            .next_index
            .entry(follower.clone())
            .or_insert(LogIndex(1));
        if sent_through.next() > *next_entry {
            *next_entry = sent_through.next();
        }
        Ok(true)
    } else {
        // Backtrack: jump to the follower's hint, capped by its log length.
        let retry_from = response
            .match_hint
            .map(|hint| hint.next())
            .unwrap_or_else(|| next_index.prev().unwrap_or(LogIndex(1)))
            .min(response.last_log_index.next())
            .max(LogIndex(1));

        let next_entry = leader
            .next_index
            .entry(follower.clone())
            .or_insert(LogIndex(1));
        if retry_from < *next_entry {
            *next_entry = retry_from;
        }
        tracing::debug!(
            follower = %follower,
            retry_from = %retry_from,
            "append-entries rejected, backtracking"
        );
        Ok(false)
    }
}

/// Advance the commit index to the highest entry replicated on a write
/// quorum, provided that entry is from the current term. Entries from prior
/// terms only commit transitively through it.
pub async fn advance_commit_index(state: &Arc<NodeState>) -> Result<bool> {
    let current_term = state.current_term();
    let current_commit = state.commit_index();
    let last_log_index = state.log().last_index().await;
    let needed = state.quorum_required(OpKind::Write);

    let acked_indices = {
        let volatile = state.volatile_state().read();
        match volatile.leader.as_ref() {
            Some(leader) => {
                let mut indices: Vec<LogIndex> = leader.match_index.values().copied().collect();
                indices.push(last_log_index); // the leader's own log
                indices
            }
            None => return Ok(false),
        }
    };

    let mut candidates: Vec<LogIndex> = acked_indices
        .iter()
        .filter(|&&idx| idx > current_commit)
        .copied()
        .collect();
    candidates.sort_unstable_by(|a, b| b.cmp(a));
    candidates.dedup();

    for candidate in candidates {
        let acks = acked_indices.iter().filter(|&&idx| idx >= candidate).count();
        if acks < needed {
            continue;
        }
        if state.log().term_at(candidate).await? == Some(current_term) {
            return Ok(state.advance_commit(candidate, current_term));
        }
        // Prior-term entry: must wait for a current-term entry above it.
        break;
    }

    Ok(false)
}

/// Leader heartbeat/replication driver.
///
/// Ticks at the heartbeat interval and also fires immediately when poked
/// (new proposal, fresh election win). A no-op while not leader.
pub async fn heartbeat_loop(
    state: Arc<NodeState>,
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    replicate_now: Arc<Notify>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = replicate_now.notified() => {}
            _ = shutdown_rx.recv() => {
                tracing::debug!("heartbeat loop shutting down");
                break;
            }
        }

        if state.role() != Role::Leader {
            continue;
        }

        let followers = state.view().others(state.node_id());
        let rounds = followers
            .iter()
            .map(|follower| {
                replicate_to_follower(&state, follower, &transport, config.max_entries_per_append)
            })
            .collect::<Vec<_>>();
        for result in join_all(rounds).await {
            if let Err(error) = result {
                tracing::error!(error = %error, "replication round failed");
            }
        }

        if let Err(error) = advance_commit_index(&state).await {
            tracing::error!(error = %error, "commit advancement failed");
        }
    }
}
