//! Leader election: timeout-driven candidacy and vote tallying.
//!
//! The election loop waits on the election timer. Each expiry runs one
//! election round: bump the term, vote for self, fan the vote request out to
//! every peer, and count grants as responses arrive. Reaching the write
//! quorum promotes to leader; observing a higher term aborts the candidacy;
//! anything else leaves the node a candidate for the next, re-randomized
//! timeout.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

use crate::quorum::OpKind;
use crate::state::NodeState;
use crate::transport::Transport;
use crate::types::*;

pub async fn election_loop(
    state: Arc<NodeState>,
    transport: Arc<dyn Transport>,
    replicate_now: Arc<Notify>,
    mut timeout_rx: broadcast::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            fired = timeout_rx.recv() => match fired {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    run_election(&state, &transport, &replicate_now).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_rx.recv() => {
                tracing::debug!("election loop shutting down");
                break;
            }
        }
    }
}

/// One election round for one new term.
async fn run_election(
    state: &Arc<NodeState>,
    transport: &Arc<dyn Transport>,
    replicate_now: &Notify,
) {
    let Some((term, last_log_index, last_log_term)) = state.start_election().await else {
        return;
    };

    let needed = state.quorum_required(OpKind::Write);
    let peers = state.view().others(state.node_id());

    // Own vote. Enough on its own in single-node clusters or with a
    // relaxed write quorum.
    let mut granted = 1usize;
    if granted >= needed {
        take_leadership(state, term, replicate_now).await;
        return;
    }

    let mut votes = FuturesUnordered::new();
    for peer in peers {
        let transport = transport.clone();
        let request = VoteRequest {
            term,
            candidate_id: state.node_id().clone(),
            last_log_index,
            last_log_term,
        };
        votes.push(async move {
            let result = transport.vote(&peer, request).await;
            (peer, result)
        });
    }

    // One response per peer: grants are distinct by construction.
    while let Some((peer, result)) = votes.next().await {
        if state.current_term() != term || state.role() != Role::Candidate {
            return;
        }

        match result {
            Ok(response) => {
                if response.term > term {
                    state.observe_term(response.term);
                    return;
                }
                if response.granted {
                    granted += 1;
                    tracing::debug!(term = %term, from = %peer, granted, needed, "vote granted");
                    if granted >= needed {
                        take_leadership(state, term, replicate_now).await;
                        return;
                    }
                }
            }
            Err(error) => {
                // Unreachable peer; the next timeout retries with a new term.
                tracing::debug!(term = %term, peer = %peer, error = %error, "vote request failed");
            }
        }
    }

    tracing::debug!(term = %term, granted, needed, "election ended without quorum");
}

async fn take_leadership(state: &Arc<NodeState>, term: Term, replicate_now: &Notify) {
    match state.become_leader(term).await {
        Ok(true) => {
            // Announce immediately instead of waiting out a heartbeat tick.
            replicate_now.notify_one();
        }
        Ok(false) => {}
        Err(error) => {
            tracing::error!(term = %term, error = %error, "failed to anchor leadership in log");
        }
    }
}
