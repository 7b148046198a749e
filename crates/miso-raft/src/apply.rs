//! Commit applier: feeds committed entries to the user state machine.
//!
//! Entries are applied strictly in index order, one at a time, exactly once
//! per node. A command's own failure is part of its outcome and flows back
//! to the proposer; it never stalls the applier, because every node must
//! apply the identical sequence.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, Duration};

use crate::config::EngineConfig;
use crate::log::LogStore;
use crate::state::NodeState;
use crate::types::{EntryKind, LogIndex};

/// The user-supplied deterministic state machine.
///
/// `apply` receives every committed `Normal` entry in log order and returns
/// the command's outcome as opaque bytes; command-level failures are encoded
/// in the outcome, not raised. `query` serves reads and must not mutate.
pub trait StateMachine: Send {
    fn apply(&mut self, index: LogIndex, command: &Bytes) -> Bytes;

    fn query(&self, query: &Bytes) -> Bytes;
}

/// Apply loop: drains `(last_applied, commit_index]` as commitment advances.
///
/// Also the compaction trigger: once the retained log exceeds the configured
/// bound, the applied prefix is compacted away.
pub async fn apply_loop(
    state: Arc<NodeState>,
    state_machine: Arc<Mutex<dyn StateMachine>>,
    config: EngineConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(Duration::from_millis(10));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.recv() => {
                tracing::debug!("apply loop shutting down");
                break;
            }
        }

        let last_applied = state.last_applied();
        let commit_index = state.commit_index();
        if commit_index <= last_applied {
            continue;
        }

        let entries = match state
            .log()
            .range(last_applied.next(), commit_index.next())
            .await
        {
            Ok(entries) => entries,
            Err(error) => {
                tracing::error!(error = %error, "failed to read committed entries");
                continue;
            }
        };

        for entry in entries {
            let outcome = match entry.kind {
                EntryKind::Normal => {
                    let mut machine = state_machine.lock().await;
                    Some(machine.apply(entry.index, &entry.command))
                }
                EntryKind::Noop => None,
            };
            state.mark_applied(entry.index, entry.term, outcome);
        }

        maybe_compact(&state, &config).await;
    }
}

async fn maybe_compact(state: &Arc<NodeState>, config: &EngineConfig) {
    let retained = state.log().len().await;
    if retained <= config.max_log_entries {
        return;
    }
    let applied = state.last_applied();
    tracing::info!(retained, through = %applied, "compacting applied log prefix");
    if let Err(error) = state.log().compact_before(applied.next()).await {
        tracing::error!(error = %error, "log compaction failed");
    }
}
