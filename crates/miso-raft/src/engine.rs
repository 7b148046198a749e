//! Engine assembly: wiring, lifecycle, and the client-facing surface.
//!
//! `RaftEngine` is constructed from explicit collaborator implementations
//! (log, transport, quorum policy, state machine) and an immutable validated
//! configuration. `start` spawns the background loops; `stop` tears them
//! down, failing anything still pending.

use bytes::Bytes;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, oneshot, Mutex, Notify};

use crate::apply::{apply_loop, StateMachine};
use crate::config::EngineConfig;
use crate::election::election_loop;
use crate::error::{RaftError, Result};
use crate::event::{Event, EventKind, EventNotifier, SubscriptionId};
use crate::log::LogStore;
use crate::quorum::{OpKind, QuorumStrategy};
use crate::replication::{advance_commit_index, heartbeat_loop, replicate_to_follower};
use crate::state::NodeState;
use crate::timer::ElectionTimer;
use crate::transport::{Envelope, RpcReceiver, Transport};
use crate::types::*;

/// A single node's consensus engine.
pub struct RaftEngine {
    config: EngineConfig,
    state: Arc<NodeState>,
    transport: Arc<dyn Transport>,
    state_machine: Arc<Mutex<dyn StateMachine>>,
    timer: Arc<ElectionTimer>,
    notifier: Arc<EventNotifier>,
    /// Wakes the heartbeat loop out-of-cycle (new proposal, election win).
    replicate_now: Arc<Notify>,
    shutdown_tx: broadcast::Sender<()>,
    rpc_rx: parking_lot::Mutex<Option<RpcReceiver>>,
    /// Serializes index assignment across concurrent proposals.
    propose_lock: Mutex<()>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl RaftEngine {
    /// Assemble an engine from its collaborators. Validates the
    /// configuration; an invalid combination is rejected here, not later.
    pub fn new(
        config: EngineConfig,
        log: Arc<dyn LogStore>,
        transport: Arc<dyn Transport>,
        quorum: Arc<dyn QuorumStrategy>,
        state_machine: Arc<Mutex<dyn StateMachine>>,
        rpc_rx: RpcReceiver,
    ) -> Result<Self> {
        config.validate()?;

        let notifier = Arc::new(EventNotifier::new());
        let timer = Arc::new(ElectionTimer::new(config.clone()));
        let state = Arc::new(NodeState::new(
            config.clone(),
            log,
            quorum,
            timer.clone(),
            notifier.clone(),
        ));
        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            config,
            state,
            transport,
            state_machine,
            timer,
            notifier,
            replicate_now: Arc::new(Notify::new()),
            shutdown_tx,
            rpc_rx: parking_lot::Mutex::new(Some(rpc_rx)),
            propose_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Begin participating: arm the election timer and spawn the timer,
    /// election, heartbeat, apply, and RPC dispatch loops. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RaftError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let timer = self.timer.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            timer.run(shutdown_rx).await;
        });

        let state = self.state.clone();
        let transport = self.transport.clone();
        let replicate_now = self.replicate_now.clone();
        let timeout_rx = self.timer.subscribe();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            election_loop(state, transport, replicate_now, timeout_rx, shutdown_rx).await;
        });

        let state = self.state.clone();
        let config = self.config.clone();
        let transport = self.transport.clone();
        let replicate_now = self.replicate_now.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            heartbeat_loop(state, config, transport, replicate_now, shutdown_rx).await;
        });

        let state = self.state.clone();
        let state_machine = self.state_machine.clone();
        let config = self.config.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            apply_loop(state, state_machine, config, shutdown_rx).await;
        });

        if let Some(rpc_rx) = self.rpc_rx.lock().take() {
            let state = self.state.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                rpc_loop(state, rpc_rx, shutdown_rx).await;
            });
        }

        self.timer.reset();
        self.notifier.publish(Event::Started {
            node: self.state.node_id().clone(),
        });
        tracing::info!(node = %self.state.node_id(), "engine started");
        Ok(())
    }

    /// Shut down: cancel timers, stop the loops, fail pending requests.
    /// Idempotent; new commands are rejected with `Stopped` immediately.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timer.disarm();
        let _ = self.shutdown_tx.send(());
        self.state.fail_pending_stopped();
        self.notifier.publish(Event::Stopped {
            node: self.state.node_id().clone(),
        });
        tracing::info!(node = %self.state.node_id(), "engine stopped");
    }

    /// Submit a command. Resolves with the state machine's outcome once the
    /// entry has committed and applied on this node.
    pub async fn propose(&self, command: Bytes) -> Result<Bytes> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RaftError::Stopped);
        }
        if self.state.role() != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.state.leader(),
            });
        }

        // Assign the slot and register the waiter atomically with respect
        // to other proposals.
        let (index, rx) = {
            let _guard = self.propose_lock.lock().await;

            let term = self.state.current_term();
            let index = self.state.log().last_index().await.next();
            let entry = LogEntry::new(term, index, command);
            self.state.log().append(entry).await?;

            let (tx, rx) = oneshot::channel();
            self.state.register_pending(index, term, tx)?;
            (index, rx)
        };

        // Push immediately rather than waiting out the heartbeat tick; the
        // direct advance covers quorum-of-one configurations.
        self.replicate_now.notify_one();
        let _ = advance_commit_index(&self.state).await;

        match tokio::time::timeout(self.config.propose_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RaftError::Stopped),
            Err(_) => {
                let needed = self.state.quorum_required(OpKind::Write);
                let acked = self.state.write_acks_at(index);
                self.state.drop_pending(index);
                Err(RaftError::NoQuorum { needed, acked })
            }
        }
    }

    /// Serve a read under the configured read-quorum policy.
    ///
    /// With a quorum of one (relaxed reads) the leader answers from local
    /// state immediately; otherwise leadership is confirmed against the
    /// read quorum and the applier catches up to the confirmation point
    /// before the state machine is queried.
    pub async fn read(&self, query: Bytes) -> Result<Bytes> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RaftError::Stopped);
        }
        if self.state.role() != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.state.leader(),
            });
        }

        let needed = self.state.quorum_required(OpKind::Read);
        if needed > 1 {
            self.confirm_leadership(needed).await?;
        }

        let machine = self.state_machine.lock().await;
        Ok(machine.query(&query))
    }

    /// Read-quorum confirmation round: heartbeat the followers, require
    /// `needed` acknowledgments (counting this node), then wait for the
    /// applier to reach the commit point observed at the start.
    async fn confirm_leadership(&self, needed: usize) -> Result<()> {
        let term = self.state.current_term();
        let read_point = self.state.commit_index();

        let followers = self.state.view().others(self.state.node_id());
        let rounds = followers
            .iter()
            .map(|follower| {
                replicate_to_follower(
                    &self.state,
                    follower,
                    &self.transport,
                    self.config.max_entries_per_append,
                )
            })
            .collect::<Vec<_>>();

        let mut acked = 1usize;
        for result in join_all(rounds).await {
            if matches!(result, Ok(true)) {
                acked += 1;
            }
        }

        if self.state.role() != Role::Leader || self.state.current_term() != term {
            return Err(RaftError::NotLeader {
                leader: self.state.leader(),
            });
        }
        if acked < needed {
            return Err(RaftError::NoQuorum { needed, acked });
        }

        let started = Instant::now();
        while self.state.last_applied() < read_point {
            if started.elapsed() > self.config.election_timeout_min {
                return Err(RaftError::CommitTimeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        self.state.role() == Role::Leader
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.state.leader()
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.commit_index()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.last_applied()
    }

    pub fn node_id(&self) -> &NodeId {
        self.state.node_id()
    }

    /// Subscribe to engine events; empty `kinds` means all of them.
    pub fn subscribe(
        &self,
        kinds: &[EventKind],
    ) -> (SubscriptionId, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        self.notifier.subscribe(kinds)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.notifier.unsubscribe(id);
    }

    /// Replace the membership view.
    pub fn update_members(&self, members: Vec<NodeId>) {
        self.state.update_members(ClusterView::new(members));
    }
}

/// Inbound RPC dispatch: drains the transport's receiver, routes each
/// envelope to the matching handler, and sends the response back along the
/// envelope's reply path.
async fn rpc_loop(
    state: Arc<NodeState>,
    mut rpc_rx: RpcReceiver,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            envelope = rpc_rx.recv() => match envelope {
                Some(envelope) => dispatch(&state, envelope).await,
                None => {
                    tracing::debug!("rpc channel closed, exiting dispatch loop");
                    break;
                }
            },
            _ = shutdown_rx.recv() => {
                tracing::debug!("rpc dispatch loop shutting down");
                break;
            }
        }
    }
}

async fn dispatch(state: &Arc<NodeState>, envelope: Envelope) {
    let (from, request, sink) = envelope.into_parts();
    match request {
        RpcRequest::Vote(request) => {
            let response = state.handle_vote_request(request).await;
            sink.send(RpcResponse::Vote(response));
        }
        RpcRequest::AppendEntries(request) => match state.handle_append_entries(request).await {
            Ok(response) => sink.send(RpcResponse::AppendEntries(response)),
            Err(error) => {
                // No response; the leader times out and retries next tick.
                tracing::error!(from = %from, error = %error, "append-entries handling failed");
            }
        },
    }
}
