//! Randomized, cancellable election timer.
//!
//! The timer is armed with a fresh random duration from the configured
//! range on every reset, so competing candidates drift apart instead of
//! re-splitting the vote. Leaders disarm it; any valid leader contact or
//! granted vote re-arms it. Expiry is announced on a broadcast channel
//! consumed by the election loop.

use parking_lot::Mutex;
use std::time::Instant;
use tokio::sync::{broadcast, Notify};

use crate::config::EngineConfig;

pub struct ElectionTimer {
    config: EngineConfig,
    /// `None` while disarmed (leader role, or engine not started).
    deadline: Mutex<Option<Instant>>,
    /// Pokes the run loop whenever the deadline changes.
    changed: Notify,
    fired: broadcast::Sender<()>,
}

impl ElectionTimer {
    pub fn new(config: EngineConfig) -> Self {
        let (fired, _) = broadcast::channel(16);
        Self {
            config,
            deadline: Mutex::new(None),
            changed: Notify::new(),
            fired,
        }
    }

    /// Receiver of expiry ticks. Subscribe before the timer is armed.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.fired.subscribe()
    }

    /// Arm (or re-arm) with a fresh randomized timeout.
    pub fn reset(&self) {
        let timeout = self.config.random_election_timeout();
        *self.deadline.lock() = Some(Instant::now() + timeout);
        self.changed.notify_one();
    }

    /// Stop firing until the next `reset` (leader role).
    pub fn disarm(&self) {
        *self.deadline.lock() = None;
        self.changed.notify_one();
    }

    /// Drive the timer until shutdown. Spawned once by the engine.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let deadline = *self.deadline.lock();
            match deadline {
                None => {
                    tokio::select! {
                        _ = self.changed.notified() => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at.into()) => {
                            let mut deadline = self.deadline.lock();
                            // Re-check: a reset may have landed while sleeping.
                            if matches!(*deadline, Some(at) if Instant::now() >= at) {
                                let _ = self.fired.send(());
                                *deadline =
                                    Some(Instant::now() + self.config.random_election_timeout());
                            }
                        }
                        _ = self.changed.notified() => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }
        }
    }
}
