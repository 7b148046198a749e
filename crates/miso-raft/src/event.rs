//! Lifecycle and protocol event publication.
//!
//! Events are a tagged union dispatched to registered subscribers by kind.
//! Delivery is best-effort over unbounded channels: per-subscriber ordering
//! follows the underlying state changes, and a subscriber that has gone away
//! is pruned rather than ever blocking the engine.

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::types::{LogIndex, NodeId, Role, Term};

/// Discriminant used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Stopped,
    RoleChanged,
    TermChanged,
    LeaderElected,
    EntryCommitted,
    EntryApplied,
    MembershipChanged,
}

/// A discrete engine event.
#[derive(Debug, Clone)]
pub enum Event {
    Started { node: NodeId },
    Stopped { node: NodeId },
    RoleChanged { term: Term, role: Role },
    TermChanged { term: Term },
    LeaderElected { term: Term, leader: NodeId },
    EntryCommitted { index: LogIndex, term: Term },
    EntryApplied { index: LogIndex, term: Term },
    MembershipChanged { members: Vec<NodeId> },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Started { .. } => EventKind::Started,
            Event::Stopped { .. } => EventKind::Stopped,
            Event::RoleChanged { .. } => EventKind::RoleChanged,
            Event::TermChanged { .. } => EventKind::TermChanged,
            Event::LeaderElected { .. } => EventKind::LeaderElected,
            Event::EntryCommitted { .. } => EventKind::EntryCommitted,
            Event::EntryApplied { .. } => EventKind::EntryApplied,
            Event::MembershipChanged { .. } => EventKind::MembershipChanged,
        }
    }
}

/// Opaque handle for cancelling a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    /// Empty = all kinds.
    kinds: Vec<EventKind>,
    tx: mpsc::UnboundedSender<Event>,
}

/// Push-model event registry.
#[derive(Default)]
pub struct EventNotifier {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for the given kinds; an empty slice means every kind.
    pub fn subscribe(&self, kinds: &[EventKind]) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(
            self.next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );
        self.subscribers.write().push(Subscriber {
            id,
            kinds: kinds.to_vec(),
            tx,
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    /// Publish to every matching subscriber; closed receivers are dropped.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|s| {
            if !s.kinds.is_empty() && !s.kinds.contains(&event.kind()) {
                return true;
            }
            s.tx.send(event.clone()).is_ok()
        });
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
