//! Request/response correlation for asynchronous RPC traffic.
//!
//! Every outbound RPC is stamped with a [`RequestId`] so a response arriving
//! on a shared channel can be matched to its originating call even with
//! several requests to the same peer in flight. The id scheme is pluggable;
//! both provided strategies are lock-free and safe to call from anywhere in
//! the engine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::CorrelationKind;

/// Correlation identifier carried in RPC envelopes and echoed by responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u128);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{:x}", self.0)
    }
}

/// Produces unique identifiers for outstanding RPCs.
pub trait CorrelationStrategy: Send + Sync {
    fn next_id(&self) -> RequestId;
}

/// Monotonic counter. Unique within one node lifetime, which is all the
/// in-flight matching needs.
#[derive(Debug, Default)]
pub struct SequenceCorrelation {
    next: AtomicU64,
}

impl SequenceCorrelation {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CorrelationStrategy for SequenceCorrelation {
    fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed) as u128)
    }
}

/// Random v4 UUIDs, unique across restarts and across nodes.
#[derive(Debug, Default)]
pub struct UuidCorrelation;

impl CorrelationStrategy for UuidCorrelation {
    fn next_id(&self) -> RequestId {
        RequestId(uuid::Uuid::new_v4().as_u128())
    }
}

/// Build the strategy selected by configuration.
pub fn from_kind(kind: CorrelationKind) -> std::sync::Arc<dyn CorrelationStrategy> {
    match kind {
        CorrelationKind::Sequence => std::sync::Arc::new(SequenceCorrelation::new()),
        CorrelationKind::Uuid => std::sync::Arc::new(UuidCorrelation),
    }
}
