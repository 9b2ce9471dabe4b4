use analysis_core::{AnalysisMode, ErrorKind};
use serde::Serialize;
use tokio::sync::broadcast;

/// Progress notifications published while requests move through the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Accepted {
        request_id: String,
        mode: AnalysisMode,
        symbols: usize,
    },
    CacheHit {
        request_id: String,
    },
    SymbolCompleted {
        request_id: String,
        symbol: String,
        score: f64,
    },
    SymbolFailed {
        request_id: String,
        symbol: String,
        reason: String,
    },
    BatchWindowCompleted {
        request_id: String,
        window: usize,
        total_windows: usize,
        failed: usize,
        delay_ms: u64,
    },
    Completed {
        request_id: String,
        success: bool,
        selections: usize,
        total_ms: u64,
    },
    TimedOut {
        request_id: String,
        timeout_ms: u64,
    },
    Rejected {
        request_id: Option<String>,
        kind: ErrorKind,
        reason: String,
    },
    HandleReclaimed {
        request_id: String,
        age_ms: u64,
    },
}

impl LifecycleEvent {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            LifecycleEvent::Accepted { request_id, .. }
            | LifecycleEvent::CacheHit { request_id }
            | LifecycleEvent::SymbolCompleted { request_id, .. }
            | LifecycleEvent::SymbolFailed { request_id, .. }
            | LifecycleEvent::BatchWindowCompleted { request_id, .. }
            | LifecycleEvent::Completed { request_id, .. }
            | LifecycleEvent::TimedOut { request_id, .. }
            | LifecycleEvent::HandleReclaimed { request_id, .. } => Some(request_id),
            LifecycleEvent::Rejected { request_id, .. } => request_id.as_deref(),
        }
    }
}

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fan-out channel for [`LifecycleEvent`]s. Publishing never blocks and works with no subscribers;
/// slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
