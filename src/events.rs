//! Transition lifecycle events for timeline collaborators.

use crate::effects::{OperationKind, OperationStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default number of events buffered per receiver before it lags.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle events emitted by the engine.
///
/// Transition keys are the joined form produced by
/// [`Transition::key`](crate::core::Transition::key).
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A key went from zero to one active unit of work.
    TransitionStart { transition: String, at: DateTime<Utc> },
    /// A key returned to zero.
    TransitionDone { transition: String, at: DateTime<Utc> },
    /// A key was cancelled.
    TransitionAborted { transition: String, at: DateTime<Utc> },
    /// A key terminated with an error.
    TransitionError {
        transition: String,
        message: String,
        at: DateTime<Utc>,
    },
    /// New state became canonical.
    Committed {
        transition: Option<String>,
        appended_to_history: bool,
        at: DateTime<Utc>,
    },
    OperationCreated {
        transition: String,
        operation: Uuid,
        label: String,
        kind: OperationKind,
        at: DateTime<Utc>,
    },
    OperationCompleted {
        transition: String,
        operation: Uuid,
        label: String,
        status: OperationStatus,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// The transition key the event concerns, if any.
    pub fn transition(&self) -> Option<&str> {
        match self {
            EngineEvent::TransitionStart { transition, .. }
            | EngineEvent::TransitionDone { transition, .. }
            | EngineEvent::TransitionAborted { transition, .. }
            | EngineEvent::TransitionError { transition, .. }
            | EngineEvent::OperationCreated { transition, .. }
            | EngineEvent::OperationCompleted { transition, .. } => Some(transition),
            EngineEvent::Committed { transition, .. } => transition.as_deref(),
        }
    }
}

/// Broadcast channel carrying [`EngineEvent`]s.
///
/// Emitting never blocks; with no receivers the event is dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        tracing::trace!(?event, "engine event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
