//! Engine error taxonomy.

use std::fmt::Display;
use thiserror::Error;

/// Errors surfaced by the engine.
///
/// The type is `Clone` so a single failure can be fanned out to every queued
/// operation behind it and to every waiter of a transition.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Reserved cancellation marker. Not a user-visible failure: it skips
    /// finalizers and error handlers but still runs cleanup.
    #[error("transition '{transition}' was cancelled")]
    Cancelled { transition: String },

    /// A reducer returned an error.
    #[error("reducer failed: {0}")]
    Reducer(String),

    /// An asynchronous operation rejected.
    #[error("operation '{label}' failed: {message}")]
    Operation { label: String, message: String },

    /// Synchronous dispatch recursion exceeded its ceiling.
    #[error("infinite loop detected: more than {limit} synchronous dispatches (last action '{kind}')")]
    InfiniteLoop { limit: usize, kind: String },

    /// A transition processed more actions than allowed over its lifetime.
    #[error("transition '{transition}' exceeded the limit of {limit} actions")]
    ActionOverflow { limit: usize, transition: String },

    /// A transition started more asynchronous operations than allowed.
    #[error("transition '{transition}' exceeded the limit of {limit} async operations")]
    OperationOverflow { limit: usize, transition: String },

    /// The initial state could not be constructed.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// An asynchronous operation was requested outside a tokio runtime.
    #[error("no async runtime available to run operation '{label}'")]
    NoRuntime { label: String },
}

impl EngineError {
    pub fn reducer(message: impl Display) -> Self {
        EngineError::Reducer(message.to_string())
    }

    pub fn operation(label: impl Into<String>, message: impl Display) -> Self {
        EngineError::Operation {
            label: label.into(),
            message: message.to_string(),
        }
    }

    pub fn cancelled(transition: impl Into<String>) -> Self {
        EngineError::Cancelled {
            transition: transition.into(),
        }
    }

    /// Whether this is the cancellation marker rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled { .. })
    }

    /// Whether a resource guard produced this error.
    pub fn is_guard_violation(&self) -> bool {
        matches!(
            self,
            EngineError::InfiniteLoop { .. }
                | EngineError::ActionOverflow { .. }
                | EngineError::OperationOverflow { .. }
        )
    }
}
