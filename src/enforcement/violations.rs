//! Guard violations and configuration problems.

use crate::error::EngineError;
use thiserror::Error;

/// A resource guard tripped.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GuardViolation {
    #[error("more than {limit} synchronous dispatches (last action '{kind}')")]
    InfiniteLoop { limit: usize, kind: String },

    #[error("more than {limit} actions")]
    ActionOverflow { limit: usize },

    #[error("more than {limit} async operations")]
    OperationOverflow { limit: usize },
}

impl GuardViolation {
    /// Attribute the violation to `transition`.
    pub fn into_error(self, transition: &str) -> EngineError {
        match self {
            GuardViolation::InfiniteLoop { limit, kind } => EngineError::InfiniteLoop { limit, kind },
            GuardViolation::ActionOverflow { limit } => EngineError::ActionOverflow {
                limit,
                transition: transition.to_string(),
            },
            GuardViolation::OperationOverflow { limit } => EngineError::OperationOverflow {
                limit,
                transition: transition.to_string(),
            },
        }
    }
}

/// A limit that cannot be enforced as configured.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LimitViolation {
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}
