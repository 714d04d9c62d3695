//! Build errors for the engine builder.

use crate::enforcement::LimitViolation;
use thiserror::Error;

/// Errors that can occur when building an engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BuildError {
    #[error("Initial state not specified. Call .initial(state) or .bootstrap(f) before .build()")]
    MissingInitialState,

    #[error("Limit {name} must be greater than zero")]
    ZeroLimit { name: &'static str },

    #[error("Event capacity must be greater than zero")]
    ZeroEventCapacity,

    #[error("{} configuration problems: {}", .0.len(), describe(.0))]
    Invalid(Vec<BuildError>),
}

impl From<LimitViolation> for BuildError {
    fn from(violation: LimitViolation) -> Self {
        match violation {
            LimitViolation::Zero { name } => BuildError::ZeroLimit { name },
        }
    }
}

fn describe(errors: &[BuildError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
