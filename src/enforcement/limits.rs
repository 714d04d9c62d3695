//! Configurable ceilings for the resource guards.

use crate::enforcement::violations::LimitViolation;
use serde::{Deserialize, Serialize};
use stillwater::validation::Validation;
use stillwater::NonEmptyVec;

pub const DEFAULT_MAX_SYNC_DISPATCH_COUNT: usize = 1000;
pub const DEFAULT_MAX_ACTIONS_COUNT: usize = 1000;
pub const DEFAULT_MAX_ASYNC_OPERATIONS_COUNT: usize = 500;

/// Resource guard ceilings.
///
/// Field names follow the camelCase option names, so a JSON configuration
/// may set any subset and leave the rest at their defaults.
///
/// # Example
///
/// ```rust
/// use transit::enforcement::Limits;
///
/// let limits = Limits::from_json(r#"{ "maxSyncDispatchCount": 50 }"#).unwrap();
/// assert_eq!(limits.max_sync_dispatch_count, 50);
/// assert_eq!(limits.max_actions_count, 1000);
/// assert!(limits.validate().is_success());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Limits {
    /// Synchronous dispatches allowed within one tick of one transition
    pub max_sync_dispatch_count: usize,
    /// Actions allowed over a transition's lifetime
    pub max_actions_count: usize,
    /// Async operations allowed over a transition's lifetime
    pub max_async_operations_count: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_sync_dispatch_count: DEFAULT_MAX_SYNC_DISPATCH_COUNT,
            max_actions_count: DEFAULT_MAX_ACTIONS_COUNT,
            max_async_operations_count: DEFAULT_MAX_ASYNC_OPERATIONS_COUNT,
        }
    }
}

impl Limits {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Check every ceiling, accumulating all problems.
    pub fn validate(&self) -> Validation<(), NonEmptyVec<LimitViolation>> {
        let checks: Vec<Validation<(), NonEmptyVec<LimitViolation>>> = [
            ("maxSyncDispatchCount", self.max_sync_dispatch_count),
            ("maxActionsCount", self.max_actions_count),
            ("maxAsyncOperationsCount", self.max_async_operations_count),
        ]
        .into_iter()
        .map(|(name, value)| {
            if value == 0 {
                Validation::fail(LimitViolation::Zero { name })
            } else {
                Validation::success(())
            }
        })
        .collect();

        Validation::all_vec(checks).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let limits = Limits::default();
        assert_eq!(limits.max_sync_dispatch_count, 1000);
        assert_eq!(limits.max_actions_count, 1000);
        assert_eq!(limits.max_async_operations_count, 500);
    }

    #[test]
    fn json_uses_camel_case_names() {
        let limits = Limits::from_json(
            r#"{ "maxActionsCount": 5, "maxAsyncOperationsCount": 2 }"#,
        )
        .unwrap();
        assert_eq!(limits.max_actions_count, 5);
        assert_eq!(limits.max_async_operations_count, 2);
        assert_eq!(limits.max_sync_dispatch_count, 1000);

        let json = serde_json::to_value(limits).unwrap();
        assert_eq!(json["maxActionsCount"], 5);
    }

    #[test]
    fn validation_accumulates_all_zero_limits() {
        let limits = Limits {
            max_sync_dispatch_count: 0,
            max_actions_count: 10,
            max_async_operations_count: 0,
        };

        match limits.validate() {
            Validation::Failure(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors
                    .iter()
                    .any(|e| *e == LimitViolation::Zero { name: "maxSyncDispatchCount" }));
                assert!(errors
                    .iter()
                    .any(|e| *e == LimitViolation::Zero { name: "maxAsyncOperationsCount" }));
            }
            Validation::Success(_) => panic!("Expected failures, got success"),
        }
    }
}
