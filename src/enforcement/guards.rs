//! Counters behind the resource guards.

use crate::enforcement::limits::Limits;
use crate::enforcement::violations::GuardViolation;
use std::collections::HashMap;

/// Synchronous recursion counter for one dispatch chain.
///
/// A chain is everything one call into the engine runs before returning,
/// so the counter covers one transition within one tick.
#[derive(Debug)]
pub struct SyncGuard {
    count: usize,
    limit: usize,
}

impl SyncGuard {
    pub fn new(limit: usize) -> Self {
        Self { count: 0, limit }
    }

    /// Count one more dispatch of `kind`.
    pub fn step(&mut self, kind: &str) -> Result<(), GuardViolation> {
        self.count += 1;
        if self.count > self.limit {
            tracing::warn!(limit = self.limit, kind, "synchronous dispatch limit exceeded");
            return Err(GuardViolation::InfiniteLoop {
                limit: self.limit,
                kind: kind.to_string(),
            });
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Cumulative action and operation counts per owner transition.
#[derive(Debug, Default)]
pub struct GuardCounters {
    actions: HashMap<String, usize>,
    operations: HashMap<String, usize>,
}

impl GuardCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_action(&mut self, owner: &str, limits: &Limits) -> Result<(), GuardViolation> {
        let count = self.actions.entry(owner.to_string()).or_insert(0);
        *count += 1;
        if *count > limits.max_actions_count {
            tracing::warn!(transition = owner, limit = limits.max_actions_count, "action limit exceeded");
            return Err(GuardViolation::ActionOverflow {
                limit: limits.max_actions_count,
            });
        }
        Ok(())
    }

    pub fn record_operation(&mut self, owner: &str, limits: &Limits) -> Result<(), GuardViolation> {
        let count = self.operations.entry(owner.to_string()).or_insert(0);
        *count += 1;
        if *count > limits.max_async_operations_count {
            tracing::warn!(
                transition = owner,
                limit = limits.max_async_operations_count,
                "async operation limit exceeded"
            );
            return Err(GuardViolation::OperationOverflow {
                limit: limits.max_async_operations_count,
            });
        }
        Ok(())
    }

    /// Undo one [`record_action`](Self::record_action).
    pub fn unrecord_action(&mut self, owner: &str) {
        if let Some(count) = self.actions.get_mut(owner) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.actions.remove(owner);
            }
        }
    }

    pub fn actions(&self, owner: &str) -> usize {
        self.actions.get(owner).copied().unwrap_or(0)
    }

    pub fn operations(&self, owner: &str) -> usize {
        self.operations.get(owner).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, owner: &str) {
        self.actions.remove(owner);
        self.operations.remove(owner);
    }

    /// Number of owners with live counters.
    pub fn len(&self) -> usize {
        let mut owners: Vec<&String> = self.actions.keys().chain(self.operations.keys()).collect();
        owners.sort();
        owners.dedup();
        owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.operations.is_empty()
    }
}
