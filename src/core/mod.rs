//! Core value types of the engine.
//!
//! This module contains the pure building blocks every other layer shares:
//! - State definitions via the `State` trait and the `state_struct!` macro
//! - Setters, the unit of mutation accumulated by transitions
//! - Hierarchical transition names
//! - The committed-state history log and action records
//!
//! Nothing in here touches shared registries or spawns work.

pub mod history;
mod macros;
mod setter;
mod state;
mod transition;

pub use history::{ActionRecord, ActionSource, History, HistoryEntry, PushPolicy};
pub use setter::{fold, Setter, UpdateFn};
pub use state::State;
pub use transition::{
    key_is_ancestor_of, Transition, BOOTSTRAP, DELIMITER, NESTED_MARKER, SUB_BRANCH_PREFIX,
};
