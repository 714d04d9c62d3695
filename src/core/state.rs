//! Core State trait for engine-managed application state.
//!
//! All engine state must implement this trait, which describes how a partial
//! update is folded onto a full state value and when two states count as
//! equal for the purposes of the history log.

use serde_json::{Map, Value};
use std::fmt::Debug;

/// Trait for application state held by an [`Engine`](crate::engine::Engine).
///
/// A state is a plain value with a companion `Patch` type describing a
/// partial update. Patches are always merged shallowly: keys absent from a
/// patch keep their current value.
///
/// # Required Traits
///
/// - `Clone`: drafts and optimistic previews are copies of committed state
/// - `Debug`: states show up in diagnostics
/// - `Send` + `Sync`: engines are shared with async tasks
///
/// # Example
///
/// ```rust
/// use transit::core::State;
///
/// #[derive(Clone, Debug, PartialEq, Default)]
/// struct Counter {
///     count: i64,
///     label: String,
/// }
///
/// #[derive(Clone, Debug, Default)]
/// struct CounterPatch {
///     count: Option<i64>,
///     label: Option<String>,
/// }
///
/// impl State for Counter {
///     type Patch = CounterPatch;
///
///     fn merge(&mut self, patch: CounterPatch) {
///         if let Some(count) = patch.count {
///             self.count = count;
///         }
///         if let Some(label) = patch.label {
///             self.label = label;
///         }
///     }
///
///     fn shallow_eq(&self, other: &Self) -> bool {
///         self.count == other.count && self.label == other.label
///     }
/// }
///
/// let mut state = Counter::default();
/// state.merge(CounterPatch { count: Some(2), label: None });
/// assert_eq!(state.count, 2);
/// assert_eq!(state.label, "");
/// ```
///
/// The [`state_struct!`](crate::state_struct) macro generates all of the
/// above from a struct declaration.
pub trait State: Clone + Debug + Send + Sync + 'static {
    /// Partial update merged onto a full state.
    type Patch: Clone + Debug + Send + Sync + 'static;

    /// Fold a partial update onto this state, leaving unspecified keys alone.
    fn merge(&mut self, patch: Self::Patch);

    /// Compare top-level keys only.
    ///
    /// The default history policy appends a commit only when this returns
    /// `false` against the previous entry.
    fn shallow_eq(&self, other: &Self) -> bool;
}

/// Dynamic JSON objects are states whose patches are objects too.
impl State for Map<String, Value> {
    type Patch = Map<String, Value>;

    fn merge(&mut self, patch: Self::Patch) {
        for (key, value) in patch {
            self.insert(key, value);
        }
    }

    fn shallow_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(key, value)| other.get(key).is_some_and(|v| v == value))
    }
}
