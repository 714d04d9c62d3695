//! Speculative setters and the optimistic preview.
//!
//! Optimistic setters never touch committed state. The preview is rebuilt
//! from committed state each time the registry or committed state changes.

use crate::core::{Setter, State};
use std::fmt;

/// One speculative setter owned by an active transition.
pub struct OptimisticEntry<S: State> {
    pub id: u64,
    /// Key of the owning transition
    pub transition: String,
    pub setter: Setter<S>,
}

impl<S: State> fmt::Debug for OptimisticEntry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticEntry")
            .field("id", &self.id)
            .field("transition", &self.transition)
            .field("setter", &self.setter)
            .finish()
    }
}

/// Registration-ordered optimistic setters across all active transitions.
pub struct OptimisticRegistry<S: State> {
    entries: Vec<OptimisticEntry<S>>,
    next_id: u64,
    revision: u64,
}

impl<S: State> Default for OptimisticRegistry<S> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            revision: 0,
        }
    }
}

impl<S: State> OptimisticRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, transition: &str, setter: Setter<S>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.revision += 1;
        self.entries.push(OptimisticEntry {
            id,
            transition: transition.to_string(),
            setter,
        });
        id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        let removed = self.entries.len() != before;
        if removed {
            self.revision += 1;
        }
        removed
    }

    /// Drop every entry owned by `transition`. Returns how many were dropped.
    pub fn clear_transition(&mut self, transition: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.transition != transition);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.revision += 1;
        }
        removed
    }

    pub fn entries(&self) -> &[OptimisticEntry<S>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len_for(&self, transition: &str) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.transition == transition)
            .count()
    }

    /// Bumped on every change; callers cache previews against it.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl<S: State> fmt::Debug for OptimisticRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticRegistry")
            .field("entries", &self.entries)
            .field("revision", &self.revision)
            .finish()
    }
}

/// Overlay `entries` onto a clone of `committed`.
///
/// After each setter is folded, `rerun` gets a chance to replace the preview
/// with the result of re-running the state-transition function over it;
/// returning `None` keeps the folded state as is.
///
/// # Example
///
/// ```rust
/// use transit::core::Setter;
/// use transit::optimistic::{compute_preview, OptimisticRegistry};
/// use transit::state_struct;
///
/// state_struct! {
///     struct Likes { count: i64, label: String }
///     patch: LikesPatch
/// }
///
/// let committed = Likes::default();
/// let mut registry = OptimisticRegistry::new();
/// registry.register("like", Setter::update(|s: &Likes| LikesPatch {
///     count: Some(s.count + 1),
///     ..Default::default()
/// }));
///
/// let preview = compute_preview(&committed, registry.entries(), |s: &Likes| {
///     Some(Likes { label: format!("{} likes", s.count), ..s.clone() })
/// });
///
/// assert_eq!(preview.label, "1 likes");
/// assert_eq!(committed.count, 0);
/// ```
pub fn compute_preview<S, F>(committed: &S, entries: &[OptimisticEntry<S>], mut rerun: F) -> S
where
    S: State,
    F: FnMut(&S) -> Option<S>,
{
    let mut preview = committed.clone();
    for entry in entries {
        entry.setter.apply(&mut preview);
        if let Some(next) = rerun(&preview) {
            preview = next;
        }
    }
    preview
}
