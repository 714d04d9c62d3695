//! Committed-state history and per-transition action records.
//!
//! The history is an append-only log of committed snapshots. A push policy
//! decides whether a new commit earns an entry; by default it must differ
//! shallowly from the latest one.

use super::state::State;
use super::transition::Transition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Decides whether `next` is appended after `previous`.
pub type PushPolicy<S> = Arc<dyn Fn(&S, &S) -> bool + Send + Sync>;

/// The default policy: append only if shallow-unequal to the previous entry.
pub fn shallow_unequal<S: State>() -> PushPolicy<S> {
    Arc::new(|previous: &S, next: &S| !previous.shallow_eq(next))
}

/// Append every commit, even when nothing changed.
pub fn always<S: State>() -> PushPolicy<S> {
    Arc::new(|_: &S, _: &S| true)
}

/// One committed snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry<S> {
    /// The committed state
    pub state: S,
    /// When the commit happened
    pub timestamp: DateTime<Utc>,
    /// The transition that produced it; `None` for the initial state and
    /// transition-less mutations
    pub transition: Option<Transition>,
}

/// Append-only ordered log of committed states.
///
/// # Example
///
/// ```rust
/// use transit::core::history::{shallow_unequal, History};
/// use transit::state_struct;
///
/// state_struct! {
///     struct Counter { count: i64 }
///     patch: CounterPatch
/// }
///
/// let policy = shallow_unequal();
/// let mut history = History::new(Counter::default());
///
/// assert!(history.record(Counter { count: 1 }, None, &policy));
/// assert!(!history.record(Counter { count: 1 }, None, &policy));
/// assert_eq!(history.len(), 2);
/// ```
#[derive(Clone, Debug)]
pub struct History<S: State> {
    entries: Vec<HistoryEntry<S>>,
    capacity: Option<usize>,
}

impl<S: State> History<S> {
    /// Start a history whose first entry is the initial state.
    pub fn new(initial: S) -> Self {
        Self {
            entries: vec![HistoryEntry {
                state: initial,
                timestamp: Utc::now(),
                transition: None,
            }],
            capacity: None,
        }
    }

    /// Bound the number of retained entries; the oldest are dropped first.
    pub fn with_capacity_limit(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity.map(|c| c.max(1));
        self.trim();
        self
    }

    /// Offer a committed state to the log. Returns whether it was appended.
    pub fn record(
        &mut self,
        state: S,
        transition: Option<Transition>,
        policy: &PushPolicy<S>,
    ) -> bool {
        let push = match self.entries.last() {
            Some(previous) => policy(&previous.state, &state),
            None => true,
        };
        if push {
            self.entries.push(HistoryEntry {
                state,
                timestamp: Utc::now(),
                transition,
            });
            self.trim();
        }
        push
    }

    fn trim(&mut self) {
        if let Some(capacity) = self.capacity {
            if self.entries.len() > capacity {
                let excess = self.entries.len() - capacity;
                self.entries.drain(..excess);
            }
        }
    }

    pub fn latest(&self) -> Option<&HistoryEntry<S>> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[HistoryEntry<S>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The committed states in order.
    pub fn path(&self) -> Vec<&S> {
        self.entries.iter().map(|e| &e.state).collect()
    }

    /// Time between the first and last retained entries.
    ///
    /// Returns `None` if the log is empty.
    pub fn duration(&self) -> Option<Duration> {
        let (first, last) = (self.entries.first()?, self.entries.last()?);
        last.timestamp
            .signed_duration_since(first.timestamp)
            .to_std()
            .ok()
    }
}

impl<S: State + Serialize> History<S> {
    /// Export the log for devtools.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.entries)
    }
}

/// Where an action record came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    /// A caller dispatch or a synchronous dispatch from a reducer
    Dispatch,
    /// A `set_state` call
    SetState,
    /// A continuation of an asynchronous operation
    Continuation,
}

/// One action processed inside a transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Kind of the action (its `type`)
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    /// Segment count of the owning transition
    pub depth: usize,
    pub source: ActionSource,
    /// Engine-wide monotonically increasing sequence number
    pub sequence: u64,
}
