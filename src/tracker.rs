//! Reference counting of active transitions.
//!
//! Every unit of work registered against a transition increments the
//! transition's key and every ancestor key. A key returning to zero is
//! "done": its completion callbacks run exactly once and a
//! [`EngineEvent::TransitionDone`] is emitted.

use crate::core::{Transition, DELIMITER};
use crate::events::{EngineEvent, EventBus};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;

/// Callback run once when a key returns to zero.
pub type DoneCallback = Box<dyn FnOnce(&str) + Send>;

/// Handle for withdrawing a callback registered with
/// [`TransitionTracker::on_done`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Reference counts keyed by transition key.
///
/// Three independent counters are kept: `transitions` (active units of
/// work, rolled up into ancestors), `subtransitions` (named sub-units per
/// transition) and `finishes` (pending members of each finalizer group per
/// transition).
///
/// # Example
///
/// ```rust
/// use transit::core::Transition;
/// use transit::events::EventBus;
/// use transit::tracker::TransitionTracker;
///
/// let mut tracker = TransitionTracker::new(EventBus::default());
/// let child = Transition::from(["save", "user"]);
///
/// tracker.add_key(&child);
/// assert!(tracker.is_happening(&Transition::from(["save", "user", "x"])));
/// assert!(tracker.is_happening_unique(&Transition::from("save")));
///
/// let done = tracker.done_key(&child);
/// assert_eq!(done, vec!["save/user".to_string(), "save".to_string()]);
/// assert!(tracker.is_idle());
/// ```
pub struct TransitionTracker {
    transitions: HashMap<String, usize>,
    subtransitions: HashMap<String, HashMap<String, usize>>,
    finishes: HashMap<String, HashMap<String, usize>>,
    on_done: HashMap<String, Vec<(CallbackId, DoneCallback)>>,
    next_callback: u64,
    underflows: usize,
    events: EventBus,
}

impl TransitionTracker {
    pub fn new(events: EventBus) -> Self {
        Self {
            transitions: HashMap::new(),
            subtransitions: HashMap::new(),
            finishes: HashMap::new(),
            on_done: HashMap::new(),
            next_callback: 0,
            underflows: 0,
            events,
        }
    }

    /// Increment the transition and every ancestor.
    pub fn add_key(&mut self, transition: &Transition) {
        for key in transition.ancestor_keys() {
            let count = self.transitions.entry(key.clone()).or_insert(0);
            if *count == 0 {
                tracing::debug!(transition = %key, "transition started");
                self.events.emit(EngineEvent::TransitionStart {
                    transition: key.clone(),
                    at: Utc::now(),
                });
            }
            *count += 1;
            tracing::trace!(transition = %key, count = *count, "add key");
        }
    }

    /// Decrement the transition and every ancestor.
    ///
    /// Returns the keys that reached zero, deepest first.
    pub fn done_key(&mut self, transition: &Transition) -> Vec<String> {
        let mut finished = Vec::new();
        for key in transition.ancestor_keys().into_iter().rev() {
            match self.transitions.get_mut(&key) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    tracing::trace!(transition = %key, count = *count, "done key");
                    if *count == 0 {
                        self.finish(&key);
                        finished.push(key);
                    }
                }
                _ => {
                    self.underflows += 1;
                    tracing::error!(transition = %key, "transition counter decremented below zero");
                }
            }
        }
        finished
    }

    fn finish(&mut self, key: &str) {
        self.transitions.remove(key);
        self.events.emit(EngineEvent::TransitionDone {
            transition: key.to_string(),
            at: Utc::now(),
        });
        if let Some(callbacks) = self.on_done.remove(key) {
            for (_, callback) in callbacks {
                callback(key);
            }
        }
    }

    /// Forcibly zero the work counted directly against `transition`, without
    /// running its completion callbacks.
    ///
    /// Work held by still-active child keys is left in place. Ancestors lose
    /// the same amount; those reaching zero complete normally and are
    /// returned, deepest first.
    pub fn clear(&mut self, transition: &Transition) -> Vec<String> {
        let key = transition.key();
        let Some(&count) = self.transitions.get(&key) else {
            self.on_done.remove(&key);
            return Vec::new();
        };
        let own = count.saturating_sub(self.direct_children_count(&key));
        if own == 0 {
            return Vec::new();
        }

        if count == own {
            self.transitions.remove(&key);
            self.on_done.remove(&key);
        } else if let Some(count) = self.transitions.get_mut(&key) {
            *count -= own;
        }
        tracing::debug!(transition = %key, cleared = own, "transition cleared");

        let mut finished = Vec::new();
        let ancestors = transition.ancestor_keys();
        for ancestor in ancestors.iter().rev().skip(1) {
            let Some(count) = self.transitions.get_mut(ancestor) else {
                continue;
            };
            *count = count.saturating_sub(own);
            if *count == 0 {
                self.finish(ancestor);
                finished.push(ancestor.clone());
            }
        }
        finished
    }

    fn direct_children_count(&self, key: &str) -> usize {
        let prefix = format!("{key}{DELIMITER}");
        self.transitions
            .iter()
            .filter(|(k, _)| {
                k.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.contains(DELIMITER))
            })
            .map(|(_, count)| *count)
            .sum()
    }

    /// Register a callback for when `transition` returns to zero.
    pub fn on_done(&mut self, transition: &Transition, callback: DoneCallback) -> CallbackId {
        self.next_callback += 1;
        let id = CallbackId(self.next_callback);
        self.on_done
            .entry(transition.key())
            .or_default()
            .push((id, callback));
        id
    }

    /// Withdraw a completion callback before it runs.
    pub fn remove_callback(&mut self, key: &str, id: CallbackId) -> bool {
        let Some(callbacks) = self.on_done.get_mut(key) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        let removed = callbacks.len() != before;
        if callbacks.is_empty() {
            self.on_done.remove(key);
        }
        removed
    }

    /// Number of completion callbacks still registered.
    pub fn callback_count(&self) -> usize {
        self.on_done.values().map(Vec::len).sum()
    }

    /// Drop the completion callbacks of `key` without running them.
    pub fn discard_callbacks(&mut self, key: &str) {
        self.on_done.remove(key);
    }

    /// True if the exact key or any ancestor is active.
    pub fn is_happening(&self, transition: &Transition) -> bool {
        transition
            .ancestor_keys()
            .iter()
            .any(|key| self.transitions.contains_key(key))
    }

    /// True only if the exact key is active.
    pub fn is_happening_unique(&self, transition: &Transition) -> bool {
        self.transitions.contains_key(&transition.key())
    }

    pub fn count(&self, transition: &Transition) -> usize {
        self.count_key(&transition.key())
    }

    pub fn count_key(&self, key: &str) -> usize {
        self.transitions.get(key).copied().unwrap_or(0)
    }

    pub fn add_subtransition(&mut self, key: &str, name: &str) {
        *self
            .subtransitions
            .entry(key.to_string())
            .or_default()
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    /// Returns how many sub-units named `name` remain.
    pub fn done_subtransition(&mut self, key: &str, name: &str) -> usize {
        decrement_scoped(&mut self.subtransitions, key, name)
    }

    pub fn subtransition_count(&self, key: &str, name: &str) -> usize {
        scoped_count(&self.subtransitions, key, name)
    }

    pub fn add_finish(&mut self, key: &str, id: &str) {
        *self
            .finishes
            .entry(key.to_string())
            .or_default()
            .entry(id.to_string())
            .or_insert(0) += 1;
    }

    /// Returns how many members of the finalizer group remain pending.
    pub fn done_finish(&mut self, key: &str, id: &str) -> usize {
        decrement_scoped(&mut self.finishes, key, id)
    }

    pub fn finish_count(&self, key: &str, id: &str) -> usize {
        scoped_count(&self.finishes, key, id)
    }

    /// Drop the sub-unit and finalizer counters of a terminated transition.
    pub fn forget(&mut self, key: &str) {
        self.subtransitions.remove(key);
        self.finishes.remove(key);
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.transitions.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of transitions holding sub-unit or finalizer counters.
    pub fn scoped_len(&self) -> usize {
        let mut keys: Vec<&String> = self
            .subtransitions
            .keys()
            .chain(self.finishes.keys())
            .collect();
        keys.sort();
        keys.dedup();
        keys.len()
    }

    pub fn is_idle(&self) -> bool {
        self.transitions.is_empty() && self.scoped_len() == 0
    }

    /// Number of decrements attempted on an inactive key.
    ///
    /// Anything above zero is a defect in the caller.
    pub fn underflows(&self) -> usize {
        self.underflows
    }
}

fn decrement_scoped(map: &mut HashMap<String, HashMap<String, usize>>, key: &str, name: &str) -> usize {
    let Some(counters) = map.get_mut(key) else {
        return 0;
    };
    let remaining = match counters.get_mut(name) {
        Some(count) => {
            *count = count.saturating_sub(1);
            *count
        }
        None => 0,
    };
    if remaining == 0 {
        counters.remove(name);
    }
    if counters.is_empty() {
        map.remove(key);
    }
    remaining
}

fn scoped_count(map: &HashMap<String, HashMap<String, usize>>, key: &str, name: &str) -> usize {
    map.get(key)
        .and_then(|counters| counters.get(name))
        .copied()
        .unwrap_or(0)
}

impl fmt::Debug for TransitionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionTracker")
            .field("transitions", &self.transitions)
            .field("subtransitions", &self.subtransitions)
            .field("finishes", &self.finishes)
            .field("underflows", &self.underflows)
            .finish()
    }
}
