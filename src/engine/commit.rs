//! Terminal paths of a transition: commit, error and abort.
//!
//! Every terminal path ends in [`purge`](EngineInner::purge), which removes
//! each transition-keyed registry entry so nothing is read after
//! termination.

use super::inner::{sort_deepest_first, EngineInner, Staged};
use super::wait::WaitReason;
use super::{ActionType, Outbox};
use crate::core::{fold, key_is_ancestor_of, State, Transition};
use crate::effects::OperationStatus;
use crate::error::EngineError;
use crate::events::EngineEvent;
use chrono::Utc;
use uuid::Uuid;

enum Termination {
    Error(EngineError),
    Abort,
}

impl<S: State, A: ActionType> EngineInner<S, A> {
    /// Handle a key whose reference count returned to zero.
    ///
    /// A sub-branch merges its setters into its parent; any other key folds
    /// its setters over committed state and commits the result.
    pub(crate) fn process_finished(&mut self, key: &str, outbox: &mut Outbox<S, A>) {
        let Some(slot) = self.slots.get_mut(key) else {
            self.purge(key, outbox);
            return;
        };
        let setters = std::mem::take(&mut slot.setters);
        let waiters = std::mem::take(&mut slot.waiters);
        let parent = slot.parent.clone();

        let result = match parent {
            Some(parent) if self.slots.contains_key(&parent) => {
                tracing::trace!(transition = key, parent = %parent, setters = setters.len(), "sub-branch folded");
                self.merge_into_parent(&parent, setters)
            }
            Some(parent) => {
                tracing::warn!(transition = key, parent = %parent, "sub-branch finished after its parent");
                self.committed.clone()
            }
            None => {
                if !setters.is_empty() {
                    let next = fold(self.committed.clone(), setters.iter().map(|staged| &staged.setter));
                    self.commit_state(next, Some(Transition::from_key(key)), outbox);
                }
                self.committed.clone()
            }
        };

        for waiter in waiters {
            let _ = waiter.send(Ok(result.clone()));
        }
        self.purge(key, outbox);
    }

    /// Interleave a finished sub-branch's setters with its parent's by
    /// registration order and rebuild the parent's draft from them.
    ///
    /// Returns the parent's new working state.
    pub(crate) fn merge_into_parent(&mut self, parent: &str, setters: Vec<Staged<S>>) -> S {
        let base = self.base_state(parent);
        let Some(slot) = self.slots.get_mut(parent) else {
            return base;
        };
        if setters.is_empty() {
            return slot.draft.clone().unwrap_or(base);
        }
        let mut merged = std::mem::take(&mut slot.setters);
        merged.extend(setters);
        merged.sort_by_key(|staged| staged.sequence);
        let draft = fold(base, merged.iter().map(|staged| &staged.setter));
        slot.setters = merged;
        slot.draft = Some(draft.clone());
        draft
    }

    /// Make `next` canonical.
    pub(crate) fn commit_state(&mut self, next: S, transition: Option<Transition>, outbox: &mut Outbox<S, A>) {
        let key = transition.as_ref().map(Transition::key);
        let appended = self.history.record(next.clone(), transition, &self.policy);
        self.committed = next;
        self.revision += 1;
        outbox.notify = true;
        tracing::debug!(transition = ?key, appended, "state committed");
        self.events.emit(EngineEvent::Committed {
            transition: key,
            appended_to_history: appended,
            at: Utc::now(),
        });
    }

    /// Remove every registry entry keyed by `key`.
    pub(crate) fn purge(&mut self, key: &str, outbox: &mut Outbox<S, A>) {
        self.slots.remove(key);
        if self.optimistic.clear_transition(key) > 0 {
            outbox.notify = true;
        }
        self.drop_transition_view(key);
        self.guards.forget(key);
        self.tracker.forget(key);
        self.operation_log.remove(key);
        self.wait_signals.remove(key);

        let orphaned: Vec<Uuid> = self
            .live_ops
            .iter()
            .filter(|(_, op)| op.key == key)
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            if let Some(op) = self.live_ops.remove(&id) {
                tracing::warn!(transition = key, label = %op.label, "operation cancelled");
                self.set_operation_status(&op.transition, id, OperationStatus::Cancelled);
                self.events.emit(EngineEvent::OperationCompleted {
                    transition: op.key,
                    operation: id,
                    label: op.label,
                    status: OperationStatus::Cancelled,
                    at: Utc::now(),
                });
            }
        }
        tracing::trace!(transition = key, "transition purged");
    }

    /// Error the owner of `key` and every sub-branch it owns.
    ///
    /// Returns the keys that were terminated.
    pub(crate) fn error_transition(&mut self, key: &str, error: EngineError, outbox: &mut Outbox<S, A>) -> Vec<String> {
        let owner = self.owner_of(key);
        let mut targets = self.sub_branches_of(&owner);
        targets.push(owner.clone());
        tracing::debug!(transition = %owner, %error, "transition failed");

        self.terminate(&targets, &Termination::Error(error.clone()), outbox);
        outbox.errors.push((Some(Transition::from_key(&owner)), error));
        targets
    }

    /// Cancel a transition. With a trailing nested marker every descendant
    /// key is cancelled too.
    ///
    /// Returns `false` if nothing was active.
    pub(crate) fn abort(&mut self, transition: &Transition, outbox: &mut Outbox<S, A>) -> bool {
        let base = transition.without_nested_marker();
        let base_key = base.key();

        let mut targets: Vec<String> = if transition.is_nested() {
            self.slots
                .keys()
                .filter(|key| key_is_ancestor_of(&base_key, key))
                .cloned()
                .collect()
        } else {
            self.sub_branches_of(&base_key)
        };
        if !targets.contains(&base_key) && (self.slots.contains_key(&base_key) || self.tracker.is_happening_unique(&base)) {
            targets.push(base_key.clone());
        }
        if targets.is_empty() {
            tracing::trace!(transition = %base_key, "abort of inactive transition ignored");
            return false;
        }
        sort_deepest_first(&mut targets);
        tracing::debug!(transition = %base_key, targets = targets.len(), "transition aborted");

        self.terminate(&targets, &Termination::Abort, outbox);
        outbox.aborts.push(base);
        true
    }

    fn terminate(&mut self, targets: &[String], how: &Termination, outbox: &mut Outbox<S, A>) {
        for target in targets {
            self.tracker.discard_callbacks(target);
            for signal in self.wait_signals.remove(target).unwrap_or_default() {
                signal.fire(WaitReason::Error);
            }
            let failure = match how {
                Termination::Error(error) => error.clone(),
                Termination::Abort => EngineError::cancelled(target.clone()),
            };
            if let Some(slot) = self.slots.get_mut(target) {
                outbox.cancels.push(slot.token.clone());
                for waiter in slot.waiters.drain(..) {
                    let _ = waiter.send(Err(failure.clone()));
                }
            }
            self.events.emit(match how {
                Termination::Error(error) => EngineEvent::TransitionError {
                    transition: target.clone(),
                    message: error.to_string(),
                    at: Utc::now(),
                },
                Termination::Abort => EngineEvent::TransitionAborted {
                    transition: target.clone(),
                    at: Utc::now(),
                },
            });
        }

        let mut finished = Vec::new();
        for target in targets {
            finished.extend(self.tracker.clear(&Transition::from_key(target)));
        }
        for target in targets {
            self.purge(target, outbox);
        }
        finished.retain(|key| !targets.contains(key));
        for key in finished {
            self.process_finished(&key, outbox);
        }
    }
}
