//! Synchronous dispatch chains.
//!
//! One call into the engine runs a chain: the requested action plus every
//! action reducers dispatch from it, processed depth-first from an explicit
//! stack rather than by recursion. Effects are recorded against an undo
//! list; a reducer error rolls every one of them back.

use super::context::{Context, Effect};
use super::inner::{EngineInner, Staged};
use super::{Action, ActionType, Outbox};
use crate::core::{ActionRecord, ActionSource, Setter, State, Transition};
use crate::derive::StateView;
use crate::effects::AsyncOp;
use crate::enforcement::SyncGuard;
use crate::error::EngineError;
use chrono::Utc;
use std::sync::Arc;

/// Kind recorded for `set_state` requests.
pub const SET_STATE_KIND: &str = "@@set_state";

pub(crate) enum Op<S: State, A> {
    Dispatch(A),
    Set(Setter<S>),
}

struct Frame<S: State, A> {
    transition: Option<Transition>,
    op: Op<S, A>,
    source: ActionSource,
}

enum Undo<S: State> {
    Setter { key: String, previous: Option<S> },
    Optimistic(u64),
    Action { owner: String, key: String },
}

enum Failure {
    /// Rolled back and returned to the caller.
    Thrown {
        error: EngineError,
        transition: Option<Transition>,
    },
    /// Rolled back and sent to the owner's error channel.
    Routed { error: EngineError, owner: String },
}

struct Chain<S: State, A> {
    stack: Vec<Frame<S, A>>,
    undo: Vec<Undo<S>>,
    /// Transitions kept open until the chain ends
    held: Vec<Transition>,
    spawns: Vec<(Transition, AsyncOp<S, A>)>,
    /// Transition-less writes, committed when the chain ends
    scratch: Option<S>,
    scratch_dirty: bool,
    sync: SyncGuard,
}

impl<S: State, A: ActionType> EngineInner<S, A> {
    pub(crate) fn run_chain(
        &mut self,
        transition: Option<Transition>,
        op: Op<S, A>,
        source: ActionSource,
        outbox: &mut Outbox<S, A>,
    ) -> Result<(), EngineError> {
        let mut chain = Chain {
            stack: vec![Frame {
                transition,
                op,
                source,
            }],
            undo: Vec::new(),
            held: Vec::new(),
            spawns: Vec::new(),
            scratch: None,
            scratch_dirty: false,
            sync: SyncGuard::new(self.limits.max_sync_dispatch_count),
        };

        let result = match self.drive_chain(&mut chain, outbox) {
            Ok(()) => {
                self.complete_chain(&mut chain, outbox);
                Ok(())
            }
            Err(failure) => {
                self.rollback(&mut chain);
                match failure {
                    Failure::Thrown { error, transition } => {
                        tracing::debug!(%error, "dispatch rolled back");
                        if let Some(transition) = transition {
                            let cleared = self.error_transition(&transition.key(), error.clone(), outbox);
                            chain.held.retain(|held| !cleared.contains(&held.key()));
                        }
                        Err(error)
                    }
                    Failure::Routed { error, owner } => {
                        let cleared = self.error_transition(&owner, error, outbox);
                        chain.held.retain(|held| !cleared.contains(&held.key()));
                        Ok(())
                    }
                }
            }
        };

        self.release(std::mem::take(&mut chain.held), outbox);
        result
    }

    fn drive_chain(&mut self, chain: &mut Chain<S, A>, outbox: &mut Outbox<S, A>) -> Result<(), Failure> {
        while let Some(Frame {
            transition,
            op,
            source,
        }) = chain.stack.pop()
        {
            let kind = match &op {
                Op::Dispatch(action) => action.kind().to_string(),
                Op::Set(_) => SET_STATE_KIND.to_string(),
            };
            let key = transition.as_ref().map(Transition::key);

            if let Err(violation) = chain.sync.step(&kind) {
                let error = violation.into_error(key.as_deref().unwrap_or_default());
                return Err(Failure::Thrown { error, transition });
            }
            if let Some(t) = &transition {
                self.enter(chain, t, &kind, source)?;
            }

            let action = match op {
                Op::Dispatch(action) => Action::User(action),
                Op::Set(setter) => {
                    self.record_setter(chain, transition.as_ref(), setter);
                    Action::Noop
                }
            };

            let (state, view) = match &key {
                Some(key) => (self.working_state(key), StateView::Transition(key.clone())),
                None => {
                    let scratch = chain.scratch.get_or_insert_with(|| self.committed.clone());
                    (scratch.clone(), StateView::Committed)
                }
            };
            let reducer = Arc::clone(&self.reducer);
            let mut ctx = Context::new(state, transition.clone(), Some((&mut self.derivations, view)));
            let result = reducer(&action, &mut ctx);
            let (_, effects) = ctx.into_parts();
            if let Err(error) = result {
                tracing::debug!(kind = %kind, %error, "reducer failed");
                return Err(Failure::Thrown { error, transition });
            }

            let mut children = Vec::new();
            for effect in effects {
                match effect {
                    Effect::Set(setter) => self.record_setter(chain, transition.as_ref(), setter),
                    Effect::Optimistic(setter) => match &key {
                        Some(key) => {
                            let id = self.optimistic.register(key, setter);
                            chain.undo.push(Undo::Optimistic(id));
                            outbox.notify = true;
                        }
                        None => tracing::warn!(kind = %kind, "optimistic setter outside a transition ignored"),
                    },
                    Effect::Spawn(operation) => {
                        if tokio::runtime::Handle::try_current().is_err() {
                            let error = EngineError::NoRuntime {
                                label: operation.label().to_string(),
                            };
                            return Err(Failure::Thrown { error, transition });
                        }
                        let target = transition.clone().unwrap_or_else(Transition::ephemeral);
                        chain.spawns.push((target, operation));
                    }
                    Effect::Dispatch(action) => {
                        let target = action.transition().or_else(|| transition.clone());
                        children.push(Frame {
                            transition: target,
                            op: Op::Dispatch(action),
                            source: ActionSource::Dispatch,
                        });
                    }
                }
            }
            chain.stack.extend(children.into_iter().rev());
        }
        Ok(())
    }

    /// Hold the transition open for the rest of the chain and count the
    /// action against its owner.
    fn enter(
        &mut self,
        chain: &mut Chain<S, A>,
        transition: &Transition,
        kind: &str,
        source: ActionSource,
    ) -> Result<(), Failure> {
        let key = transition.key();
        if !chain.held.contains(transition) {
            self.tracker.add_key(transition);
            chain.held.push(transition.clone());
        }
        self.ensure_slot(&key);

        let owner = self.owner_of(&key);
        if let Err(violation) = self.guards.record_action(&owner, &self.limits) {
            let error = violation.into_error(&owner);
            return Err(Failure::Routed { error, owner });
        }

        self.sequence += 1;
        let record = ActionRecord {
            kind: kind.to_string(),
            timestamp: Utc::now(),
            depth: transition.depth(),
            source,
            sequence: self.sequence,
        };
        self.ensure_slot(&key).actions.push(record);
        chain.undo.push(Undo::Action { owner, key });
        Ok(())
    }

    fn record_setter(&mut self, chain: &mut Chain<S, A>, transition: Option<&Transition>, setter: Setter<S>) {
        match transition {
            None => {
                let scratch = chain.scratch.get_or_insert_with(|| self.committed.clone());
                setter.apply(scratch);
                chain.scratch_dirty = true;
            }
            Some(transition) => {
                let key = transition.key();
                let mut draft = self.working_state(&key);
                setter.apply(&mut draft);
                self.sequence += 1;
                let sequence = self.sequence;
                let slot = self.ensure_slot(&key);
                let previous = slot.draft.replace(draft);
                slot.setters.push(Staged { sequence, setter });
                chain.undo.push(Undo::Setter { key, previous });
            }
        }
    }

    fn rollback(&mut self, chain: &mut Chain<S, A>) {
        while let Some(entry) = chain.undo.pop() {
            match entry {
                Undo::Setter { key, previous } => {
                    if let Some(slot) = self.slots.get_mut(&key) {
                        slot.setters.pop();
                        slot.draft = previous;
                    }
                }
                Undo::Optimistic(id) => {
                    self.optimistic.remove(id);
                }
                Undo::Action { owner, key } => {
                    self.guards.unrecord_action(&owner);
                    if let Some(slot) = self.slots.get_mut(&key) {
                        slot.actions.pop();
                    }
                }
            }
        }
        chain.spawns.clear();
        chain.scratch = None;
        chain.scratch_dirty = false;
    }

    fn complete_chain(&mut self, chain: &mut Chain<S, A>, outbox: &mut Outbox<S, A>) {
        let mut cleared: Vec<String> = Vec::new();
        for (transition, operation) in chain.spawns.drain(..) {
            let owner = self.owner_of(&transition.key());
            if cleared.contains(&owner) {
                continue;
            }
            if let Err(error) = self.register_operation(&transition, operation, outbox) {
                cleared.extend(self.error_transition(&owner, error, outbox));
            }
        }
        chain.held.retain(|held| !cleared.contains(&held.key()));

        if chain.scratch_dirty {
            if let Some(state) = chain.scratch.take() {
                self.commit_state(state, None, outbox);
            }
        }
    }

    /// Drop the chain's hold on each transition, finishing those that reach
    /// zero.
    pub(crate) fn release(&mut self, held: Vec<Transition>, outbox: &mut Outbox<S, A>) {
        for transition in held {
            for key in self.tracker.done_key(&transition) {
                self.process_finished(&key, outbox);
            }
        }
    }
}
