//! The engine context every internal function receives by reference.

use super::wait::WaitSignal;
use super::{ActionType, Reducer, RegistrySnapshot};
use crate::core::history::History;
use crate::core::{ActionRecord, PushPolicy, Setter, State, Transition, DELIMITER};
use crate::derive::{DerivationRegistry, StateView};
use crate::effects::{CancelToken, Finalizer, OperationKind, OperationRecord, OperationStatus};
use crate::enforcement::{GuardCounters, Limits};
use crate::error::EngineError;
use crate::events::EventBus;
use crate::optimistic::{compute_preview, OptimisticRegistry};
use crate::queue::QueueManager;
use crate::tracker::{CallbackId, TransitionTracker};
use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

pub(crate) type Waiter<S> = oneshot::Sender<Result<S, EngineError>>;

/// A setter stamped with the engine-wide order it was registered in.
pub(crate) struct Staged<S: State> {
    pub sequence: u64,
    pub setter: Setter<S>,
}

/// Everything the engine keeps about one active transition key.
pub(crate) struct Slot<S: State> {
    /// Setters in registration order
    pub setters: Vec<Staged<S>>,
    /// Working copy, created on the first setter
    pub draft: Option<S>,
    pub token: CancelToken,
    /// Owning transition of a sub-branch
    pub parent: Option<String>,
    /// `dispatch_async` callers awaiting the terminal state
    pub waiters: Vec<Waiter<S>>,
    pub actions: Vec<ActionRecord>,
    pub generation: u64,
}

/// An operation that has been launched and not yet settled.
pub(crate) struct LiveOp<S: State, A> {
    pub transition: Transition,
    pub key: String,
    pub label: String,
    pub kind: OperationKind,
    pub finish: Option<(String, Finalizer<S, A>)>,
    pub generation: u64,
}

pub(crate) struct EngineInner<S: State, A: ActionType> {
    pub committed: S,
    pub history: History<S>,
    pub policy: PushPolicy<S>,
    pub reducer: Reducer<S, A>,
    pub limits: Limits,
    pub default_transition: Option<Transition>,
    pub tracker: TransitionTracker,
    pub slots: HashMap<String, Slot<S>>,
    pub optimistic: OptimisticRegistry<S>,
    pub derivations: DerivationRegistry,
    pub guards: GuardCounters,
    pub live_ops: HashMap<Uuid, LiveOp<S, A>>,
    /// Operation records per transition key and every ancestor key
    pub operation_log: HashMap<String, Vec<OperationRecord>>,
    pub wait_signals: HashMap<String, Vec<WaitSignal>>,
    pub events: EventBus,
    pub queues: QueueManager,
    /// Bumped on every commit
    pub revision: u64,
    /// Optimistic preview keyed by (registry revision, commit revision)
    pub preview: Option<(u64, u64, S)>,
    /// Orders action records and staged setters
    pub sequence: u64,
    pub next_generation: u64,
    pub bootstrap_error: Option<EngineError>,
}

pub(crate) struct InnerConfig<S: State, A: ActionType> {
    pub initial: S,
    pub reducer: Reducer<S, A>,
    pub limits: Limits,
    pub default_transition: Option<Transition>,
    pub policy: PushPolicy<S>,
    pub history_capacity: Option<usize>,
    pub events: EventBus,
    pub queues: QueueManager,
    pub bootstrap_error: Option<EngineError>,
}

impl<S: State, A: ActionType> EngineInner<S, A> {
    pub fn new(config: InnerConfig<S, A>) -> Self {
        Self {
            history: History::new(config.initial.clone()).with_capacity_limit(config.history_capacity),
            committed: config.initial,
            policy: config.policy,
            reducer: config.reducer,
            limits: config.limits,
            default_transition: config.default_transition,
            tracker: TransitionTracker::new(config.events.clone()),
            slots: HashMap::new(),
            optimistic: OptimisticRegistry::new(),
            derivations: DerivationRegistry::new(),
            guards: GuardCounters::new(),
            live_ops: HashMap::new(),
            operation_log: HashMap::new(),
            wait_signals: HashMap::new(),
            events: config.events,
            queues: config.queues,
            revision: 0,
            preview: None,
            sequence: 0,
            next_generation: 0,
            bootstrap_error: config.bootstrap_error,
        }
    }

    pub fn ensure_slot(&mut self, key: &str) -> &mut Slot<S> {
        let next_generation = &mut self.next_generation;
        self.slots.entry(key.to_string()).or_insert_with(|| {
            *next_generation += 1;
            Slot {
                setters: Vec::new(),
                draft: None,
                token: CancelToken::new(),
                parent: None,
                waiters: Vec::new(),
                actions: Vec::new(),
                generation: *next_generation,
            }
        })
    }

    /// Create a sub-branch slot linked to `parent`, with a token cancelled
    /// along with the parent's.
    pub fn open_sub_branch(&mut self, sub: &str, parent: &str) {
        let token = self.ensure_slot(parent).token.child();
        let slot = self.ensure_slot(sub);
        slot.parent = Some(parent.to_string());
        slot.token = token;
    }

    /// First ancestor along sub-branch links that is not itself a sub-branch.
    pub fn owner_of(&self, key: &str) -> String {
        let mut current = key.to_string();
        while let Some(parent) = self.slots.get(&current).and_then(|slot| slot.parent.clone()) {
            current = parent;
        }
        current
    }

    /// Sub-branches owned by `owner`, deepest first.
    pub fn sub_branches_of(&self, owner: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .slots
            .keys()
            .filter(|key| key.as_str() != owner && self.owner_of(key) == owner)
            .cloned()
            .collect();
        sort_deepest_first(&mut keys);
        keys
    }

    /// The state a transition's draft is seeded from: the parent's draft for
    /// sub-branches, committed state otherwise.
    pub fn base_state(&self, key: &str) -> S {
        let mut current = key;
        while let Some(parent) = self.slots.get(current).and_then(|slot| slot.parent.as_deref()) {
            if let Some(draft) = self.slots.get(parent).and_then(|slot| slot.draft.as_ref()) {
                return draft.clone();
            }
            current = parent;
        }
        self.committed.clone()
    }

    /// The draft of `key`, or the state it would be seeded from.
    pub fn working_state(&self, key: &str) -> S {
        match self.slots.get(key).and_then(|slot| slot.draft.as_ref()) {
            Some(draft) => draft.clone(),
            None => self.base_state(key),
        }
    }

    pub fn set_operation_status(&mut self, transition: &Transition, id: Uuid, status: OperationStatus) {
        for key in transition.ancestor_keys() {
            if let Some(log) = self.operation_log.get_mut(&key) {
                for record in log.iter_mut().filter(|record| record.id == id) {
                    record.status = status;
                }
            }
        }
    }

    pub fn optimistic_state(&mut self) -> S {
        let revision = self.optimistic.revision();
        if let Some((optimistic, committed, state)) = &self.preview {
            if *optimistic == revision && *committed == self.revision {
                return state.clone();
            }
        }
        let reducer = self.reducer.clone();
        let preview = compute_preview(&self.committed, self.optimistic.entries(), |state| {
            let mut ctx = super::Context::inert(state.clone());
            match reducer(&super::Action::Noop, &mut ctx) {
                Ok(()) => Some(ctx.into_parts().0),
                Err(error) => {
                    tracing::warn!(%error, "reducer failed while computing optimistic state");
                    None
                }
            }
        });
        self.preview = Some((revision, self.revision, preview.clone()));
        preview
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            slots: self.slots.len(),
            setters: self.slots.values().map(|slot| slot.setters.len()).sum(),
            drafts: self.slots.values().filter(|slot| slot.draft.is_some()).count(),
            waiters: self.slots.values().map(|slot| slot.waiters.len()).sum(),
            optimistic_entries: self.optimistic.len(),
            live_operations: self.live_ops.len(),
            operation_logs: self.operation_log.len(),
            transition_views: self.derivations.transition_views().len(),
            guard_owners: self.guards.len(),
            active_transitions: self.tracker.active_keys().len(),
            scoped_counters: self.tracker.scoped_len(),
            wait_signals: self.wait_signals.values().map(Vec::len).sum(),
            done_callbacks: self.tracker.callback_count(),
            tracker_underflows: self.tracker.underflows(),
        }
    }

    /// Forget a wait that gave up before `key` finished.
    pub fn withdraw_wait(&mut self, key: &str, signal: &WaitSignal, callback: CallbackId) {
        self.tracker.remove_callback(key, callback);
        if let Some(signals) = self.wait_signals.get_mut(key) {
            signals.retain(|existing| !existing.same(signal));
            if signals.is_empty() {
                self.wait_signals.remove(key);
            }
        }
    }

    /// Drop waiters whose caller stopped listening.
    pub fn prune_waiters(&mut self, key: &str) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.waiters.retain(|waiter| !waiter.is_closed());
        }
    }

    pub fn drop_transition_view(&mut self, key: &str) {
        self.derivations.drop_view(&StateView::Transition(key.to_string()));
    }
}

pub(crate) fn sort_deepest_first(keys: &mut [String]) {
    keys.sort_by(|a, b| {
        let depth = |key: &str| key.matches(DELIMITER).count();
        depth(b).cmp(&depth(a)).then_with(|| a.cmp(b))
    });
}

#[cfg(test)]
impl<S: State, A: ActionType> EngineInner<S, A> {
    /// An engine core with default limits and a reducer that does nothing.
    pub fn for_tests(initial: S) -> Self {
        let reducer: Reducer<S, A> =
            std::sync::Arc::new(|_: &super::Action<A>, _: &mut super::Context<'_, S, A>| Ok(()));
        Self::new(InnerConfig {
            initial,
            reducer,
            limits: Limits::default(),
            default_transition: None,
            policy: crate::core::history::shallow_unequal(),
            history_capacity: None,
            events: EventBus::default(),
            queues: QueueManager::new(),
            bootstrap_error: None,
        })
    }
}
