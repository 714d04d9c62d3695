//! The transition engine.
//!
//! An [`Engine`] owns committed state and every per-transition registry
//! behind one lock. Public calls take the lock, run synchronously to the end
//! of their dispatch chain, and deliver side effects (error handlers, abort
//! handlers, cancellation, operation launches, subscriber notification) only
//! after the lock is released.
//!
//! # Example
//!
//! ```rust
//! use transit::engine::{Action, ActionType, Engine};
//! use transit::state_struct;
//!
//! state_struct! {
//!     pub struct Counter {
//!         pub count: i64,
//!     }
//!     patch: CounterPatch
//! }
//!
//! #[derive(Clone, Debug)]
//! struct Increment;
//!
//! impl ActionType for Increment {
//!     fn kind(&self) -> &str {
//!         "increment"
//!     }
//! }
//!
//! let engine = Engine::<Counter, Increment>::builder()
//!     .initial(Counter::default())
//!     .reducer(|action, ctx| {
//!         if let Action::User(Increment) = action {
//!             ctx.update(|s: &Counter| CounterPatch { count: Some(s.count + 1) });
//!         }
//!         Ok(())
//!     })
//!     .build()
//!     .unwrap();
//!
//! engine.dispatch(Increment).unwrap();
//! assert_eq!(engine.state().count, 1);
//! ```

mod commit;
mod context;
mod dispatch;
mod inner;
mod operations;
mod wait;

pub use context::Context;
pub use dispatch::SET_STATE_KIND;
pub use wait::{WaitOutcome, WaitReason};

pub(crate) use inner::{EngineInner, InnerConfig};

use crate::builder::EngineBuilder;
use crate::core::{ActionRecord, ActionSource, History, Setter, State, Transition};
use crate::derive::{Derivation, StateView};
use crate::effects::{CancelToken, OperationRecord};
use crate::enforcement::Limits;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::notifier::{Notifier, SubscriptionId};
use crate::queue::QueueManager;
use dispatch::Op;
use operations::{drive_operation, Launch};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use wait::WaitSignal;

/// Kind reported for [`Action::Noop`].
pub const NOOP_KIND: &str = "@@noop";

/// User action types.
///
/// An action may name the transition it runs in; otherwise it inherits the
/// transition of whatever dispatched it.
pub trait ActionType: fmt::Debug + Send + Sync + 'static {
    /// Discriminator recorded in action logs and guard diagnostics.
    fn kind(&self) -> &str;

    fn transition(&self) -> Option<Transition> {
        None
    }
}

impl ActionType for () {
    fn kind(&self) -> &str {
        "()"
    }
}

/// What a reducer is invoked with.
#[derive(Clone, Debug, PartialEq)]
pub enum Action<A> {
    /// Sent for `set_state` requests and when re-running reducers for the
    /// optimistic preview.
    Noop,
    User(A),
}

impl<A: ActionType> Action<A> {
    pub fn kind(&self) -> &str {
        match self {
            Action::Noop => NOOP_KIND,
            Action::User(action) => action.kind(),
        }
    }

    pub fn as_user(&self) -> Option<&A> {
        match self {
            Action::Noop => None,
            Action::User(action) => Some(action),
        }
    }
}

pub type Reducer<S, A> =
    Arc<dyn Fn(&Action<A>, &mut Context<'_, S, A>) -> Result<(), EngineError> + Send + Sync>;

/// Receives the failing transition (if any) and its error.
pub type ErrorHandler = Arc<dyn Fn(Option<&Transition>, &EngineError) + Send + Sync>;

pub type AbortHandler = Arc<dyn Fn(&Transition) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hooks {
    pub on_error: Vec<ErrorHandler>,
    pub on_abort: Vec<AbortHandler>,
}

/// Side effects collected under the lock and delivered after it is released.
pub(crate) struct Outbox<S: State, A> {
    pub notify: bool,
    pub errors: Vec<(Option<Transition>, EngineError)>,
    pub aborts: Vec<Transition>,
    pub cancels: Vec<CancelToken>,
    pub launches: Vec<Launch<S, A>>,
}

impl<S: State, A> Default for Outbox<S, A> {
    fn default() -> Self {
        Self {
            notify: false,
            errors: Vec::new(),
            aborts: Vec::new(),
            cancels: Vec::new(),
            launches: Vec::new(),
        }
    }
}

/// Sizes of every transition-keyed registry.
///
/// Once all work has settled every count is zero; anything else is a leak.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub slots: usize,
    pub setters: usize,
    pub drafts: usize,
    pub waiters: usize,
    pub optimistic_entries: usize,
    pub live_operations: usize,
    pub operation_logs: usize,
    pub transition_views: usize,
    pub guard_owners: usize,
    pub active_transitions: usize,
    pub scoped_counters: usize,
    pub wait_signals: usize,
    pub done_callbacks: usize,
    pub tracker_underflows: usize,
}

impl RegistrySnapshot {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// A transition-aware state container.
///
/// Cloning is cheap; clones share the same state.
pub struct Engine<S: State, A: ActionType> {
    inner: Arc<Mutex<EngineInner<S, A>>>,
    hooks: Arc<Hooks>,
    notifier: Notifier,
    queues: QueueManager,
    events: EventBus,
}

impl<S: State, A: ActionType> Clone for Engine<S, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            hooks: Arc::clone(&self.hooks),
            notifier: self.notifier.clone(),
            queues: self.queues.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S: State, A: ActionType> fmt::Debug for Engine<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Engine")
            .field("state", &inner.committed)
            .field("active", &inner.tracker.active_keys())
            .finish()
    }
}

impl<S: State, A: ActionType> Engine<S, A> {
    pub fn builder() -> EngineBuilder<S, A> {
        EngineBuilder::new()
    }

    pub(crate) fn new(config: InnerConfig<S, A>, hooks: Hooks) -> Self {
        let queues = config.queues.clone();
        let events = config.events.clone();
        let bootstrap_error = config.bootstrap_error.clone();
        let engine = Self {
            inner: Arc::new(Mutex::new(EngineInner::new(config))),
            hooks: Arc::new(hooks),
            notifier: Notifier::new(),
            queues,
            events,
        };
        if let Some(error) = bootstrap_error {
            tracing::error!(%error, "bootstrap failed; starting from the fallback state");
            let mut outbox = Outbox::default();
            outbox.errors.push((Some(Transition::bootstrap()), error));
            engine.deliver(outbox);
        }
        engine
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut EngineInner<S, A>, &mut Outbox<S, A>) -> R) -> R {
        let mut outbox = Outbox::default();
        let result = {
            let mut inner = self.inner.lock();
            f(&mut inner, &mut outbox)
        };
        self.deliver(outbox);
        result
    }

    fn deliver(&self, outbox: Outbox<S, A>) {
        let Outbox {
            notify,
            errors,
            aborts,
            cancels,
            launches,
        } = outbox;

        for token in cancels {
            token.cancel();
        }
        for (transition, error) in &errors {
            for handler in &self.hooks.on_error {
                handler(transition.as_ref(), error);
            }
        }
        for transition in &aborts {
            for handler in &self.hooks.on_abort {
                handler(transition);
            }
        }
        for launch in launches {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(drive_operation(self.clone(), launch));
                }
                Err(_) => {
                    let error = EngineError::NoRuntime {
                        label: launch.label.clone(),
                    };
                    self.settle(launch.id, Err(error));
                }
            }
        }
        if notify {
            self.notifier.schedule();
        }
    }

    fn transition_for(inner: &EngineInner<S, A>, action: &A) -> Option<Transition> {
        action.transition().or_else(|| inner.default_transition.clone())
    }

    /// Run `action` and everything it dispatches synchronously.
    ///
    /// Reducer failures and the infinite-loop guard roll the whole chain
    /// back and are returned. Exceeding a transition's lifetime limits
    /// errors that transition instead and returns `Ok`.
    pub fn dispatch(&self, action: A) -> Result<(), EngineError> {
        self.with_inner(|inner, outbox| {
            let transition = Self::transition_for(inner, &action);
            inner.run_chain(transition, Op::Dispatch(action), ActionSource::Dispatch, outbox)
        })
    }

    /// Dispatch and wait for the transition to terminate.
    ///
    /// Resolves with the state the transition produced, or the error or
    /// cancellation that ended it. Actions without a transition run in a
    /// fresh one.
    pub async fn dispatch_async(&self, action: A) -> Result<S, EngineError> {
        let (tx, rx) = oneshot::channel();
        let (key, started) = self.with_inner(|inner, outbox| {
            let transition = Self::transition_for(inner, &action).unwrap_or_else(Transition::ephemeral);
            let key = transition.key();
            inner.ensure_slot(&key).waiters.push(tx);
            let started = inner.run_chain(Some(transition), Op::Dispatch(action), ActionSource::Dispatch, outbox);
            (key, started)
        });
        self.await_terminal(key, started, rx).await
    }

    /// Apply a setter, within `transition` when given.
    pub fn set_state(&self, setter: Setter<S>, transition: Option<Transition>) -> Result<(), EngineError> {
        self.with_inner(|inner, outbox| {
            let transition = transition.or_else(|| inner.default_transition.clone());
            inner.run_chain(transition, Op::Set(setter), ActionSource::SetState, outbox)
        })
    }

    pub async fn set_state_async(&self, setter: Setter<S>, transition: Option<Transition>) -> Result<S, EngineError> {
        let (tx, rx) = oneshot::channel();
        let (key, started) = self.with_inner(|inner, outbox| {
            let transition = transition
                .or_else(|| inner.default_transition.clone())
                .unwrap_or_else(Transition::ephemeral);
            let key = transition.key();
            inner.ensure_slot(&key).waiters.push(tx);
            let started = inner.run_chain(Some(transition), Op::Set(setter), ActionSource::SetState, outbox);
            (key, started)
        });
        self.await_terminal(key, started, rx).await
    }

    /// A chain that was rolled back fails its caller even if the transition
    /// it ran in finished cleanly.
    async fn await_terminal(
        &self,
        key: String,
        started: Result<(), EngineError>,
        rx: oneshot::Receiver<Result<S, EngineError>>,
    ) -> Result<S, EngineError> {
        if let Err(error) = started {
            drop(rx);
            self.with_inner(|inner, _| inner.prune_waiters(&key));
            return Err(error);
        }
        rx.await.unwrap_or_else(|_| Err(EngineError::cancelled(key)))
    }

    /// Committed state.
    pub fn state(&self) -> S {
        self.inner.lock().committed.clone()
    }

    /// Committed state with every registered optimistic setter applied.
    pub fn optimistic_state(&self) -> S {
        self.inner.lock().optimistic_state()
    }

    /// Register a listener called after state or optimistic changes.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.notifier.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn history(&self) -> History<S> {
        self.inner.lock().history.clone()
    }

    /// Whether `transition` or any of its ancestors has active work.
    pub fn is_happening(&self, transition: impl Into<Transition>) -> bool {
        self.inner.lock().tracker.is_happening(&transition.into())
    }

    /// Whether exactly `transition` has active work.
    pub fn is_happening_unique(&self, transition: impl Into<Transition>) -> bool {
        self.inner.lock().tracker.is_happening_unique(&transition.into())
    }

    /// Operations started by `transition` or its descendants while it was
    /// active.
    pub fn operations(&self, transition: impl Into<Transition>) -> Vec<OperationRecord> {
        let key = transition.into().key();
        self.inner.lock().operation_log.get(&key).cloned().unwrap_or_default()
    }

    /// Actions processed in `transition` while it is active.
    pub fn actions(&self, transition: impl Into<Transition>) -> Vec<ActionRecord> {
        let key = transition.into().key();
        self.inner
            .lock()
            .slots
            .get(&key)
            .map(|slot| slot.actions.clone())
            .unwrap_or_default()
    }

    /// Resolves once every operation queue has drained.
    pub async fn flush(&self) {
        self.queues.flush().await;
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        self.inner.lock().snapshot()
    }

    /// Whether no transition-keyed registry holds anything.
    pub fn is_clean(&self) -> bool {
        self.registry_snapshot().is_clean()
    }

    /// Evaluate a derivation against committed state.
    pub fn derive<I, D>(&self, derivation: &Derivation<S, I, D>) -> D
    where
        I: PartialEq + Send + 'static,
        D: Clone + Send + 'static,
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.derivations.get(StateView::Committed, derivation, &inner.committed)
    }

    /// Evaluate a derivation against the optimistic preview.
    pub fn derive_optimistic<I, D>(&self, derivation: &Derivation<S, I, D>) -> D
    where
        I: PartialEq + Send + 'static,
        D: Clone + Send + 'static,
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let state = inner.optimistic_state();
        inner.derivations.get(StateView::Optimistic, derivation, &state)
    }

    /// Drop every cached getter of `derivation`. Returns `true` if any
    /// view held one.
    pub fn forget_derivation<I, D>(&self, derivation: &Derivation<S, I, D>) -> bool {
        self.inner.lock().derivations.forget(derivation.id()) > 0
    }

    /// Set when the initial state could not be constructed.
    pub fn bootstrap_error(&self) -> Option<EngineError> {
        self.inner.lock().bootstrap_error.clone()
    }

    pub fn limits(&self) -> Limits {
        self.inner.lock().limits
    }

    /// Cancel `transition`. A trailing nested marker cancels every
    /// descendant too. Returns `false` if nothing was active.
    pub fn abort(&self, transition: impl Into<Transition>) -> bool {
        let transition = transition.into();
        self.with_inner(|inner, outbox| inner.abort(&transition, outbox))
    }

    /// Wait up to `timeout` for `transition` to finish.
    ///
    /// An inactive transition completes immediately. A timeout leaves the
    /// transition running.
    pub async fn wait_for(&self, transition: impl Into<Transition>, timeout: Duration) -> WaitOutcome {
        let transition = transition.into();
        let key = transition.key();
        let registered = self.with_inner(|inner, _| {
            if !inner.tracker.is_happening_unique(&transition) {
                return None;
            }
            let (signal, rx) = WaitSignal::new();
            let on_done = signal.clone();
            let callback = inner
                .tracker
                .on_done(&transition, Box::new(move |_| on_done.fire(WaitReason::Completed)));
            inner.wait_signals.entry(key.clone()).or_default().push(signal.clone());
            Some((signal, callback, rx))
        });
        let Some((signal, callback, rx)) = registered else {
            return WaitReason::Completed.into();
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reason)) => reason.into(),
            Ok(Err(_)) => WaitReason::Error.into(),
            Err(_) => {
                tracing::debug!(transition = %transition, ?timeout, "wait timed out");
                self.with_inner(|inner, _| inner.withdraw_wait(&key, &signal, callback));
                WaitReason::Timeout.into()
            }
        }
    }
}
