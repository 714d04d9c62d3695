//! Builder for constructing engines.

use crate::builder::error::BuildError;
use crate::core::history::shallow_unequal;
use crate::core::{PushPolicy, State, Transition};
use crate::engine::{
    AbortHandler, Action, ActionType, Context, Engine, ErrorHandler, Hooks, InnerConfig, Reducer,
};
use crate::enforcement::Limits;
use crate::error::EngineError;
use crate::events::{EventBus, DEFAULT_EVENT_CAPACITY};
use crate::queue::QueueManager;
use std::fmt::Display;
use std::sync::Arc;
use stillwater::validation::Validation;
use stillwater::NonEmptyVec;

type BootstrapFn<S> = Box<dyn FnOnce() -> Result<S, String>>;

struct Bootstrap<S> {
    run: BootstrapFn<S>,
    fallback: fn() -> S,
}

/// Builder for [`Engine`] with a fluent API.
pub struct EngineBuilder<S: State, A: ActionType> {
    initial: Option<S>,
    bootstrap: Option<Bootstrap<S>>,
    reducer: Option<Reducer<S, A>>,
    limits: Limits,
    default_transition: Option<Transition>,
    hooks: Hooks,
    policy: PushPolicy<S>,
    history_capacity: Option<usize>,
    event_capacity: usize,
}

impl<S: State, A: ActionType> EngineBuilder<S, A> {
    pub fn new() -> Self {
        Self {
            initial: None,
            bootstrap: None,
            reducer: None,
            limits: Limits::default(),
            default_transition: None,
            hooks: Hooks::default(),
            policy: shallow_unequal(),
            history_capacity: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Set the initial state.
    pub fn initial(mut self, state: S) -> Self {
        self.initial = Some(state);
        self
    }

    /// Compute the initial state at build time.
    ///
    /// If `f` fails the engine starts from `S::default()`, records the
    /// failure as its bootstrap error and reports it to the error handlers
    /// under the bootstrap transition. Takes precedence over
    /// [`initial`](Self::initial).
    pub fn bootstrap<F, E>(mut self, f: F) -> Self
    where
        S: Default,
        F: FnOnce() -> Result<S, E> + 'static,
        E: Display,
    {
        self.bootstrap = Some(Bootstrap {
            run: Box::new(move || f().map_err(|e| e.to_string())),
            fallback: S::default,
        });
        self
    }

    /// Set the reducer. Without one every action is a no-op.
    pub fn reducer<F>(mut self, reducer: F) -> Self
    where
        F: Fn(&Action<A>, &mut Context<'_, S, A>) -> Result<(), EngineError> + Send + Sync + 'static,
    {
        self.reducer = Some(Arc::new(reducer));
        self
    }

    pub fn max_sync_dispatch_count(mut self, n: usize) -> Self {
        self.limits.max_sync_dispatch_count = n;
        self
    }

    pub fn max_actions_count(mut self, n: usize) -> Self {
        self.limits.max_actions_count = n;
        self
    }

    pub fn max_async_operations_count(mut self, n: usize) -> Self {
        self.limits.max_async_operations_count = n;
        self
    }

    /// Replace every limit at once, e.g. from [`Limits::from_json`].
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Transition used by dispatches and setters that name none.
    pub fn default_transition(mut self, transition: impl Into<Transition>) -> Self {
        self.default_transition = Some(transition.into());
        self
    }

    /// Add an error handler. Handlers run in registration order.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&Transition>, &EngineError) + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(handler);
        self.hooks.on_error.push(handler);
        self
    }

    pub fn on_abort<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Transition) + Send + Sync + 'static,
    {
        let handler: AbortHandler = Arc::new(handler);
        self.hooks.on_abort.push(handler);
        self
    }

    /// Decide whether a commit is appended to history. Defaults to
    /// appending only shallow-unequal states.
    pub fn history_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&S, &S) -> bool + Send + Sync + 'static,
    {
        self.policy = Arc::new(policy);
        self
    }

    /// Keep at most `capacity` history entries, dropping the oldest.
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = Some(capacity);
        self
    }

    /// Buffer size of each [`Engine::events`] receiver.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build the engine.
    ///
    /// Every configuration problem is reported: a single one as itself,
    /// several as [`BuildError::Invalid`].
    pub fn build(self) -> Result<Engine<S, A>, BuildError> {
        let (initial, bootstrap_error) = match self.bootstrap {
            Some(Bootstrap { run, fallback }) => match run() {
                Ok(state) => (Some(state), None),
                Err(message) => (Some(fallback()), Some(EngineError::Bootstrap(message))),
            },
            None => (self.initial, None),
        };

        let mut checks: Vec<Validation<(), NonEmptyVec<BuildError>>> = vec![
            if initial.is_some() {
                Validation::success(())
            } else {
                Validation::fail(BuildError::MissingInitialState)
            },
            if self.event_capacity > 0 {
                Validation::success(())
            } else {
                Validation::fail(BuildError::ZeroEventCapacity)
            },
        ];
        if let Validation::Failure(violations) = self.limits.validate() {
            checks.extend(
                violations
                    .iter()
                    .map(|violation| Validation::fail(BuildError::from(violation.clone()))),
            );
        }
        if let Validation::Failure(errors) = Validation::all_vec(checks) {
            let mut errors: Vec<BuildError> = errors.iter().cloned().collect();
            return Err(if errors.len() == 1 {
                errors.remove(0)
            } else {
                BuildError::Invalid(errors)
            });
        }
        let initial = initial.ok_or(BuildError::MissingInitialState)?;

        let reducer = self.reducer.unwrap_or_else(|| {
            let noop: Reducer<S, A> = Arc::new(|_: &Action<A>, _: &mut Context<'_, S, A>| Ok(()));
            noop
        });
        let config = InnerConfig {
            initial,
            reducer,
            limits: self.limits,
            default_transition: self.default_transition,
            policy: self.policy,
            history_capacity: self.history_capacity,
            events: EventBus::new(self.event_capacity),
            queues: QueueManager::new(),
            bootstrap_error,
        };
        Ok(Engine::new(config, self.hooks))
    }
}

impl<S: State, A: ActionType> Default for EngineBuilder<S, A> {
    fn default() -> Self {
        Self::new()
    }
}
