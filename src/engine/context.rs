use crate::core::{Setter, State, Transition};
use crate::derive::{Derivation, DerivationRegistry, StateView};
use crate::effects::AsyncOp;

/// A side effect requested by a reducer, applied once it returns `Ok`.
pub(crate) enum Effect<S: State, A> {
    Set(Setter<S>),
    Optimistic(Setter<S>),
    Dispatch(A),
    Spawn(AsyncOp<S, A>),
}

/// What a reducer sees and acts through.
///
/// Setters applied through the context are visible to later reads within
/// the same reducer call. Nothing reaches the engine unless the reducer
/// returns `Ok`; an `Err` discards every effect the call requested.
///
/// An inert context (used to re-run reducers for the optimistic preview)
/// accepts setters but ignores optimistic setters, dispatches and spawned
/// operations.
pub struct Context<'a, S: State, A> {
    state: S,
    transition: Option<Transition>,
    effects: Vec<Effect<S, A>>,
    derivations: Option<(&'a mut DerivationRegistry, StateView)>,
    depth: usize,
}

impl<'a, S: State, A> Context<'a, S, A> {
    pub(crate) fn new(
        state: S,
        transition: Option<Transition>,
        derivations: Option<(&'a mut DerivationRegistry, StateView)>,
    ) -> Self {
        Self {
            state,
            transition,
            effects: Vec::new(),
            derivations,
            depth: 0,
        }
    }

    pub(crate) fn inert(state: S) -> Self {
        Self {
            state,
            transition: None,
            effects: Vec::new(),
            derivations: None,
            depth: 1,
        }
    }

    pub(crate) fn into_parts(self) -> (S, Vec<Effect<S, A>>) {
        (self.state, self.effects)
    }

    /// The working state, including setters applied so far in this call.
    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn transition(&self) -> Option<&Transition> {
        self.transition.as_ref()
    }

    /// True when running for the optimistic preview.
    pub fn is_inert(&self) -> bool {
        self.depth > 0
    }

    /// Merge a literal partial state.
    pub fn set(&mut self, patch: S::Patch) {
        self.apply(Setter::patch(patch));
    }

    /// Merge the partial state computed from the current state.
    pub fn update<F>(&mut self, f: F)
    where
        F: Fn(&S) -> S::Patch + Send + Sync + 'static,
    {
        self.apply(Setter::update(f));
    }

    pub fn apply(&mut self, setter: Setter<S>) {
        setter.apply(&mut self.state);
        if !self.is_inert() {
            self.effects.push(Effect::Set(setter));
        }
    }

    /// Register a speculative setter shown in the optimistic preview until
    /// the transition terminates.
    pub fn optimistic(&mut self, setter: Setter<S>) {
        if !self.is_inert() {
            self.effects.push(Effect::Optimistic(setter));
        }
    }

    /// Dispatch another action in the same tick once this call returns.
    ///
    /// The action runs in its own transition if it names one, otherwise in
    /// this call's transition.
    pub fn dispatch(&mut self, action: A) {
        if !self.is_inert() {
            self.effects.push(Effect::Dispatch(action));
        }
    }

    /// Start an asynchronous operation counted against this call's
    /// transition.
    pub fn spawn(&mut self, operation: AsyncOp<S, A>) {
        if !self.is_inert() {
            self.effects.push(Effect::Spawn(operation));
        }
    }

    /// Evaluate a derivation against the working state, memoized per view.
    pub fn derive<I, D>(&mut self, derivation: &Derivation<S, I, D>) -> D
    where
        I: PartialEq + Send + 'static,
        D: Clone + Send + 'static,
    {
        match self.derivations.as_mut() {
            Some((registry, view)) => registry.get(view.clone(), derivation, &self.state),
            None => derivation.getter().get(&self.state),
        }
    }
}
