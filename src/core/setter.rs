//! Setters: the unit of state mutation accumulated by transitions.

use super::state::State;
use std::fmt;
use std::sync::Arc;

/// Function form of a setter, evaluated against the state it is folded onto.
pub type UpdateFn<S> = Arc<dyn Fn(&S) -> <S as State>::Patch + Send + Sync>;

/// A state mutation: either a literal partial state or a pure function
/// producing one.
///
/// Setters are always merged shallowly onto a full state. Function setters
/// are re-evaluated each time they are folded, so a transition committing
/// later than it started sees the freshest committed state.
///
/// # Example
///
/// ```rust
/// use transit::core::{Setter, State};
/// use transit::state_struct;
///
/// state_struct! {
///     struct Counter {
///         count: i64,
///     }
///     patch: CounterPatch
/// }
///
/// let mut state = Counter::default();
/// Setter::patch(CounterPatch { count: Some(5) }).apply(&mut state);
/// Setter::update(|s: &Counter| CounterPatch { count: Some(s.count + 1) }).apply(&mut state);
///
/// assert_eq!(state.count, 6);
/// ```
pub enum Setter<S: State> {
    /// Literal partial state
    Patch(S::Patch),
    /// Pure function of the current state
    Update(UpdateFn<S>),
}

impl<S: State> Setter<S> {
    /// Create a setter from a literal partial state.
    pub fn patch(patch: S::Patch) -> Self {
        Setter::Patch(patch)
    }

    /// Create a setter from a pure function of the current state.
    pub fn update<F>(f: F) -> Self
    where
        F: Fn(&S) -> S::Patch + Send + Sync + 'static,
    {
        Setter::Update(Arc::new(f))
    }

    /// Produce the partial state this setter contributes to `state`.
    pub fn resolve(&self, state: &S) -> S::Patch {
        match self {
            Setter::Patch(patch) => patch.clone(),
            Setter::Update(f) => f(state),
        }
    }

    /// Merge this setter onto `state` in place.
    pub fn apply(&self, state: &mut S) {
        let patch = self.resolve(state);
        state.merge(patch);
    }
}

/// Fold setters onto `base` in order.
pub fn fold<'a, S, I>(mut base: S, setters: I) -> S
where
    S: State,
    I: IntoIterator<Item = &'a Setter<S>>,
{
    for setter in setters {
        setter.apply(&mut base);
    }
    base
}

impl<S: State> Clone for Setter<S> {
    fn clone(&self) -> Self {
        match self {
            Setter::Patch(patch) => Setter::Patch(patch.clone()),
            Setter::Update(f) => Setter::Update(Arc::clone(f)),
        }
    }
}

impl<S: State> fmt::Debug for Setter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setter::Patch(patch) => f.debug_tuple("Patch").field(patch).finish(),
            Setter::Update(_) => f.write_str("Update(<fn>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::state_struct! {
        struct Counter {
            count: i64,
            label: String,
        }
        patch: CounterPatch
    }

    fn increment() -> Setter<Counter> {
        Setter::update(|s: &Counter| CounterPatch {
            count: Some(s.count + 1),
            ..Default::default()
        })
    }

    #[test]
    fn patch_setter_merges_shallowly() {
        let mut state = Counter {
            count: 1,
            label: "keep".to_string(),
        };
        Setter::patch(CounterPatch {
            count: Some(7),
            label: None,
        })
        .apply(&mut state);

        assert_eq!(state.count, 7);
        assert_eq!(state.label, "keep");
    }

    #[test]
    fn fold_applies_in_registration_order() {
        let setters = vec![
            increment(),
            Setter::update(|s: &Counter| CounterPatch {
                label: Some(format!("after-{}", s.count)),
                ..Default::default()
            }),
            increment(),
        ];

        let state = fold(Counter::default(), &setters);

        assert_eq!(state.count, 2);
        assert_eq!(state.label, "after-1");
    }

    #[test]
    fn three_increments_yield_three() {
        let setters = vec![increment(), increment(), increment()];
        assert_eq!(fold(Counter::default(), &setters).count, 3);
    }

    #[test]
    fn update_setter_is_reevaluated_per_fold() {
        let setter = increment();
        let first = fold(Counter::default(), [&setter]);
        let second = fold(
            Counter {
                count: 10,
                ..Default::default()
            },
            [&setter],
        );

        assert_eq!(first.count, 1);
        assert_eq!(second.count, 11);
    }

    #[test]
    fn clone_shares_update_function() {
        let setter = increment();
        let cloned = setter.clone();
        assert_eq!(
            fold(Counter::default(), [&cloned]).count,
            fold(Counter::default(), [&setter]).count
        );
        assert_eq!(format!("{cloned:?}"), "Update(<fn>)");
    }
}
