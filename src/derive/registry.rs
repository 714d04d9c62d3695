use super::cache::{CachedGetter, Derivation};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Which version of state a getter is evaluated against.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StateView {
    Committed,
    Optimistic,
    /// The draft of one active transition, by key
    Transition(String),
}

impl fmt::Display for StateView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateView::Committed => f.write_str("committed"),
            StateView::Optimistic => f.write_str("optimistic"),
            StateView::Transition(key) => write!(f, "transition:{key}"),
        }
    }
}

type ErasedGetter = Box<dyn Any + Send>;

/// Getters kept per view before the least recently used one is evicted.
pub const DEFAULT_VIEW_CAPACITY: usize = 64;

struct Entry {
    getter: ErasedGetter,
    used: u64,
}

/// One set of [`CachedGetter`]s per [`StateView`].
///
/// Getters are stored type-erased and keyed by derivation id, so any number
/// of derivations with unrelated input and output types can share a
/// registry. Each view holds at most `capacity` getters; past that the least
/// recently used one is dropped and rebuilt on its next use.
pub struct DerivationRegistry {
    views: HashMap<StateView, HashMap<Uuid, Entry>>,
    capacity: usize,
    clock: u64,
}

impl Default for DerivationRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_VIEW_CAPACITY)
    }
}

impl DerivationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            views: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    /// Evaluate `derivation` against `state` through the getter cached for
    /// `view`, creating the view and the getter on first use.
    pub fn get<S, I, D>(&mut self, view: StateView, derivation: &Derivation<S, I, D>, state: &S) -> D
    where
        S: 'static,
        I: PartialEq + Send + 'static,
        D: Clone + Send + 'static,
    {
        self.clock += 1;
        let used = self.clock;
        let getters = self.views.entry(view).or_default();
        if !getters.contains_key(&derivation.id()) && getters.len() >= self.capacity {
            let oldest = getters
                .iter()
                .min_by_key(|(_, entry)| entry.used)
                .map(|(id, _)| *id);
            if let Some(oldest) = oldest {
                getters.remove(&oldest);
                tracing::trace!(derivation = %oldest, "evicted cached getter");
            }
        }
        let entry = getters.entry(derivation.id()).or_insert_with(|| Entry {
            getter: Box::new(derivation.getter()),
            used,
        });
        entry.used = used;
        if let Some(getter) = entry.getter.downcast_mut::<CachedGetter<S, I, D>>() {
            return getter.get(state);
        }
        let mut getter = derivation.getter();
        let value = getter.get(state);
        entry.getter = Box::new(getter);
        value
    }

    /// Drop every getter cached for the derivation with `id`.
    ///
    /// Returns how many views held one.
    pub fn forget(&mut self, id: Uuid) -> usize {
        let mut removed = 0;
        for getters in self.views.values_mut() {
            if getters.remove(&id).is_some() {
                removed += 1;
            }
        }
        self.views.retain(|_, getters| !getters.is_empty());
        removed
    }

    /// Tear down a view and every getter in it.
    pub fn drop_view(&mut self, view: &StateView) -> bool {
        self.views.remove(view).is_some()
    }

    pub fn has_view(&self, view: &StateView) -> bool {
        self.views.contains_key(view)
    }

    pub fn getter_count(&self, view: &StateView) -> usize {
        self.views.get(view).map(HashMap::len).unwrap_or(0)
    }

    /// Keys of every transition that currently owns a view.
    pub fn transition_views(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .views
            .keys()
            .filter_map(|view| match view {
                StateView::Transition(key) => Some(key.clone()),
                _ => None,
            })
            .collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for DerivationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut views: Vec<String> = self.views.keys().map(ToString::to_string).collect();
        views.sort();
        f.debug_struct("DerivationRegistry")
            .field("views", &views)
            .finish()
    }
}
