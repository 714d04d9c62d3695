use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

type Selector<S, I> = Arc<dyn Fn(&S) -> I + Send + Sync>;
type Evaluator<I, D> = Arc<dyn Fn(&I) -> D + Send + Sync>;

/// A pure function of selected state slices.
///
/// Several selectors are expressed as one selector returning a tuple. Inputs
/// are compared with `PartialEq`; the evaluator reruns only when they differ
/// from the previous call.
///
/// # Example
///
/// ```rust
/// use transit::derive::Derivation;
/// use transit::state_struct;
///
/// state_struct! {
///     struct Cart { items: Vec<u32>, discount: u32 }
///     patch: CartPatch
/// }
///
/// let total = Derivation::new(
///     "total",
///     |cart: &Cart| (cart.items.clone(), cart.discount),
///     |(items, discount): &(Vec<u32>, u32)| items.iter().sum::<u32>().saturating_sub(*discount),
/// );
///
/// let mut getter = total.getter();
/// let cart = Cart { items: vec![3, 4], discount: 2 };
/// assert_eq!(getter.get(&cart), 5);
/// assert_eq!(getter.get(&cart), 5);
/// assert_eq!(getter.evaluations(), 1);
/// ```
pub struct Derivation<S, I, D> {
    id: Uuid,
    name: String,
    select: Selector<S, I>,
    evaluate: Evaluator<I, D>,
}

impl<S, I, D> Derivation<S, I, D> {
    pub fn new<F, G>(name: impl Into<String>, select: F, evaluate: G) -> Self
    where
        F: Fn(&S) -> I + Send + Sync + 'static,
        G: Fn(&I) -> D + Send + Sync + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            select: Arc::new(select),
            evaluate: Arc::new(evaluate),
        }
    }

    /// Identity shared by every clone; registries key their getters by it.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A fresh getter with an empty cache.
    pub fn getter(&self) -> CachedGetter<S, I, D> {
        CachedGetter {
            derivation: self.clone(),
            last: None,
            evaluations: 0,
        }
    }
}

impl<S, I, D> Clone for Derivation<S, I, D> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            select: Arc::clone(&self.select),
            evaluate: Arc::clone(&self.evaluate),
        }
    }
}

impl<S, I, D> fmt::Debug for Derivation<S, I, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derivation")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Memoizing evaluator for one [`Derivation`].
pub struct CachedGetter<S, I, D> {
    derivation: Derivation<S, I, D>,
    last: Option<(I, D)>,
    evaluations: usize,
}

impl<S, I: PartialEq, D: Clone> CachedGetter<S, I, D> {
    pub fn get(&mut self, state: &S) -> D {
        let inputs = (self.derivation.select)(state);
        if let Some((previous, value)) = &self.last {
            if *previous == inputs {
                return value.clone();
            }
        }
        let value = (self.derivation.evaluate)(&inputs);
        self.evaluations += 1;
        tracing::trace!(derivation = %self.derivation.name, evaluations = self.evaluations, "derivation recomputed");
        self.last = Some((inputs, value.clone()));
        value
    }
}

impl<S, I, D> CachedGetter<S, I, D> {
    /// How many times the evaluator has run.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn invalidate(&mut self) {
        self.last = None;
    }
}
