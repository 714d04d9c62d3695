//! Memoized derived values.
//!
//! A [`Derivation`] pairs a selector with a pure evaluator. The selector
//! picks the slice of state the value depends on; the evaluator runs only
//! when that slice changes.
//!
//! - [`CachedGetter`] remembers the last inputs and value of one derivation
//! - [`DerivationRegistry`] keeps one set of getters per [`StateView`]:
//!   committed state, the optimistic preview and each active transition's
//!   draft
//!
//! Per-transition views are created lazily on first access and dropped when
//! the transition terminates. Every view is bounded: past
//! [`DEFAULT_VIEW_CAPACITY`] getters the least recently used one is evicted.

mod cache;
mod registry;

pub use cache::{CachedGetter, Derivation};
pub use registry::{DerivationRegistry, StateView, DEFAULT_VIEW_CAPACITY};
