//! Resource guards against runaway mutation chains.
//!
//! Two independent checks:
//!
//! - [`SyncGuard`] counts dispatches one chain performs synchronously and
//!   fails fast with an infinite-loop error once the ceiling is passed
//! - [`GuardCounters`] counts every action and async operation over a
//!   transition's whole lifetime, including asynchronous continuations;
//!   overflow is routed through the transition's error channel
//!
//! Ceilings come from [`Limits`], validated with Stillwater's `Validation`
//! so every misconfigured limit is reported at once.

pub mod guards;
pub mod limits;
pub mod violations;

pub use guards::{GuardCounters, SyncGuard};
pub use limits::Limits;
pub use violations::{GuardViolation, LimitViolation};
