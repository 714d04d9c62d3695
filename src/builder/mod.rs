//! Builder API for engine construction.
//!
//! Configuration problems are accumulated rather than reported one at a
//! time, so a misconfigured engine shows every mistake in one error.

pub mod engine;
pub mod error;

pub use engine::EngineBuilder;
pub use error::BuildError;
