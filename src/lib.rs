//! Transit: a transition-oriented state engine
//!
//! Transit keeps one committed application state and lets named, hierarchical
//! transitions accumulate changes against it. A transition's changes become
//! canonical only when its last unit of work finishes; errors and aborts
//! discard them. While work is pending, optimistic setters give a
//! speculative preview of where state is heading.
//!
//! # Core Concepts
//!
//! - **State**: plain values with a shallow-merge patch type, via the
//!   [`State`] trait or the [`state_struct!`] macro
//! - **Transitions**: slash-joined names; work in `save/user` also keeps
//!   `save` active
//! - **Reducers**: synchronous functions that set state, dispatch further
//!   actions and spawn async operations through a [`Context`]
//! - **Operations**: futures, timers and manually settled holds, optionally
//!   serialized per queue key and cancelled with their transition
//! - **Guards**: ceilings on synchronous recursion and on actions and
//!   operations per transition
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use transit::effects::{AsyncOp, Continuation};
//! use transit::engine::{Action, ActionType, Engine};
//! use transit::{state_struct, Transition};
//!
//! state_struct! {
//!     pub struct Profile {
//!         pub name: String,
//!         pub saving: bool,
//!     }
//!     patch: ProfilePatch
//! }
//!
//! #[derive(Clone, Debug)]
//! enum Msg {
//!     Save(String),
//! }
//!
//! impl ActionType for Msg {
//!     fn kind(&self) -> &str {
//!         "save"
//!     }
//!
//!     fn transition(&self) -> Option<Transition> {
//!         Some(Transition::from("save"))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = Engine::<Profile, Msg>::builder()
//!     .initial(Profile::default())
//!     .reducer(|action, ctx| {
//!         if let Action::User(Msg::Save(name)) = action {
//!             ctx.set(ProfilePatch { saving: Some(true), ..Default::default() });
//!             let name = name.clone();
//!             ctx.spawn(AsyncOp::timer(
//!                 "persist",
//!                 Duration::from_millis(10),
//!                 Continuation::patch(ProfilePatch {
//!                     name: Some(name),
//!                     saving: Some(false),
//!                 }),
//!             ));
//!         }
//!         Ok(())
//!     })
//!     .build()
//!     .unwrap();
//!
//! let state = engine.dispatch_async(Msg::Save("ada".into())).await.unwrap();
//! assert_eq!(state.name, "ada");
//! assert!(!state.saving);
//! assert!(engine.is_clean());
//! # }
//! ```

pub mod builder;
pub mod core;
pub mod derive;
pub mod effects;
pub mod enforcement;
pub mod engine;
pub mod error;
pub mod events;
pub mod notifier;
pub mod optimistic;
pub mod queue;
pub mod tracker;

// Re-export commonly used types
pub use builder::{BuildError, EngineBuilder};
pub use core::{Setter, State, Transition};
pub use engine::{Action, ActionType, Context, Engine, WaitOutcome, WaitReason};
pub use error::EngineError;
