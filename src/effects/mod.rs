//! Asynchronous operations and cooperative cancellation.
//!
//! This module holds the value types the orchestrator in
//! [`engine`](crate::engine) drives:
//!
//! - **Operations**: deferred calls, timers and manually settled holds, each
//!   with a label, an optional queue key and an optional on-finish finalizer
//! - **Continuations**: what an operation does to state once it resolves
//! - **Cancellation**: tokens derived from the owning transition
//!
//! Operations suspend only at their own await points; cancellation is
//! observed between them and never preempts running code.

mod cancel;
mod operation;

pub use cancel::CancelToken;
pub use operation::{
    AsyncOp, Continuation, Finalizer, Finish, ManualHandle, OperationFuture, OperationKind,
    OperationRecord, OperationResult, OperationStatus,
};

pub(crate) use operation::OperationBody;
