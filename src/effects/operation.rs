//! Asynchronous operations attached to transitions.

use super::cancel::CancelToken;
use crate::core::{Setter, State};
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// How an operation suspends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// A deferred call awaiting a result
    Future,
    /// A sleep followed by a fixed continuation
    Timer,
    /// Held open until its handle is settled by the caller
    Manual,
}

/// Lifecycle of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting behind another operation with the same queue key
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// What happens to state once an operation resolves.
pub enum Continuation<S: State, A> {
    /// Nothing further
    None,
    /// Register a setter on the owning transition
    Set(Setter<S>),
    /// Dispatch an action in a fresh sub-branch of the owning transition
    Dispatch(A),
}

impl<S: State, A> Continuation<S, A> {
    /// Merge a literal partial state.
    pub fn patch(patch: S::Patch) -> Self {
        Continuation::Set(Setter::patch(patch))
    }

    /// Merge the partial state computed from the transition's working state.
    pub fn update<F>(f: F) -> Self
    where
        F: Fn(&S) -> S::Patch + Send + Sync + 'static,
    {
        Continuation::Set(Setter::update(f))
    }
}

impl<S: State, A: fmt::Debug> fmt::Debug for Continuation<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuation::None => f.write_str("None"),
            Continuation::Set(setter) => f.debug_tuple("Set").field(setter).finish(),
            Continuation::Dispatch(action) => f.debug_tuple("Dispatch").field(action).finish(),
        }
    }
}

/// Argument of an on-finish finalizer.
#[derive(Clone, Copy, Debug)]
pub struct Finish {
    is_last: bool,
}

impl Finish {
    pub(crate) fn new(is_last: bool) -> Self {
        Self { is_last }
    }

    /// True only when no other pending operation shares the finalizer id.
    pub fn is_last(&self) -> bool {
        self.is_last
    }
}

pub type OperationResult<S, A> = Result<Continuation<S, A>, EngineError>;
pub type OperationFuture<S, A> = Pin<Box<dyn Future<Output = OperationResult<S, A>> + Send>>;
pub type Finalizer<S, A> = Box<dyn FnOnce(&Finish) -> Continuation<S, A> + Send>;

type TokenFuture<S, A> = Box<dyn FnOnce(CancelToken) -> OperationFuture<S, A> + Send>;

pub(crate) enum OperationBody<S: State, A> {
    Future(OperationFuture<S, A>),
    Cancellable(TokenFuture<S, A>),
    Timer(Duration, Continuation<S, A>),
    Manual(oneshot::Receiver<OperationResult<S, A>>),
}

impl<S: State, A: Send + 'static> OperationBody<S, A> {
    pub(crate) async fn run(self, label: &str, token: &CancelToken) -> OperationResult<S, A> {
        match self {
            OperationBody::Future(future) => future.await,
            OperationBody::Cancellable(start) => start(token.clone()).await,
            OperationBody::Timer(delay, then) => {
                tokio::time::sleep(delay).await;
                Ok(then)
            }
            OperationBody::Manual(rx) => rx.await.unwrap_or_else(|_| {
                Err(EngineError::operation(
                    label,
                    "manual handle dropped before settling",
                ))
            }),
        }
    }
}

/// A unit of asynchronous work requested by a reducer.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use transit::core::Setter;
/// use transit::effects::{AsyncOp, Continuation};
/// use transit::state_struct;
///
/// state_struct! {
///     struct Counter { count: i64 }
///     patch: CounterPatch
/// }
///
/// let fetch: AsyncOp<Counter, ()> = AsyncOp::future("fetch", async {
///     Ok(Continuation::Set(Setter::patch(CounterPatch { count: Some(1) })))
/// })
/// .queue("saves")
/// .on_finish("spinner", |finish| {
///     if finish.is_last() {
///         Continuation::Set(Setter::patch(CounterPatch { count: Some(0) }))
///     } else {
///         Continuation::None
///     }
/// });
///
/// let tick: AsyncOp<Counter, ()> =
///     AsyncOp::timer("tick", Duration::from_millis(5), Continuation::None);
/// assert_eq!(fetch.label(), "fetch");
/// assert_eq!(tick.queue_key(), None);
/// ```
pub struct AsyncOp<S: State, A> {
    pub(crate) label: String,
    pub(crate) kind: OperationKind,
    pub(crate) body: OperationBody<S, A>,
    pub(crate) queue: Option<String>,
    pub(crate) finish: Option<(String, Finalizer<S, A>)>,
}

impl<S: State, A: Send + 'static> AsyncOp<S, A> {
    /// Wrap a deferred call.
    pub fn future<F>(label: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = OperationResult<S, A>> + Send + 'static,
    {
        Self::with_body(label, OperationKind::Future, OperationBody::Future(Box::pin(future)))
    }

    /// Wrap a deferred call that observes the owning transition's
    /// cancellation token.
    pub fn cancellable<F, Fut>(label: impl Into<String>, start: F) -> Self
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = OperationResult<S, A>> + Send + 'static,
    {
        let start: TokenFuture<S, A> = Box::new(move |token| Box::pin(start(token)));
        Self::with_body(label, OperationKind::Future, OperationBody::Cancellable(start))
    }

    /// Sleep for `delay`, then continue with `then`.
    pub fn timer(label: impl Into<String>, delay: Duration, then: Continuation<S, A>) -> Self {
        Self::with_body(label, OperationKind::Timer, OperationBody::Timer(delay, then))
    }

    /// An operation settled from outside through the returned handle.
    pub fn manual(label: impl Into<String>) -> (Self, ManualHandle<S, A>) {
        let (tx, rx) = oneshot::channel();
        let op = Self::with_body(label, OperationKind::Manual, OperationBody::Manual(rx));
        (op, ManualHandle { tx })
    }

    fn with_body(label: impl Into<String>, kind: OperationKind, body: OperationBody<S, A>) -> Self {
        Self {
            label: label.into(),
            kind,
            body,
            queue: None,
            finish: None,
        }
    }

    /// Serialize behind other operations sharing `key`.
    pub fn queue(mut self, key: impl Into<String>) -> Self {
        self.queue = Some(key.into());
        self
    }

    /// Run `finalizer` on success, grouped with every concurrent operation
    /// of the same transition sharing `id`.
    ///
    /// The finalizer runs while the engine is locked and must not call back
    /// into it.
    pub fn on_finish<F>(mut self, id: impl Into<String>, finalizer: F) -> Self
    where
        F: FnOnce(&Finish) -> Continuation<S, A> + Send + 'static,
    {
        self.finish = Some((id.into(), Box::new(finalizer)));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn queue_key(&self) -> Option<&str> {
        self.queue.as_deref()
    }
}

/// Settles a [`manual`](AsyncOp::manual) operation.
///
/// Dropping the handle without settling fails the operation.
pub struct ManualHandle<S: State, A> {
    tx: oneshot::Sender<OperationResult<S, A>>,
}

impl<S: State, A> ManualHandle<S, A> {
    /// Succeed with a continuation. Returns `false` if the operation is gone.
    pub fn resolve(self, then: Continuation<S, A>) -> bool {
        self.tx.send(Ok(then)).is_ok()
    }

    /// Fail with `error`. Returns `false` if the operation is gone.
    pub fn reject(self, error: EngineError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }
}

/// Observable record of one operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: Uuid,
    pub when: DateTime<Utc>,
    pub kind: OperationKind,
    pub label: String,
    pub queue: Option<String>,
    pub status: OperationStatus,
    /// Key of the transition the operation is counted against
    pub transition: String,
}

impl OperationRecord {
    /// The label with a "waiting in queue" sub-label while queued.
    pub fn display_label(&self) -> String {
        match self.status {
            OperationStatus::Queued => format!("{} (waiting in queue)", self.label),
            _ => self.label.clone(),
        }
    }
}
