//! Cooperative cancellation tokens.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type Listener = Box<dyn FnOnce() + Send>;

/// Cancellation token passed down every asynchronous call chain of a
/// transition.
///
/// The state is readable with [`is_cancelled`](Self::is_cancelled), awaitable
/// with [`cancelled`](Self::cancelled), and listeners registered with
/// [`on_cancel`](Self::on_cancel) run once when [`cancel`](Self::cancel) is
/// called on this token. Tokens derived with [`child`](Self::child) observe
/// their parent's cancellation through `is_cancelled`/`cancelled`.
#[derive(Clone, Default)]
pub struct CancelToken {
    token: CancellationToken,
    listeners: Arc<Mutex<Vec<Listener>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled whenever this one is.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            listeners: Arc::default(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and run every registered listener exactly once.
    pub fn cancel(&self) {
        let listeners = {
            let mut guard = self.listeners.lock();
            self.token.cancel();
            std::mem::take(&mut *guard)
        };
        for listener in listeners {
            listener();
        }
    }

    /// Run `f` on cancellation, or immediately if already cancelled.
    pub fn on_cancel<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut guard = self.listeners.lock();
            if !self.token.is_cancelled() {
                guard.push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Resolve once cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_run_once() {
        let token = CancelToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();

        assert!(token.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_listener_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn child_observes_parent() {
        let parent = CancelToken::new();
        let child = parent.child();

        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        token.cancel();
        handle.await.unwrap();
    }
}
