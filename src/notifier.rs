//! Subscriber notification with per-tick batching.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type Listener = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`Notifier::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Shared {
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    scheduled: AtomicBool,
    next_id: AtomicU64,
    broadcasts: AtomicU64,
}

impl Shared {
    fn flush(&self) {
        self.scheduled.store(false, Ordering::SeqCst);
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        for listener in listeners {
            listener();
        }
    }
}

/// Pub/sub primitive that folds every notification raised within one
/// scheduling tick into a single broadcast.
///
/// Inside a tokio runtime the broadcast runs on a spawned task after the
/// current task yields. Outside a runtime it runs immediately.
#[derive(Clone, Default)]
pub struct Notifier {
    shared: Arc<Shared>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        self.shared.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.shared.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Request a broadcast. Requests made before the pending broadcast runs
    /// are absorbed by it.
    pub fn schedule(&self) {
        if self.shared.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(&self.shared);
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    shared.flush();
                });
            }
            Err(_) => self.shared.flush(),
        }
    }

    /// Number of broadcasts delivered so far.
    pub fn broadcasts(&self) -> u64 {
        self.shared.broadcasts.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.listeners.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn counting(notifier: &Notifier) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        notifier.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        calls
    }

    #[test]
    fn without_runtime_broadcast_is_immediate() {
        let notifier = Notifier::new();
        let calls = counting(&notifier);

        notifier.schedule();
        notifier.schedule();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn notifications_in_one_tick_are_batched() {
        let notifier = Notifier::new();
        let calls = counting(&notifier);

        notifier.schedule();
        notifier.schedule();
        notifier.schedule();
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.broadcasts(), 1);

        notifier.schedule();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribed_listener_is_not_called() {
        let notifier = Notifier::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = notifier.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        notifier.schedule();
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
