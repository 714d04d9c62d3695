use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Why a bounded wait on a transition ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    /// The transition returned to zero active work
    Completed,
    /// The bound elapsed first; the transition keeps running
    Timeout,
    /// The transition errored or was aborted
    Error,
}

/// Result of [`Engine::wait_for`](super::Engine::wait_for).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WaitOutcome {
    pub success: bool,
    pub reason: WaitReason,
}

impl From<WaitReason> for WaitOutcome {
    fn from(reason: WaitReason) -> Self {
        Self {
            success: reason == WaitReason::Completed,
            reason,
        }
    }
}

/// One-shot signal shared between the completion callback and the error
/// path of a transition; whichever fires first wins.
#[derive(Clone)]
pub(crate) struct WaitSignal {
    tx: Arc<Mutex<Option<oneshot::Sender<WaitReason>>>>,
}

impl WaitSignal {
    pub fn new() -> (Self, oneshot::Receiver<WaitReason>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn fire(&self, reason: WaitReason) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(reason);
        }
    }

    /// Whether both handles share one underlying signal.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}
