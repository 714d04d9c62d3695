//! Serialization lanes for asynchronous work sharing a queue key.
//!
//! Work under one key runs strictly one at a time in FIFO order. Different
//! keys never wait on each other. A failure empties its lane: every item
//! still waiting behind it fails with the same error without running.

use crate::error::EngineError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

/// Why a queued item never got its turn.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    /// Taken out of the lane before it started.
    #[error("removed from queue '{0}' before starting")]
    Removed(String),

    /// An earlier item in the same lane failed.
    #[error(transparent)]
    Failed(#[from] EngineError),
}

type StartSignal = oneshot::Sender<Result<(), EngineError>>;

struct Waiting {
    ticket: Uuid,
    start: StartSignal,
}

#[derive(Default)]
struct Lane {
    running: Option<Uuid>,
    waiting: VecDeque<Waiting>,
}

impl Lane {
    fn is_idle(&self) -> bool {
        self.running.is_none() && self.waiting.is_empty()
    }
}

#[derive(Default)]
struct Shared {
    lanes: Mutex<HashMap<String, Lane>>,
    drained: Notify,
}

/// FIFO lanes keyed by queue key.
///
/// # Example
///
/// ```rust
/// use transit::queue::QueueManager;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let queue = QueueManager::new();
/// let value = queue.enqueue("saves", async { Ok(7) }).await.unwrap();
/// assert_eq!(value, 7);
/// assert!(queue.is_idle());
/// # }
/// ```
#[derive(Clone, Default)]
pub struct QueueManager {
    shared: Arc<Shared>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a place in the lane for `key`.
    ///
    /// The reservation is granted immediately when the lane is free;
    /// otherwise it waits behind the items already there. Dropping the
    /// reservation gives the place up.
    pub fn reserve(&self, key: &str, ticket: Uuid) -> Reservation {
        let mut lanes = self.shared.lanes.lock();
        let lane = lanes.entry(key.to_string()).or_default();
        let state = if lane.running.is_none() && lane.waiting.is_empty() {
            lane.running = Some(ticket);
            ReservationState::Granted
        } else {
            let (start, rx) = oneshot::channel();
            lane.waiting.push_back(Waiting { ticket, start });
            tracing::debug!(queue = key, %ticket, waiting = lane.waiting.len(), "queued");
            ReservationState::Waiting(rx)
        };
        Reservation {
            manager: self.clone(),
            key: key.to_string(),
            ticket,
            state: Some(state),
        }
    }

    /// Run `work` once the lane for `key` is free.
    ///
    /// `work` is not polled at all if the item is failed or removed first.
    pub async fn enqueue<F, T>(&self, key: &str, work: F) -> Result<T, QueueError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        let turn = self.reserve(key, Uuid::new_v4()).wait().await?;
        let result = work.await;
        turn.finish(result.as_ref().err());
        result.map_err(QueueError::from)
    }

    /// Take a waiting item out of its lane. Returns `false` if it is not
    /// waiting (already running, finished or unknown).
    pub fn remove(&self, key: &str, ticket: Uuid) -> bool {
        let mut lanes = self.shared.lanes.lock();
        let Some(lane) = lanes.get_mut(key) else {
            return false;
        };
        let before = lane.waiting.len();
        lane.waiting.retain(|w| w.ticket != ticket);
        let removed = lane.waiting.len() != before;
        if removed {
            tracing::debug!(queue = key, %ticket, "removed from queue");
        }
        Self::prune(&mut lanes, key, &self.shared.drained);
        removed
    }

    fn release(&self, key: &str, ticket: Uuid, failure: Option<&EngineError>) {
        let mut lanes = self.shared.lanes.lock();
        let Some(lane) = lanes.get_mut(key) else {
            return;
        };
        if lane.running != Some(ticket) {
            return;
        }
        lane.running = None;

        match failure {
            Some(error) => {
                let failed = lane.waiting.len();
                for waiting in lane.waiting.drain(..) {
                    let _ = waiting.start.send(Err(error.clone()));
                }
                if failed > 0 {
                    tracing::debug!(queue = key, failed, "queue failed");
                }
            }
            None => {
                while let Some(next) = lane.waiting.pop_front() {
                    if next.start.send(Ok(())).is_ok() {
                        lane.running = Some(next.ticket);
                        break;
                    }
                }
            }
        }
        Self::prune(&mut lanes, key, &self.shared.drained);
    }

    fn prune(lanes: &mut HashMap<String, Lane>, key: &str, drained: &Notify) {
        if lanes.get(key).is_some_and(Lane::is_idle) {
            lanes.remove(key);
        }
        if lanes.is_empty() {
            drained.notify_waiters();
        }
    }

    /// `Some(0)` for the running item, `Some(n)` for the n-th waiting item.
    pub fn position(&self, key: &str, ticket: Uuid) -> Option<usize> {
        let lanes = self.shared.lanes.lock();
        let lane = lanes.get(key)?;
        if lane.running == Some(ticket) {
            return Some(0);
        }
        lane.waiting
            .iter()
            .position(|w| w.ticket == ticket)
            .map(|index| index + 1)
    }

    pub fn is_waiting(&self, key: &str, ticket: Uuid) -> bool {
        self.position(key, ticket).is_some_and(|p| p > 0)
    }

    /// Running plus waiting items under `key`.
    pub fn len(&self, key: &str) -> usize {
        self.shared
            .lanes
            .lock()
            .get(key)
            .map(|lane| usize::from(lane.running.is_some()) + lane.waiting.len())
            .unwrap_or(0)
    }

    pub fn is_idle(&self) -> bool {
        self.shared.lanes.lock().is_empty()
    }

    /// Resolve once every lane has drained.
    pub async fn flush(&self) {
        loop {
            let drained = self.shared.drained.notified();
            if self.is_idle() {
                return;
            }
            drained.await;
        }
    }
}

enum ReservationState {
    Granted,
    Waiting(oneshot::Receiver<Result<(), EngineError>>),
}

/// A place in a lane, not yet started.
#[must_use = "dropping a reservation gives up its place in the queue"]
pub struct Reservation {
    manager: QueueManager,
    key: String,
    ticket: Uuid,
    state: Option<ReservationState>,
}

impl Reservation {
    /// Whether the item may start without waiting.
    pub fn is_granted(&self) -> bool {
        matches!(self.state, Some(ReservationState::Granted))
    }

    pub fn ticket(&self) -> Uuid {
        self.ticket
    }

    /// Wait for this item's turn.
    pub async fn wait(mut self) -> Result<QueueTurn, QueueError> {
        if let Some(ReservationState::Waiting(rx)) = self.state.as_mut() {
            let signal = rx.await;
            self.state = None;
            match signal {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(QueueError::Failed(error)),
                Err(_) => return Err(QueueError::Removed(self.key.clone())),
            }
        }
        self.state = None;
        Ok(QueueTurn {
            manager: self.manager.clone(),
            key: self.key.clone(),
            ticket: self.ticket,
            finished: false,
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        match self.state.take() {
            Some(ReservationState::Granted) => self.manager.release(&self.key, self.ticket, None),
            Some(ReservationState::Waiting(_)) => {
                // The turn may have been handed over after the wait stopped
                // being polled.
                self.manager.remove(&self.key, self.ticket);
                self.manager.release(&self.key, self.ticket, None);
            }
            None => {}
        }
    }
}

/// The running item of a lane. Finishing or dropping it starts the next one.
#[must_use = "dropping a turn immediately releases the lane"]
pub struct QueueTurn {
    manager: QueueManager,
    key: String,
    ticket: Uuid,
    finished: bool,
}

impl QueueTurn {
    /// Release the lane. A failure fails every item still waiting.
    pub fn finish(mut self, failure: Option<&EngineError>) {
        self.finished = true;
        self.manager.release(&self.key, self.ticket, failure);
    }
}

impl Drop for QueueTurn {
    fn drop(&mut self) {
        if !self.finished {
            self.manager.release(&self.key, self.ticket, None);
        }
    }
}
