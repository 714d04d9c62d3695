//! Asynchronous operation orchestration.
//!
//! An operation is registered under the engine lock, launched on a tokio
//! task once the lock is released, and settled back under the lock. Each
//! operation holds one reference on its transition until it settles.

use super::dispatch::Op;
use super::inner::{EngineInner, LiveOp};
use super::{ActionType, Engine, Outbox};
use crate::core::{ActionSource, State, Transition};
use crate::effects::{
    AsyncOp, CancelToken, Continuation, Finish, OperationBody, OperationRecord, OperationResult,
    OperationStatus,
};
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::queue::{QueueError, Reservation};
use chrono::Utc;
use uuid::Uuid;

/// An operation ready to run outside the engine lock.
pub(crate) struct Launch<S: State, A> {
    pub id: Uuid,
    pub label: String,
    pub token: CancelToken,
    pub body: OperationBody<S, A>,
    pub reservation: Option<Reservation>,
}

impl<S: State, A: ActionType> EngineInner<S, A> {
    pub(crate) fn register_operation(
        &mut self,
        transition: &Transition,
        operation: AsyncOp<S, A>,
        outbox: &mut Outbox<S, A>,
    ) -> Result<(), EngineError> {
        let key = transition.key();
        let owner = self.owner_of(&key);
        self.guards
            .record_operation(&owner, &self.limits)
            .map_err(|violation| violation.into_error(&owner))?;

        let AsyncOp {
            label,
            kind,
            body,
            queue,
            finish,
        } = operation;
        let id = Uuid::new_v4();
        let slot = self.ensure_slot(&key);
        let token = slot.token.clone();
        let generation = slot.generation;

        self.tracker.add_key(transition);
        self.tracker.add_subtransition(&key, &label);
        if let Some((finish_id, _)) = &finish {
            self.tracker.add_finish(&key, finish_id);
        }

        let reservation = queue.as_deref().map(|queue| self.queues.reserve(queue, id));
        let status = match &reservation {
            Some(reservation) if !reservation.is_granted() => OperationStatus::Queued,
            _ => OperationStatus::Running,
        };
        let record = OperationRecord {
            id,
            when: Utc::now(),
            kind,
            label: label.clone(),
            queue,
            status,
            transition: key.clone(),
        };
        for ancestor in transition.ancestor_keys() {
            self.operation_log
                .entry(ancestor)
                .or_default()
                .push(record.clone());
        }

        tracing::debug!(transition = %key, label = %label, ?status, "operation created");
        self.events.emit(EngineEvent::OperationCreated {
            transition: key.clone(),
            operation: id,
            label: label.clone(),
            kind,
            at: Utc::now(),
        });
        self.live_ops.insert(
            id,
            LiveOp {
                transition: transition.clone(),
                key,
                label: label.clone(),
                kind,
                finish,
                generation,
            },
        );
        outbox.launches.push(Launch {
            id,
            label,
            token,
            body,
            reservation,
        });
        Ok(())
    }

    pub(crate) fn mark_running(&mut self, id: Uuid) {
        if let Some(transition) = self.live_ops.get(&id).map(|op| op.transition.clone()) {
            self.set_operation_status(&transition, id, OperationStatus::Running);
        }
    }

    /// Apply the outcome of an operation. Outcomes of operations whose
    /// transition already terminated are ignored.
    pub(crate) fn settle_operation(&mut self, id: Uuid, result: OperationResult<S, A>, outbox: &mut Outbox<S, A>) {
        let Some(op) = self.live_ops.remove(&id) else {
            tracing::trace!(operation = %id, "outcome of untracked operation ignored");
            return;
        };
        let LiveOp {
            transition,
            key,
            label,
            kind,
            finish,
            generation,
        } = op;

        let status = match &result {
            Ok(_) => OperationStatus::Done,
            Err(error) if error.is_cancellation() => OperationStatus::Cancelled,
            Err(_) => OperationStatus::Failed,
        };
        self.set_operation_status(&transition, id, status);
        self.events.emit(EngineEvent::OperationCompleted {
            transition: key.clone(),
            operation: id,
            label: label.clone(),
            status,
            at: Utc::now(),
        });
        self.tracker.done_subtransition(&key, &label);
        let remaining = finish
            .as_ref()
            .map(|(finish_id, _)| self.tracker.done_finish(&key, finish_id));

        match result {
            Ok(continuation) => {
                tracing::debug!(transition = %key, label = %label, ?kind, "operation completed");
                self.run_continuation(&transition, continuation, outbox);
                if let (Some((_, finalizer)), Some(remaining)) = (finish, remaining) {
                    if self.is_live(&key, generation) {
                        let then = finalizer(&Finish::new(remaining == 0));
                        self.run_continuation(&transition, then, outbox);
                    }
                }
            }
            Err(error) if error.is_cancellation() => {
                tracing::warn!(transition = %key, label = %label, "operation cancelled");
                outbox.aborts.push(transition.clone());
            }
            Err(error) => {
                tracing::debug!(transition = %key, label = %label, %error, "operation failed");
                self.error_transition(&key, error, outbox);
                return;
            }
        }

        if self.is_live(&key, generation) {
            for finished in self.tracker.done_key(&transition) {
                self.process_finished(&finished, outbox);
            }
        }
    }

    fn is_live(&self, key: &str, generation: u64) -> bool {
        self.slots.get(key).map(|slot| slot.generation) == Some(generation)
    }

    fn run_continuation(&mut self, transition: &Transition, continuation: Continuation<S, A>, outbox: &mut Outbox<S, A>) {
        let result = match continuation {
            Continuation::None => return,
            Continuation::Set(setter) => self.run_chain(
                Some(transition.clone()),
                Op::Set(setter),
                ActionSource::Continuation,
                outbox,
            ),
            Continuation::Dispatch(action) => {
                let target = match action.transition() {
                    Some(target) => target,
                    None => {
                        let sub = transition.sub_branch();
                        self.open_sub_branch(&sub.key(), &transition.key());
                        sub
                    }
                };
                self.run_chain(Some(target), Op::Dispatch(action), ActionSource::Continuation, outbox)
            }
        };
        if let Err(error) = result {
            tracing::debug!(transition = %transition, %error, "continuation failed");
        }
    }
}

impl<S: State, A: ActionType> Engine<S, A> {
    pub(crate) fn settle(&self, id: Uuid, result: OperationResult<S, A>) {
        self.with_inner(|inner, outbox| inner.settle_operation(id, result, outbox));
    }
}

/// Run one operation to completion: wait for its queue turn, run its body,
/// then settle it. Cancellation of the transition's token stops it at
/// either suspension point without settling; the abort or error path has
/// already accounted for it.
pub(crate) async fn drive_operation<S: State, A: ActionType>(engine: Engine<S, A>, launch: Launch<S, A>) {
    let Launch {
        id,
        label,
        token,
        body,
        reservation,
    } = launch;

    let turn = match reservation {
        None => None,
        Some(reservation) => {
            let waited = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                waited = reservation.wait() => Some(waited),
            };
            match waited {
                None => {
                    tracing::debug!(label = %label, "queued operation cancelled before starting");
                    return;
                }
                Some(Ok(turn)) => {
                    engine.with_inner(|inner, _| inner.mark_running(id));
                    Some(turn)
                }
                Some(Err(QueueError::Failed(error))) => {
                    engine.settle(id, Err(error));
                    return;
                }
                Some(Err(QueueError::Removed(queue))) => {
                    let error = EngineError::operation(&label, format!("removed from queue '{queue}'"));
                    engine.settle(id, Err(error));
                    return;
                }
            }
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = body.run(&label, &token) => Some(result),
    };
    let Some(result) = outcome else {
        tracing::debug!(label = %label, "operation stopped by cancellation");
        return;
    };
    if let Some(turn) = turn {
        turn.finish(result.as_ref().err());
    }
    engine.settle(id, result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    crate::state_struct! {
        struct Counter {
            count: i64,
        }
        patch: CounterPatch
    }

    type Inner = EngineInner<Counter, ()>;

    fn patch(count: i64) -> Continuation<Counter, ()> {
        Continuation::patch(CounterPatch { count: Some(count) })
    }

    fn register(inner: &mut Inner, finalized: &Arc<AtomicBool>) -> Uuid {
        let mut outbox = Outbox::default();
        let flag = Arc::clone(finalized);
        let op = AsyncOp::timer("tick", Duration::ZERO, Continuation::None).on_finish("group", move |finish| {
            flag.store(finish.is_last(), Ordering::SeqCst);
            Continuation::None
        });
        inner.register_operation(&Transition::from("t"), op, &mut outbox).unwrap();
        outbox.launches[0].id
    }

    #[test]
    fn success_runs_continuation_then_finalizer() {
        let mut inner = Inner::for_tests(Counter::default());
        let finalized = Arc::new(AtomicBool::new(false));
        let id = register(&mut inner, &finalized);
        assert!(inner.tracker.is_happening_unique(&Transition::from("t")));
        assert_eq!(inner.operation_log["t"][0].status, OperationStatus::Running);

        let mut outbox = Outbox::default();
        inner.settle_operation(id, Ok(patch(4)), &mut outbox);

        assert!(finalized.load(Ordering::SeqCst));
        assert_eq!(inner.committed.count, 4);
        assert!(inner.snapshot().is_clean());
    }

    #[test]
    fn cancelled_outcome_aborts_without_error_or_finalizer() {
        let mut inner = Inner::for_tests(Counter::default());
        let finalized = Arc::new(AtomicBool::new(false));
        let id = register(&mut inner, &finalized);

        let mut outbox = Outbox::default();
        inner.settle_operation(id, Err(EngineError::cancelled("t")), &mut outbox);

        assert_eq!(outbox.aborts, vec![Transition::from("t")]);
        assert!(outbox.errors.is_empty());
        assert!(!finalized.load(Ordering::SeqCst));
        assert!(inner.snapshot().is_clean());
    }

    #[test]
    fn outcome_after_abort_is_ignored() {
        let mut inner = Inner::for_tests(Counter::default());
        let finalized = Arc::new(AtomicBool::new(false));
        let id = register(&mut inner, &finalized);

        let mut outbox = Outbox::default();
        assert!(inner.abort(&Transition::from("t"), &mut outbox));
        inner.settle_operation(id, Ok(patch(4)), &mut outbox);

        assert_eq!(inner.committed.count, 0);
        assert!(!finalized.load(Ordering::SeqCst));
        assert_eq!(inner.tracker.underflows(), 0);
        assert!(inner.snapshot().is_clean());
    }

    #[test]
    fn overflow_is_reported_before_anything_is_registered() {
        let mut inner = Inner::for_tests(Counter::default());
        inner.limits.max_async_operations_count = 1;
        let finalized = Arc::new(AtomicBool::new(false));
        register(&mut inner, &finalized);

        let mut outbox = Outbox::default();
        let op = AsyncOp::timer("tock", Duration::ZERO, Continuation::None);
        let err = inner
            .register_operation(&Transition::from("t"), op, &mut outbox)
            .unwrap_err();

        assert_eq!(
            err,
            EngineError::OperationOverflow {
                limit: 1,
                transition: "t".to_string()
            }
        );
        assert!(outbox.launches.is_empty());
        assert_eq!(inner.live_ops.len(), 1);
    }
}
