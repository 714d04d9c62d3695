//! Integration tests driving the engine through its public API.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use transit::derive::Derivation;
use transit::effects::{AsyncOp, Continuation, ManualHandle, OperationKind, OperationStatus};
use transit::engine::{Action, ActionType, Context, WaitReason};
use transit::events::EngineEvent;
use transit::{state_struct, Engine, EngineBuilder, EngineError, Setter, Transition};

state_struct! {
    pub struct Doc {
        pub count: i64,
        pub title: String,
        pub saving: bool,
    }
    patch: DocPatch
}

#[derive(Clone, Debug)]
enum Msg {
    Add(i64),
    /// count = count * 10 + digit
    Digit(i64),
    Seq(Vec<Msg>),
    Ping,
    Fail,
    Burst(usize),
    Hold,
    Save { title: String, delay_ms: u64 },
    Queued { id: i64, delay_ms: u64 },
    Batch(Vec<u64>),
    Later(i64),
    /// title = current count
    Mirror,
    HoldGrouped,
    QueuedFail { delay_ms: u64 },
    In(Transition, Box<Msg>),
}

impl ActionType for Msg {
    fn kind(&self) -> &str {
        match self {
            Msg::Add(_) => "add",
            Msg::Digit(_) => "digit",
            Msg::Seq(_) => "seq",
            Msg::Ping => "ping",
            Msg::Fail => "fail",
            Msg::Burst(_) => "burst",
            Msg::Hold => "hold",
            Msg::Save { .. } => "save",
            Msg::Queued { .. } => "queued",
            Msg::Batch(_) => "batch",
            Msg::Later(_) => "later",
            Msg::Mirror => "mirror",
            Msg::HoldGrouped => "hold_grouped",
            Msg::QueuedFail { .. } => "queued_fail",
            Msg::In(_, inner) => inner.kind(),
        }
    }

    fn transition(&self) -> Option<Transition> {
        match self {
            Msg::In(transition, _) => Some(transition.clone()),
            _ => None,
        }
    }
}

fn within(key: &str, msg: Msg) -> Msg {
    Msg::In(Transition::from_key(key), Box::new(msg))
}

type Handles = Arc<Mutex<Vec<ManualHandle<Doc, Msg>>>>;

struct Harness {
    engine: Engine<Doc, Msg>,
    handles: Handles,
    errors: Arc<Mutex<Vec<(Option<Transition>, EngineError)>>>,
    aborts: Arc<Mutex<Vec<Transition>>>,
    finishes: Arc<Mutex<Vec<bool>>>,
}

impl Harness {
    fn take_handle(&self) -> ManualHandle<Doc, Msg> {
        self.handles.lock().pop().expect("no manual operation was spawned")
    }
}

/// Let spawned operation tasks run until `done` holds.
async fn until(done: impl Fn() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness(configure: impl FnOnce(EngineBuilder<Doc, Msg>) -> EngineBuilder<Doc, Msg>) -> Harness {
    init_tracing();
    let handles: Handles = Arc::default();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let aborts = Arc::new(Mutex::new(Vec::new()));
    let finishes = Arc::new(Mutex::new(Vec::new()));

    let reducer = {
        let handles = Arc::clone(&handles);
        let finishes = Arc::clone(&finishes);
        move |action: &Action<Msg>, ctx: &mut Context<'_, Doc, Msg>| -> Result<(), EngineError> {
            let Some(mut msg) = action.as_user() else {
                return Ok(());
            };
            while let Msg::In(_, inner) = msg {
                msg = inner.as_ref();
            }
            match msg {
                Msg::Add(n) => {
                    let n = *n;
                    ctx.update(move |s: &Doc| DocPatch {
                        count: Some(s.count + n),
                        ..Default::default()
                    });
                }
                Msg::Digit(d) => {
                    let d = *d;
                    ctx.update(move |s: &Doc| DocPatch {
                        count: Some(s.count * 10 + d),
                        ..Default::default()
                    });
                }
                Msg::Seq(msgs) => {
                    for msg in msgs {
                        ctx.dispatch(msg.clone());
                    }
                }
                Msg::Ping => ctx.dispatch(Msg::Ping),
                Msg::Fail => return Err(EngineError::reducer("boom")),
                Msg::Burst(n) => {
                    for _ in 0..*n {
                        ctx.dispatch(Msg::Add(1));
                    }
                }
                Msg::Hold => {
                    let (op, handle) = AsyncOp::manual("hold");
                    handles.lock().push(handle);
                    ctx.spawn(op);
                }
                Msg::Save { title, delay_ms } => {
                    ctx.optimistic(Setter::patch(DocPatch {
                        title: Some(title.clone()),
                        ..Default::default()
                    }));
                    ctx.set(DocPatch {
                        saving: Some(true),
                        ..Default::default()
                    });
                    ctx.spawn(AsyncOp::timer(
                        "persist",
                        Duration::from_millis(*delay_ms),
                        Continuation::patch(DocPatch {
                            title: Some(title.clone()),
                            saving: Some(false),
                            ..Default::default()
                        }),
                    ));
                }
                Msg::Queued { id, delay_ms } => {
                    let id = *id;
                    let op = AsyncOp::timer(
                        format!("save-{id}"),
                        Duration::from_millis(*delay_ms),
                        Continuation::update(move |s: &Doc| DocPatch {
                            count: Some(s.count * 10 + id),
                            ..Default::default()
                        }),
                    )
                    .queue("saves");
                    ctx.spawn(op);
                }
                Msg::Batch(delays) => {
                    ctx.set(DocPatch {
                        saving: Some(true),
                        ..Default::default()
                    });
                    for delay in delays {
                        let finishes = Arc::clone(&finishes);
                        let op = AsyncOp::timer("part", Duration::from_millis(*delay), Continuation::None)
                            .on_finish("spinner", move |finish| {
                                finishes.lock().push(finish.is_last());
                                if finish.is_last() {
                                    Continuation::patch(DocPatch {
                                        saving: Some(false),
                                        ..Default::default()
                                    })
                                } else {
                                    Continuation::None
                                }
                            });
                        ctx.spawn(op);
                    }
                }
                Msg::Later(n) => {
                    ctx.spawn(AsyncOp::timer(
                        "later",
                        Duration::from_millis(10),
                        Continuation::Dispatch(Msg::Add(*n)),
                    ));
                }
                Msg::Mirror => {
                    let count = ctx.state().count;
                    ctx.set(DocPatch {
                        title: Some(count.to_string()),
                        ..Default::default()
                    });
                }
                Msg::HoldGrouped => {
                    let (op, handle) = AsyncOp::manual("hold");
                    handles.lock().push(handle);
                    let finishes = Arc::clone(&finishes);
                    ctx.spawn(op.on_finish("group", move |finish| {
                        finishes.lock().push(finish.is_last());
                        Continuation::None
                    }));
                }
                Msg::QueuedFail { delay_ms } => {
                    let delay = Duration::from_millis(*delay_ms);
                    let op = AsyncOp::future("flaky", async move {
                        tokio::time::sleep(delay).await;
                        Err(EngineError::operation("flaky", "offline"))
                    })
                    .queue("saves");
                    ctx.spawn(op);
                }
                Msg::In(..) => {}
            }
            Ok(())
        }
    };

    let builder = Engine::<Doc, Msg>::builder()
        .initial(Doc::default())
        .reducer(reducer)
        .on_error({
            let errors = Arc::clone(&errors);
            move |transition: Option<&Transition>, error: &EngineError| {
                errors.lock().push((transition.cloned(), error.clone()));
            }
        })
        .on_abort({
            let aborts = Arc::clone(&aborts);
            move |transition: &Transition| aborts.lock().push(transition.clone())
        });

    Harness {
        engine: configure(builder).build().unwrap(),
        handles,
        errors,
        aborts,
        finishes,
    }
}

#[test]
fn set_state_without_transition_commits_immediately() {
    let h = harness(|b| b);

    h.engine
        .set_state(
            Setter::patch(DocPatch {
                count: Some(5),
                ..Default::default()
            }),
            None,
        )
        .unwrap();

    assert_eq!(h.engine.state().count, 5);
    assert_eq!(h.engine.history().len(), 2);
    assert!(h.engine.is_clean());
}

#[test]
fn transition_commits_when_its_work_finishes() {
    let h = harness(|b| b);
    let mut events = h.engine.events();

    h.engine.dispatch(within("edit", Msg::Add(1))).unwrap();

    assert_eq!(h.engine.state().count, 1);
    assert!(!h.engine.is_happening("edit"));
    assert!(h.engine.is_clean());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(&seen[0], EngineEvent::TransitionStart { transition, .. } if transition == "edit"));
    assert!(seen
        .iter()
        .any(|e| matches!(e, EngineEvent::TransitionDone { transition, .. } if transition == "edit")));
    assert!(seen.iter().any(|e| matches!(
        e,
        EngineEvent::Committed { transition: Some(t), appended_to_history: true, .. } if t == "edit"
    )));
}

#[test]
fn child_dispatches_run_depth_first_in_order() {
    let h = harness(|b| b);

    h.engine
        .dispatch(Msg::Seq(vec![
            Msg::Seq(vec![Msg::Digit(1), Msg::Digit(2)]),
            Msg::Digit(3),
        ]))
        .unwrap();

    assert_eq!(h.engine.state().count, 123);
}

#[test]
fn reducer_error_rolls_back_the_whole_chain() {
    let h = harness(|b| b);
    h.engine.dispatch(Msg::Add(1)).unwrap();

    let err = h
        .engine
        .dispatch(Msg::Seq(vec![Msg::Add(5), Msg::Fail]))
        .unwrap_err();

    assert_eq!(err, EngineError::reducer("boom"));
    assert_eq!(h.engine.state().count, 1);
    assert!(h.errors.lock().is_empty());
    assert!(h.engine.is_clean());
}

#[test]
fn reducer_error_in_transition_errors_it() {
    let h = harness(|b| b);

    let err = h
        .engine
        .dispatch(within("edit", Msg::Seq(vec![Msg::Add(5), Msg::Fail])))
        .unwrap_err();

    assert_eq!(h.engine.state().count, 0);
    let errors = h.errors.lock();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0], (Some(Transition::from("edit")), err));
    assert!(h.engine.is_clean());
}

#[test]
fn infinite_loop_is_thrown_and_rolled_back() {
    let h = harness(|b| b.max_sync_dispatch_count(10));

    let err = h.engine.dispatch(within("loop", Msg::Ping)).unwrap_err();

    assert_eq!(
        err,
        EngineError::InfiniteLoop {
            limit: 10,
            kind: "ping".to_string()
        }
    );
    assert_eq!(h.errors.lock().len(), 1);
    assert!(h.engine.is_clean());

    assert!(h.engine.dispatch(Msg::Ping).is_err());
    assert_eq!(h.errors.lock().len(), 1);
}

#[test]
fn action_overflow_errors_the_transition() {
    let h = harness(|b| b.max_actions_count(3));

    h.engine.dispatch(within("burst", Msg::Burst(5))).unwrap();

    assert_eq!(h.engine.state().count, 0);
    let errors = h.errors.lock();
    assert_eq!(
        errors[0].1,
        EngineError::ActionOverflow {
            limit: 3,
            transition: "burst".to_string()
        }
    );
    assert!(errors[0].1.is_guard_violation());
    assert!(h.engine.is_clean());
}

#[test]
fn operations_outside_a_runtime_are_rejected() {
    let h = harness(|b| b);

    let err = h
        .engine
        .dispatch(within(
            "save",
            Msg::Save {
                title: "draft".into(),
                delay_ms: 10,
            },
        ))
        .unwrap_err();

    assert_eq!(
        err,
        EngineError::NoRuntime {
            label: "persist".to_string()
        }
    );
    assert_eq!(h.engine.state(), Doc::default());
    assert!(h.engine.is_clean());
}

#[test]
fn history_policy_controls_appends() {
    let set_one = || {
        Setter::patch(DocPatch {
            count: Some(1),
            ..Default::default()
        })
    };

    let h = harness(|b| b);
    h.engine.set_state(set_one(), None).unwrap();
    h.engine.set_state(set_one(), None).unwrap();
    assert_eq!(h.engine.history().len(), 2);

    let h = harness(|b| b.history_policy(|_, _| true));
    h.engine.set_state(set_one(), None).unwrap();
    h.engine.set_state(set_one(), None).unwrap();
    assert_eq!(h.engine.history().len(), 3);
}

#[test]
fn derivations_recompute_only_when_inputs_change() {
    let h = harness(|b| b);
    let evaluations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&evaluations);
    let title_len = Derivation::new(
        "title_len",
        |s: &Doc| s.title.clone(),
        move |title: &String| {
            counter.fetch_add(1, Ordering::SeqCst);
            title.len()
        },
    );

    assert_eq!(h.engine.derive(&title_len), 0);
    assert_eq!(h.engine.derive(&title_len), 0);
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);

    h.engine.dispatch(Msg::Add(4)).unwrap();
    assert_eq!(h.engine.derive(&title_len), 0);
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);

    h.engine
        .set_state(
            Setter::patch(DocPatch {
                title: Some("hello".into()),
                ..Default::default()
            }),
            None,
        )
        .unwrap();
    assert_eq!(h.engine.derive(&title_len), 5);
    assert_eq!(evaluations.load(Ordering::SeqCst), 2);

    assert!(h.engine.forget_derivation(&title_len));
    assert!(!h.engine.forget_derivation(&title_len));
    assert_eq!(h.engine.derive(&title_len), 5);
    assert_eq!(evaluations.load(Ordering::SeqCst), 3);
}

#[test]
fn subscribers_hear_commits_until_unsubscribed() {
    let h = harness(|b| b);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let id = h.engine.subscribe(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    h.engine.dispatch(Msg::Add(1)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(h.engine.unsubscribe(id));
    h.engine.dispatch(Msg::Add(1)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn commit_waits_for_pending_operations() {
    let h = harness(|b| b);

    h.engine.dispatch(within("edit", Msg::Hold)).unwrap();
    h.engine.dispatch(within("edit", Msg::Add(1))).unwrap();
    h.engine.dispatch(within("edit", Msg::Add(2))).unwrap();

    assert_eq!(h.engine.state().count, 0);
    assert!(h.engine.is_happening("edit"));
    let kinds: Vec<String> = h.engine.actions("edit").into_iter().map(|a| a.kind).collect();
    assert_eq!(kinds, vec!["hold", "add", "add"]);
    let operations = h.engine.operations("edit");
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0].kind, OperationKind::Manual);
    assert_eq!(operations[0].status, OperationStatus::Running);

    assert!(h.take_handle().resolve(Continuation::update(|s: &Doc| DocPatch {
        count: Some(s.count * 10),
        ..Default::default()
    })));
    let outcome = h.engine.wait_for("edit", Duration::from_secs(1)).await;

    assert!(outcome.success);
    assert_eq!(h.engine.state().count, 30);
    assert!(h.engine.is_clean());
}

#[tokio::test]
async fn dispatch_async_resolves_with_committed_state() {
    let h = harness(|b| b);

    let state = h.engine.dispatch_async(Msg::Add(2)).await.unwrap();

    assert_eq!(state.count, 2);
    assert!(h.engine.is_clean());
}

#[tokio::test]
async fn operation_failure_errors_the_transition() {
    let h = harness(|b| b);
    let failure = EngineError::operation("hold", "offline");

    let (result, ()) = tokio::join!(h.engine.dispatch_async(within("sync", Msg::Hold)), async {
        assert!(h.take_handle().reject(failure.clone()));
    });

    assert_eq!(result.unwrap_err(), failure);
    assert_eq!(h.errors.lock()[0], (Some(Transition::from("sync")), failure));
    assert!(h.engine.is_clean());
}

#[tokio::test(start_paused = true)]
async fn continuation_dispatch_folds_into_the_transition() {
    let h = harness(|b| b);

    let state = h.engine.dispatch_async(within("t", Msg::Later(5))).await.unwrap();

    assert_eq!(state.count, 5);
    assert!(h.engine.is_clean());
}

#[tokio::test(start_paused = true)]
async fn queued_operations_run_one_at_a_time() {
    let h = harness(|b| b);
    let start = tokio::time::Instant::now();

    h.engine.dispatch(within("t1", Msg::Queued { id: 1, delay_ms: 150 })).unwrap();
    h.engine.dispatch(within("t2", Msg::Queued { id: 2, delay_ms: 100 })).unwrap();
    h.engine.dispatch(within("t3", Msg::Queued { id: 3, delay_ms: 50 })).unwrap();

    let waiting = &h.engine.operations("t2")[0];
    assert_eq!(waiting.status, OperationStatus::Queued);
    assert_eq!(waiting.display_label(), "save-2 (waiting in queue)");

    let outcome = h.engine.wait_for("t3", Duration::from_secs(5)).await;
    let elapsed = start.elapsed();

    assert!(outcome.success);
    assert!(elapsed >= Duration::from_millis(300), "finished after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(350), "finished after {elapsed:?}");
    assert_eq!(h.engine.state().count, 123);

    h.engine.flush().await;
    assert!(h.engine.is_clean());
}

#[tokio::test(start_paused = true)]
async fn optimistic_preview_lasts_until_commit() {
    let h = harness(|b| b);
    let title_len = Derivation::new("title_len", |s: &Doc| s.title.clone(), |t: &String| t.len());

    h.engine
        .dispatch(within(
            "save",
            Msg::Save {
                title: "draft".into(),
                delay_ms: 100,
            },
        ))
        .unwrap();

    assert_eq!(h.engine.state().title, "");
    assert!(!h.engine.state().saving);
    assert_eq!(h.engine.optimistic_state().title, "draft");
    assert_eq!(h.engine.derive_optimistic(&title_len), 5);
    assert_eq!(h.engine.derive(&title_len), 0);
    let snapshot = h.engine.registry_snapshot();
    assert_eq!(snapshot.optimistic_entries, 1);
    assert_eq!(snapshot.live_operations, 1);
    assert_eq!(snapshot.drafts, 1);

    let outcome = h.engine.wait_for("save", Duration::from_secs(1)).await;

    assert_eq!(outcome.reason, WaitReason::Completed);
    let state = h.engine.state();
    assert_eq!(state.title, "draft");
    assert!(!state.saving);
    assert_eq!(h.engine.optimistic_state(), state);
    assert!(h.engine.is_clean());
}

#[tokio::test(start_paused = true)]
async fn finalizer_runs_once_per_member_and_flags_the_last() {
    let h = harness(|b| b);

    h.engine.dispatch(within("batch", Msg::Batch(vec![10, 20, 30]))).unwrap();
    assert!(!h.engine.state().saving);

    let outcome = h.engine.wait_for("batch", Duration::from_secs(1)).await;

    assert!(outcome.success);
    assert_eq!(*h.finishes.lock(), vec![false, false, true]);
    assert!(!h.engine.state().saving);
    assert!(h.engine.is_clean());
}

#[tokio::test]
async fn operation_overflow_errors_the_transition() {
    let h = harness(|b| b.max_async_operations_count(2));

    h.engine.dispatch(within("batch", Msg::Batch(vec![10, 10, 10]))).unwrap();

    assert!(!h.engine.is_happening("batch"));
    assert_eq!(
        h.errors.lock()[0].1,
        EngineError::OperationOverflow {
            limit: 2,
            transition: "batch".to_string()
        }
    );
    assert!(h.finishes.lock().is_empty());
    assert!(h.engine.is_clean());
}

#[tokio::test(start_paused = true)]
async fn wait_for_times_out_without_stopping_work() {
    let h = harness(|b| b);
    h.engine.dispatch(within("slow", Msg::Hold)).unwrap();

    for _ in 0..3 {
        let outcome = h.engine.wait_for("slow", Duration::from_millis(50)).await;
        assert_eq!(outcome.reason, WaitReason::Timeout);
        assert!(!outcome.success);
    }
    assert!(h.engine.is_happening("slow"));
    let snapshot = h.engine.registry_snapshot();
    assert_eq!(snapshot.wait_signals, 0);
    assert_eq!(snapshot.done_callbacks, 0);

    assert!(h.take_handle().resolve(Continuation::None));
    let outcome = h.engine.wait_for("slow", Duration::from_secs(1)).await;
    assert_eq!(outcome.reason, WaitReason::Completed);

    let idle = h.engine.wait_for("idle", Duration::from_millis(1)).await;
    assert!(idle.success);
    assert!(h.engine.is_clean());
}

#[tokio::test]
async fn abort_is_idempotent_and_discards_work() {
    let h = harness(|b| b);
    h.engine.dispatch(within("upload", Msg::Hold)).unwrap();
    h.engine.dispatch(within("upload", Msg::Add(2))).unwrap();

    let waiter = tokio::spawn({
        let engine = h.engine.clone();
        async move { engine.wait_for("upload", Duration::from_secs(5)).await }
    });
    tokio::task::yield_now().await;

    assert!(h.engine.abort("upload"));
    assert!(!h.engine.abort("upload"));

    assert_eq!(waiter.await.unwrap().reason, WaitReason::Error);
    assert_eq!(h.engine.state().count, 0);
    assert_eq!(*h.aborts.lock(), vec![Transition::from("upload")]);
    assert!(h.errors.lock().is_empty());
    assert!(h.engine.is_clean());
}

#[tokio::test]
async fn nested_abort_reaches_every_descendant() {
    let h = harness(|b| b);
    h.engine.dispatch(within("form/name", Msg::Hold)).unwrap();
    h.engine.dispatch(within("form/email", Msg::Hold)).unwrap();
    assert!(h.engine.is_happening_unique("form"));

    assert!(h.engine.abort(Transition::from("form").nested()));

    assert!(!h.engine.is_happening_unique("form"));
    assert!(!h.engine.is_happening(Transition::from_key("form/name")));
    assert_eq!(*h.aborts.lock(), vec![Transition::from("form")]);
    assert!(h.engine.is_clean());
}

#[tokio::test]
async fn default_transition_applies_to_unnamed_work() {
    let h = harness(|b| b.default_transition("ui"));

    h.engine.dispatch(Msg::Hold).unwrap();
    assert!(h.engine.is_happening("ui"));

    assert!(h.take_handle().resolve(Continuation::None));
    assert!(h.engine.wait_for("ui", Duration::from_secs(1)).await.success);

    let snapshot = serde_json::to_value(h.engine.registry_snapshot()).unwrap();
    assert_eq!(snapshot["live_operations"], 0);
    assert!(h.engine.is_clean());
}

#[tokio::test]
async fn dispatch_async_fails_when_its_chain_rolls_back() {
    let h = harness(|b| b);

    let result = h
        .engine
        .dispatch_async(within(
            "outer",
            Msg::Seq(vec![Msg::Add(1), within("other", Msg::Fail)]),
        ))
        .await;

    assert_eq!(result.unwrap_err(), EngineError::reducer("boom"));
    assert_eq!(h.engine.state().count, 0);
    assert!(h
        .errors
        .lock()
        .iter()
        .any(|(transition, _)| transition == &Some(Transition::from("other"))));
    assert!(h.engine.is_clean());
}

#[tokio::test]
async fn sub_branch_setters_interleave_with_the_parent() {
    let h = harness(|b| b);
    h.engine.dispatch(within("t", Msg::Hold)).unwrap();
    h.engine.dispatch(within("t", Msg::Hold)).unwrap();

    // The continuation opens a sub-branch that sets a digit and stays open.
    assert!(h.take_handle().resolve(Continuation::Dispatch(Msg::Seq(vec![
        Msg::Digit(1),
        Msg::Hold,
    ]))));
    until(|| h.handles.lock().len() == 2).await;

    h.engine.dispatch(within("t", Msg::Digit(2))).unwrap();
    assert!(h.take_handle().resolve(Continuation::None));
    until(|| {
        h.engine
            .operations("t")
            .iter()
            .filter(|op| op.status == OperationStatus::Done)
            .count()
            == 2
    })
    .await;

    // The parent's working state now holds both digits, in order.
    h.engine.dispatch(within("t", Msg::Mirror)).unwrap();
    assert!(h.take_handle().resolve(Continuation::None));
    assert!(h.engine.wait_for("t", Duration::from_secs(1)).await.success);

    let state = h.engine.state();
    assert_eq!(state.count, 12);
    assert_eq!(state.title, "12");
    assert!(h.engine.is_clean());
}

#[tokio::test]
async fn sub_branch_failures_error_the_owner() {
    let h = harness(|b| b);
    let mut events = h.engine.events();
    h.engine.dispatch(within("t", Msg::Hold)).unwrap();

    assert!(h.take_handle().resolve(Continuation::Dispatch(Msg::Hold)));
    until(|| h.handles.lock().len() == 1).await;
    assert!(h.take_handle().resolve(Continuation::Dispatch(Msg::Hold)));
    until(|| h.handles.lock().len() == 1).await;

    let failure = EngineError::operation("hold", "offline");
    assert!(h.take_handle().reject(failure.clone()));
    let outcome = h.engine.wait_for("t", Duration::from_secs(1)).await;

    assert_eq!(outcome.reason, WaitReason::Error);
    assert_eq!(*h.errors.lock(), vec![(Some(Transition::from("t")), failure)]);
    let mut depths = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::TransitionError { transition, .. } = event {
            depths.push(transition.matches('/').count());
        }
    }
    assert_eq!(depths, vec![2, 1, 0]);
    assert!(h.engine.is_clean());
}

#[tokio::test]
async fn cancelled_operation_aborts_instead_of_erroring() {
    let h = harness(|b| b);

    let (result, ()) = tokio::join!(h.engine.dispatch_async(within("poll", Msg::HoldGrouped)), async {
        assert!(h.take_handle().reject(EngineError::cancelled("poll")));
    });

    assert!(result.is_ok());
    assert_eq!(*h.aborts.lock(), vec![Transition::from("poll")]);
    assert!(h.errors.lock().is_empty());
    assert!(h.finishes.lock().is_empty());
    assert!(h.engine.is_clean());
}

#[tokio::test(start_paused = true)]
async fn aborted_queued_operation_never_runs() {
    let h = harness(|b| b);
    h.engine.dispatch(within("t1", Msg::Queued { id: 1, delay_ms: 100 })).unwrap();
    h.engine.dispatch(within("t2", Msg::Queued { id: 2, delay_ms: 10 })).unwrap();
    h.engine.dispatch(within("t3", Msg::Queued { id: 3, delay_ms: 10 })).unwrap();
    assert_eq!(h.engine.operations("t2")[0].status, OperationStatus::Queued);

    assert!(h.engine.abort("t2"));
    assert!(h.engine.wait_for("t3", Duration::from_secs(5)).await.success);
    h.engine.flush().await;

    assert_eq!(h.engine.state().count, 13);
    assert_eq!(*h.aborts.lock(), vec![Transition::from("t2")]);
    assert!(h.engine.is_clean());
}

#[tokio::test(start_paused = true)]
async fn queue_failure_errors_every_waiting_transition() {
    let h = harness(|b| b);
    h.engine.dispatch(within("t1", Msg::QueuedFail { delay_ms: 20 })).unwrap();
    h.engine.dispatch(within("t2", Msg::Queued { id: 2, delay_ms: 10 })).unwrap();
    h.engine.dispatch(within("t3", Msg::Queued { id: 3, delay_ms: 10 })).unwrap();

    let outcome = h.engine.wait_for("t3", Duration::from_secs(5)).await;
    assert_eq!(outcome.reason, WaitReason::Error);
    until(|| h.errors.lock().len() == 3).await;
    h.engine.flush().await;

    let failure = EngineError::operation("flaky", "offline");
    let mut failed: Vec<String> = h
        .errors
        .lock()
        .iter()
        .map(|(transition, error)| {
            assert_eq!(error, &failure);
            transition.as_ref().map(Transition::key).unwrap_or_default()
        })
        .collect();
    failed.sort();
    assert_eq!(failed, vec!["t1", "t2", "t3"]);
    assert_eq!(h.engine.state().count, 0);
    assert!(h.engine.is_clean());
}
