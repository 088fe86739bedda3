//! End-to-end behaviour of the schedulers on real worker threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use tessera_scheduler::{
    work_fn, AcquisitionStrategy, ApproximatelyPrioritizedSharedFutureScheduler, CollectingErrorSink, Scheduler,
    SchedulerError, SchedulerResult, SharedFutureScheduler, TaskError, WorkCallback, WorkerGroupBuilder,
};

type Callback<'a> = WorkCallback<'a, u64, u64>;

fn builder(threads: usize) -> WorkerGroupBuilder {
    WorkerGroupBuilder::new()
        .threads(threads)
        .poll_timeout(Duration::from_millis(50))
        .join_poll_interval(Duration::from_millis(1))
}

/// Run `f` on its own thread and fail the test if it does not finish.
fn within<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(30))
        .expect("did not finish in time (deadlock?)")
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Invocation log plus a gate that parameter 0 blocks on, so a test can keep
/// the only worker busy while it arranges the queue.
#[derive(Clone)]
struct Recorder {
    calls: Arc<Mutex<Vec<u64>>>,
    gate_tx: Sender<()>,
    gate_rx: Receiver<()>,
}

impl Recorder {
    fn new() -> Self {
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            gate_tx,
            gate_rx,
        }
    }

    fn record(&self, p: u64) {
        if p == 0 {
            let _ = self.gate_rx.recv_timeout(Duration::from_secs(10));
        }
        self.calls.lock().push(p);
    }

    fn open(&self) {
        self.gate_tx.send(()).unwrap();
    }

    fn count(&self, p: u64) -> usize {
        self.calls.lock().iter().filter(|&&c| c == p).count()
    }
}

fn doubling(recorder: &Recorder, threads: usize) -> SharedFutureScheduler<u64, u64> {
    let recorder = recorder.clone();
    SharedFutureScheduler::new(
        work_fn::single(move |p: &u64| {
            recorder.record(*p);
            Ok(p * 2)
        }),
        builder(threads),
    )
    .unwrap()
}

// ── Scenarios ───────────────────────────────────────────────────────

#[test]
fn scenario_a_independent_params() {
    let scheduler = doubling(&Recorder::new(), 4);
    assert_eq!(scheduler.scatter_gather(vec![1, 2, 3]).unwrap(), vec![2, 4, 6]);
    scheduler.close().unwrap();
}

#[test]
fn scenario_b_single_worker_recursion_completes() {
    let scheduler: Arc<ApproximatelyPrioritizedSharedFutureScheduler<u64, u64>> = Arc::new(
        ApproximatelyPrioritizedSharedFutureScheduler::new(
            work_fn::from_fn(|p: &u64, cb: &mut Callback<'_>| {
                let value = if *p == 10 {
                    cb.scatter_gather(vec![5, 3])?.iter().sum()
                } else {
                    *p
                };
                cb.complete(p, value)
            }),
            builder(1),
            |a: &u64, b: &u64| a.cmp(b),
        )
        .unwrap(),
    );

    let value = within({
        let scheduler = Arc::clone(&scheduler);
        move || scheduler.schedule(10).join()
    });
    assert_eq!(value.unwrap(), 8);
    assert_eq!(scheduler.metrics().executions, 3);
    scheduler.close().unwrap();
}

#[test]
fn scenario_c_cancelled_before_dequeue_never_runs() {
    let recorder = Recorder::new();
    let scheduler = doubling(&recorder, 1);

    let blocker = scheduler.schedule(0);
    wait_until("blocker running", || scheduler.metrics().executions == 1);

    let doomed = scheduler.schedule(7);
    assert!(doomed.cancel());
    assert!(doomed.is_cancelled());
    assert!(matches!(doomed.join(), Err(SchedulerError::Cancelled)));

    recorder.open();
    assert_eq!(blocker.join().unwrap(), 0);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.count(7), 0);

    let fresh = scheduler.schedule(7);
    assert!(!fresh.same_task(&doomed));
    assert_eq!(fresh.join().unwrap(), 14);
    assert_eq!(recorder.count(7), 1);
    scheduler.close().unwrap();
}

// ── Properties ──────────────────────────────────────────────────────

#[test]
fn dropped_future_keeps_its_reference() {
    let recorder = Recorder::new();
    let scheduler = doubling(&recorder, 1);

    let blocker = scheduler.schedule(0);
    wait_until("blocker running", || scheduler.metrics().executions == 1);
    drop(scheduler.schedule(3));
    let unwanted = scheduler.schedule(4);
    assert!(unwanted.cancel());

    recorder.open();
    assert_eq!(blocker.join().unwrap(), 0);
    wait_until("dropped task ran", || recorder.count(3) == 1);
    assert_eq!(recorder.count(4), 0);
    assert_eq!(scheduler.metrics().tasks_cancelled, 1);
    scheduler.close().unwrap();
}

#[test]
fn pending_duplicates_share_one_execution() {
    let recorder = Recorder::new();
    let scheduler = doubling(&recorder, 1);

    let blocker = scheduler.schedule(0);
    wait_until("blocker running", || scheduler.metrics().executions == 1);
    let first = scheduler.schedule(5);
    let second = scheduler.schedule(5);
    assert!(first.same_task(&second));

    recorder.open();
    assert_eq!(first.join().unwrap(), 10);
    assert_eq!(second.join().unwrap(), 10);
    assert_eq!(blocker.join().unwrap(), 0);
    assert_eq!(recorder.count(5), 1);
    assert_eq!(scheduler.metrics().tasks_retained, 1);
    scheduler.close().unwrap();
}

#[test]
fn equal_params_never_run_concurrently() {
    let in_flight = Arc::new(Mutex::new(HashMap::<u64, usize>::new()));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let scheduler: Arc<SharedFutureScheduler<u64, u64>> = {
        let in_flight = Arc::clone(&in_flight);
        let overlaps = Arc::clone(&overlaps);
        Arc::new(
            SharedFutureScheduler::new(
                work_fn::single(move |p: &u64| {
                    {
                        let mut running = in_flight.lock();
                        let count = running.entry(*p).or_default();
                        *count += 1;
                        if *count > 1 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    std::thread::sleep(Duration::from_millis(2));
                    *in_flight.lock().get_mut(p).unwrap() -= 1;
                    Ok(*p)
                }),
                builder(4),
            )
            .unwrap(),
        )
    };

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            std::thread::spawn(move || {
                for _ in 0..20 {
                    assert_eq!(scheduler.schedule(1).join().unwrap(), 1);
                }
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    scheduler.close().unwrap();
}

#[test]
fn resubmission_during_execution_runs_once_more() {
    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded::<()>();
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler: SharedFutureScheduler<u64, u64> = {
        let runs = Arc::clone(&runs);
        SharedFutureScheduler::new(
            work_fn::single(move |p: &u64| {
                let run = runs.fetch_add(1, Ordering::SeqCst);
                if run == 0 {
                    let _ = entered_tx.send(());
                    let _ = gate_rx.recv_timeout(Duration::from_secs(10));
                }
                Ok(*p + run as u64)
            }),
            builder(2),
        )
        .unwrap()
    };

    let first = scheduler.schedule(100);
    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    // nobody waits on these yet, and both coalesce onto one successor
    let second = scheduler.schedule(100);
    let third = scheduler.schedule(100);
    assert!(!second.same_task(&first));
    assert!(second.same_task(&third));
    gate_tx.send(()).unwrap();

    assert_eq!(first.join().unwrap(), 100);
    assert_eq!(second.join().unwrap(), 101);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.metrics().tasks_resubmitted, 1);
    scheduler.close().unwrap();
}

#[test]
fn gather_preserves_input_order() {
    let scheduler: SharedFutureScheduler<u64, u64> = SharedFutureScheduler::new(
        work_fn::single(|p: &u64| {
            // later params finish first
            std::thread::sleep(Duration::from_millis(30 - 5 * p));
            Ok(p * 2)
        }),
        builder(4),
    )
    .unwrap();

    assert_eq!(
        scheduler.scatter_gather(vec![1, 2, 3, 4, 5]).unwrap(),
        vec![2, 4, 6, 8, 10]
    );
    scheduler.close().unwrap();
}

#[test]
fn gather_failure_surfaces_first_error() {
    let scheduler: SharedFutureScheduler<u64, u64> = SharedFutureScheduler::new(
        work_fn::single(|p: &u64| -> anyhow::Result<u64> {
            if *p == 2 {
                anyhow::bail!("tile {p} is corrupt");
            }
            Ok(*p)
        }),
        builder(2).error_sink(CollectingErrorSink::new()),
    )
    .unwrap();

    match scheduler.scatter_gather(vec![1, 2, 3]) {
        Err(SchedulerError::Failed(cause)) => assert_eq!(cause.to_string(), "tile 2 is corrupt"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(scheduler.scatter_gather(vec![1, 3]).unwrap(), vec![1, 3]);
    scheduler.close().unwrap();
}

fn pyramid(p: &u64, cb: &mut Callback<'_>) -> SchedulerResult<()> {
    // param = level * 1000 + x
    let (level, x) = (p / 1000, p % 1000);
    let value = if level == 0 {
        1
    } else {
        let below = (level - 1) * 1000;
        cb.scatter_gather(vec![below + x * 2, below + x * 2 + 1])?.iter().sum()
    };
    cb.complete(p, value)
}

#[test]
fn deep_recursion_does_not_exhaust_two_workers() {
    let scheduler: Arc<SharedFutureScheduler<u64, u64>> =
        Arc::new(SharedFutureScheduler::new(work_fn::from_fn(pyramid), builder(2)).unwrap());

    let values = within({
        let scheduler = Arc::clone(&scheduler);
        move || scheduler.scatter_gather(vec![6000, 6001, 6002])
    });
    assert_eq!(values.unwrap(), vec![64, 64, 64]);
    scheduler.close().unwrap();
}

#[test]
fn prioritized_pyramid_on_one_worker() {
    let scheduler: Arc<ApproximatelyPrioritizedSharedFutureScheduler<u64, u64>> = Arc::new(
        ApproximatelyPrioritizedSharedFutureScheduler::new(work_fn::from_fn(pyramid), builder(1), |a: &u64, b: &u64| {
            (a / 1000).cmp(&(b / 1000))
        })
        .unwrap(),
    );

    let value = within({
        let scheduler = Arc::clone(&scheduler);
        move || scheduler.schedule(5003).join()
    });
    assert_eq!(value.unwrap(), 32);
    scheduler.close().unwrap();
}

#[test]
fn illegal_priority_recursion_fails_fast() {
    let sink = CollectingErrorSink::new();
    let scheduler: ApproximatelyPrioritizedSharedFutureScheduler<u64, u64> =
        ApproximatelyPrioritizedSharedFutureScheduler::new(
            work_fn::from_fn(|p: &u64, cb: &mut Callback<'_>| {
                let value = cb.scatter_gather(vec![p + 5])?.iter().sum();
                cb.complete(p, value)
            }),
            builder(2).error_sink(sink.clone()),
            |a: &u64, b: &u64| a.cmp(b),
        )
        .unwrap();

    match scheduler.schedule(5).join() {
        Err(SchedulerError::Failed(cause)) => {
            assert!(cause.to_string().contains("recursion from 5 to 10 is not permitted"), "{cause}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    // nothing was enqueued for the rejected child
    assert_eq!(scheduler.metrics().tasks_created, 1);
    assert_eq!(sink.len(), 1);
    scheduler.close().unwrap();
}

/// Wait on `child` through the plain future handed out by the callback.
fn join_plain(cb: &mut Callback<'_>, p: &u64, child: u64) -> SchedulerResult<()> {
    let future = cb.schedule(child);
    let outcome = future.join();
    future.cancel();
    cb.complete(p, outcome?)
}

fn failure_text(outcome: SchedulerResult<u64>) -> String {
    match outcome {
        Err(SchedulerError::Failed(cause)) => cause.to_string(),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn future_join_in_work_cannot_climb_priorities() {
    let scheduler: Arc<ApproximatelyPrioritizedSharedFutureScheduler<u64, u64>> = Arc::new(
        ApproximatelyPrioritizedSharedFutureScheduler::new(
            work_fn::from_fn(|p: &u64, cb: &mut Callback<'_>| join_plain(cb, p, p + 5)),
            builder(1).error_sink(CollectingErrorSink::new()),
            |a: &u64, b: &u64| a.cmp(b),
        )
        .unwrap(),
    );

    let outcome = within({
        let scheduler = Arc::clone(&scheduler);
        move || scheduler.schedule(5).join()
    });
    let message = failure_text(outcome);
    assert!(message.contains("recursion from 5 to 10 is not permitted"), "{message}");

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(scheduler.metrics().executions, 1);
    scheduler.close().unwrap();
}

#[test]
fn future_join_on_own_parameter_fails_on_worker() {
    let scheduler: Arc<SharedFutureScheduler<u64, u64>> = Arc::new(
        SharedFutureScheduler::new(
            work_fn::from_fn(|p: &u64, cb: &mut Callback<'_>| join_plain(cb, p, *p)),
            builder(1).error_sink(CollectingErrorSink::new()),
        )
        .unwrap(),
    );

    let outcome = within({
        let scheduler = Arc::clone(&scheduler);
        move || scheduler.schedule(1).join()
    });
    let message = failure_text(outcome);
    assert!(message.contains("cannot wait on its own parameter"), "{message}");

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(scheduler.metrics().executions, 1);
    scheduler.close().unwrap();
}

#[test]
fn future_join_in_work_wraps_child_failure() {
    let scheduler: Arc<SharedFutureScheduler<u64, u64>> = Arc::new(
        SharedFutureScheduler::new(
            work_fn::from_fn(|p: &u64, cb: &mut Callback<'_>| {
                if *p == 13 {
                    return Err(anyhow::anyhow!("bad tile").into());
                }
                join_plain(cb, p, 13)
            }),
            builder(2).error_sink(CollectingErrorSink::new()),
        )
        .unwrap(),
    );

    let outcome = within({
        let scheduler = Arc::clone(&scheduler);
        move || scheduler.schedule(10).join()
    });
    assert_eq!(failure_text(outcome), "task 13 (dependency of 10) failed: bad tile");
    scheduler.close().unwrap();
}

#[test]
fn acquire_batches_queued_neighbours() {
    let recorder = Recorder::new();
    let scheduler: SharedFutureScheduler<u64, u64> = {
        let recorder = recorder.clone();
        SharedFutureScheduler::new(
            work_fn::from_fn(move |p: &u64, cb: &mut Callback<'_>| {
                recorder.record(*p);
                if *p > 10 {
                    cb.acquire(vec![p + 1, p + 2], AcquisitionStrategy::TryStealExisting)?;
                }
                let owned: Vec<u64> = cb.owned().copied().collect();
                for q in owned {
                    cb.complete(&q, q * 2)?;
                }
                Ok(())
            }),
            builder(1),
        )
        .unwrap()
    };

    let blocker = scheduler.schedule(0);
    wait_until("blocker running", || scheduler.metrics().executions == 1);
    let futures: Vec<_> = [11, 12, 13].into_iter().map(|p| scheduler.schedule(p)).collect();

    recorder.open();
    let values: Vec<u64> = futures.iter().map(|f| f.join().unwrap()).collect();
    assert_eq!(values, vec![22, 24, 26]);
    assert_eq!(blocker.join().unwrap(), 0);

    // 11 did all three
    assert_eq!(recorder.count(11), 1);
    assert_eq!(recorder.count(12) + recorder.count(13), 0);
    assert_eq!(scheduler.metrics().tasks_acquired, 2);
    scheduler.close().unwrap();
}

#[test]
fn close_cancels_tasks_that_never_started() {
    let recorder = Recorder::new();
    let scheduler = Arc::new(doubling(&recorder, 1));

    let blocker = scheduler.schedule(0);
    wait_until("blocker running", || scheduler.metrics().executions == 1);
    let pending = scheduler.schedule(9);

    let closer = {
        let scheduler = Arc::clone(&scheduler);
        std::thread::spawn(move || scheduler.close())
    };
    wait_until("close requested", || !scheduler.is_running());
    recorder.open();
    closer.join().unwrap().unwrap();

    // the running task finished, the queued one was cancelled
    assert_eq!(blocker.join().unwrap(), 0);
    assert!(matches!(pending.join(), Err(SchedulerError::Cancelled)));
    assert!(matches!(pending.try_get(), Some(Err(TaskError::Cancelled))));
    assert_eq!(recorder.count(9), 0);

    let late = scheduler.schedule(4);
    assert!(late.is_cancelled());
}

#[test]
fn work_can_observe_shutdown() {
    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let scheduler: Arc<SharedFutureScheduler<u64, u64>> = Arc::new(
        SharedFutureScheduler::new(
            work_fn::from_fn(move |p: &u64, cb: &mut Callback<'_>| {
                let _ = entered_tx.send(());
                while cb.is_running() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                cb.complete(p, 0)
            }),
            builder(1),
        )
        .unwrap(),
    );

    let future = scheduler.schedule(1);
    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    within({
        let scheduler = Arc::clone(&scheduler);
        move || scheduler.close()
    })
    .unwrap();
    assert_eq!(future.join().unwrap(), 0);
}
