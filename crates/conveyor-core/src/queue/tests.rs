//! Scheduler behaviour under a paused tokio clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rstest::rstest;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::domain::{TaskId, TaskOutcome, TaskOverrides, TaskStatus};
use crate::error::{BoxError, QueueError, TaskError};
use crate::ports::SequentialGenerator;

fn config(max_concurrent: usize) -> QueueConfig {
    QueueConfig {
        max_concurrent,
        request_interval_ms: 0,
        max_retries: 0,
        retry_delay_ms: 10,
        timeout_ms: 1_000,
    }
}

fn queue(config: QueueConfig) -> TaskQueue<u32> {
    TaskQueue::builder()
        .config(config)
        .id_generator(SequentialGenerator::new("t-"))
        .build()
        .unwrap()
}

fn ok(value: u32) -> Result<u32, BoxError> {
    Ok(value)
}

fn boom(message: &str) -> Result<u32, BoxError> {
    Err(message.to_owned().into())
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[tokio::test(start_paused = true)]
async fn higher_priority_runs_first() {
    let q = queue(config(1));
    let order = Arc::new(Mutex::new(Vec::new()));

    for priority in [1, 5, 3] {
        let order = Arc::clone(&order);
        q.submit_with_options(
            move |_, _| {
                order.lock().unwrap().push(priority);
                async move { ok(priority as u32) }
            },
            (),
            TaskOverrides::new().with_priority(priority),
        );
    }

    let results = q.start().await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec![5, 3, 1]);
    assert_eq!(results.stats.completed, 3);
}

#[rstest]
#[case(1)]
#[case(3)]
#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_cap(#[case] cap: usize) {
    let q = queue(config(cap));
    let running = counter();
    let peak = counter();

    // Observer panics are swallowed, so count violations instead of asserting.
    let violations = counter();
    let checker = q.clone();
    let _sub = q.subscribe({
        let violations = Arc::clone(&violations);
        move |p| {
            let s = checker.stats();
            if p.running > cap || s.total != s.completed + s.failed + s.executing + s.pending {
                violations.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    for _ in 0..10 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        q.submit(move |_, _| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                ok(1)
            }
        });
    }

    let results = q.start().await.unwrap();
    assert_eq!(results.stats.completed, 10);
    assert_eq!(peak.load(Ordering::SeqCst), cap);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    q.check_accounting();
}

#[tokio::test(start_paused = true)]
async fn failed_attempts_back_off_linearly_then_fail() {
    let errors = counter();
    let q: TaskQueue<u32> = TaskQueue::builder()
        .config(QueueConfig {
            max_retries: 2,
            retry_delay_ms: 100,
            ..config(1)
        })
        .on_error({
            let errors = Arc::clone(&errors);
            move |_, _| {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let id = q.submit({
        let calls = Arc::clone(&calls);
        move |_, _| {
            calls.lock().unwrap().push(Instant::now());
            async { boom("nope") }
        }
    });

    let results = q.start().await.unwrap();

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3, "max_retries + 1 executions");
    let first_gap = calls[1] - calls[0];
    let second_gap = calls[2] - calls[1];
    assert!(first_gap >= Duration::from_millis(100) && first_gap < Duration::from_millis(110));
    assert!(second_gap >= Duration::from_millis(200) && second_gap < Duration::from_millis(210));

    assert_eq!(results.stats.failed, 1);
    let snap = q.task(&id).unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert_eq!(snap.attempts, 2);
    assert_eq!(snap.error, Some(TaskError::failed("nope")));
    assert_eq!(errors.load(Ordering::SeqCst), 1, "retried attempts stay quiet");
}

#[tokio::test(start_paused = true)]
async fn timeouts_are_reported_and_cancel_the_attempt() {
    let q = queue(QueueConfig {
        timeout_ms: 50,
        max_retries: 2,
        retry_delay_ms: 10,
        ..config(1)
    });
    let seen = Arc::new(Mutex::new(Vec::<(Instant, CancellationToken)>::new()));

    let id = q.submit({
        let seen = Arc::clone(&seen);
        move |_, cancel| {
            seen.lock().unwrap().push((Instant::now(), cancel));
            async {
                sleep(Duration::from_secs(1)).await;
                ok(1)
            }
        }
    });

    let results = q.start().await.unwrap();
    assert_eq!(results.stats.failed, 1);

    let snap = q.task(&id).unwrap();
    assert_eq!(snap.attempts, 2);
    let error = snap.error.unwrap();
    assert!(error.is_timeout());
    assert_eq!(error, TaskError::TimedOut { timeout_ms: 50 });

    // Each attempt times out at 50ms, then backs off 10ms x retry number.
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    let gaps: Vec<Duration> = seen.windows(2).map(|w| w[1].0 - w[0].0).collect();
    assert_eq!(gaps.len(), 2);
    for (gap, expected) in gaps.iter().zip([60u64, 70]) {
        let expected = Duration::from_millis(expected);
        assert!(*gap >= expected && *gap < expected + Duration::from_millis(5), "gap {gap:?}");
    }
    assert!(seen.iter().all(|(_, token)| token.is_cancelled()));
}

#[tokio::test(start_paused = true)]
async fn concurrent_start_calls_share_one_run() {
    let executions = counter();
    let completions = counter();
    let q: TaskQueue<u32> = TaskQueue::builder()
        .config(config(1))
        .on_queue_complete({
            let completions = Arc::clone(&completions);
            move |_| {
                completions.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .unwrap();

    for _ in 0..2 {
        let executions = Arc::clone(&executions);
        q.submit(move |_, _| {
            executions.fetch_add(1, Ordering::SeqCst);
            async {
                sleep(Duration::from_millis(10)).await;
                ok(1)
            }
        });
    }

    let (a, b) = tokio::join!(q.start(), q.start());
    assert_eq!(a.unwrap().stats.completed, 2);
    assert_eq!(b.unwrap().stats.completed, 2);
    assert_eq!(executions.load(Ordering::SeqCst), 2);
    assert_eq!(completions.load(Ordering::SeqCst), 1);

    // Starting a finished queue returns at once without re-running anything.
    let again = q.start().await.unwrap();
    assert_eq!(again.stats.completed, 2);
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn pause_lets_in_flight_work_finish_and_holds_the_rest() {
    let q = queue(config(2));
    for _ in 0..7 {
        q.submit(|_, _| async {
            sleep(Duration::from_millis(100)).await;
            ok(1)
        });
    }

    q.launch().unwrap();
    sleep(Duration::from_millis(10)).await;
    q.pause();

    let status = q.status();
    assert!(status.paused);
    assert_eq!((status.executing, status.pending), (2, 5));

    sleep(Duration::from_millis(200)).await;
    let status = q.status();
    assert_eq!((status.executing, status.pending, status.completed), (0, 5, 2));

    q.resume();
    let results = q.start().await.unwrap();
    assert_eq!(results.stats.completed, 7);
    assert!(results.is_success);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_in_flight_attempts_and_is_final() {
    let q = queue(QueueConfig {
        max_retries: 3,
        ..config(3)
    });
    let tokens = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..3 {
        let tokens = Arc::clone(&tokens);
        q.submit(move |_, cancel: CancellationToken| {
            tokens.lock().unwrap().push(cancel);
            async {
                sleep(Duration::from_secs(10)).await;
                ok(1)
            }
        });
    }

    let runner = tokio::spawn({
        let q = q.clone();
        async move { q.start().await }
    });
    sleep(Duration::from_millis(10)).await;
    q.stop();

    assert!(matches!(runner.await.unwrap(), Err(QueueError::Interrupted)));
    assert!(tokens.lock().unwrap().iter().all(CancellationToken::is_cancelled));

    sleep(Duration::from_millis(1)).await;
    let results = q.results();
    assert_eq!(results.stats.failed, 3);
    assert!(results
        .failed
        .iter()
        .all(|t| t.error == Some(TaskError::Cancelled) && t.attempts == 0));

    assert!(matches!(q.start().await, Err(QueueError::Stopped)));
    assert!(matches!(q.launch(), Err(QueueError::Stopped)));
}

#[tokio::test(start_paused = true)]
async fn stopped_run_is_never_reported_complete() {
    let completions = counter();
    let q: TaskQueue<u32> = TaskQueue::builder()
        .config(config(2))
        .on_queue_complete({
            let completions = Arc::clone(&completions);
            move |_| {
                completions.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .unwrap();
    for _ in 0..2 {
        q.submit(|_, _| async {
            sleep(Duration::from_secs(10)).await;
            ok(1)
        });
    }

    q.launch().unwrap();
    sleep(Duration::from_millis(10)).await;
    q.stop();
    sleep(Duration::from_millis(10)).await;

    let stats = q.stats();
    assert_eq!((stats.failed, stats.executing, stats.pending), (2, 0, 0));
    assert_eq!(stats.ended_at, None);
    assert!(!q.extended_progress().is_complete);
    assert_eq!(completions.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn mixed_outcomes_end_to_end() {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let q: TaskQueue<u32> = TaskQueue::builder()
        .config(QueueConfig {
            max_retries: 1,
            ..config(3)
        })
        .on_task_complete({
            let outcomes = Arc::clone(&outcomes);
            move |task, outcome| {
                outcomes.lock().unwrap().push((task.id.clone(), outcome));
            }
        })
        .build()
        .unwrap();

    for i in 0..10u32 {
        q.submit(move |_, _| async move {
            sleep(Duration::from_millis(5)).await;
            if i % 5 == 4 { boom("bad row") } else { ok(i) }
        });
    }

    let results = q.start().await.unwrap();
    assert_eq!(results.stats.total, 10);
    assert_eq!(results.completed.len(), 8);
    assert_eq!(results.failed.len(), 2);
    assert_eq!(results.success_rate, 80);
    assert!(!results.is_success);
    assert!(results.failed.iter().all(|t| t.attempts == 1));
    assert!(results.stats.ended_at.is_some());

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 10);
    assert_eq!(
        outcomes
            .iter()
            .filter(|(_, o)| *o == TaskOutcome::Failed)
            .count(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn clear_discards_in_flight_outcomes() {
    let q = queue(config(2));
    for _ in 0..3 {
        q.submit(|_, _| async {
            sleep(Duration::from_millis(50)).await;
            ok(1)
        });
    }
    q.launch().unwrap();
    sleep(Duration::from_millis(10)).await;

    q.clear();
    assert_eq!(q.stats().total, 0);

    sleep(Duration::from_millis(100)).await;
    let stats = q.stats();
    assert_eq!((stats.total, stats.completed, stats.executing), (0, 0, 0));
    q.check_accounting();

    // Still launched: new work runs without another start.
    q.submit(|_, _| async { ok(9) });
    sleep(Duration::from_millis(1)).await;
    assert_eq!(q.stats().completed, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_failed_tasks_gives_a_fresh_budget() {
    let calls = counter();
    let completions = counter();
    let q: TaskQueue<u32> = TaskQueue::builder()
        .config(config(1))
        .on_queue_complete({
            let completions = Arc::clone(&completions);
            move |_| {
                completions.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .unwrap();

    let id = q.submit({
        let calls = Arc::clone(&calls);
        move |_, _| {
            let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
            async move { if first { boom("flaky") } else { ok(2) } }
        }
    });

    let first = q.start().await.unwrap();
    assert_eq!(q.failed_ids(), vec![id.clone()]);
    assert_eq!(first.stats.failed, 1);

    assert_eq!(q.retry_failed_tasks(), 1);
    assert_eq!(q.stats().pending, 1);

    let second = q.start().await.unwrap();
    assert_eq!(second.stats.completed, 1);
    assert_eq!(second.stats.failed, 0);
    assert_eq!(q.task(&id).unwrap().result, Some(2));
    assert_eq!(completions.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn update_config_validates_and_applies_to_new_tasks() {
    let q = queue(config(1));
    assert!(q.update_config(ConfigUpdate::new().max_concurrent(0)).is_err());
    assert_eq!(q.config().max_concurrent, 1);

    let before = q.submit(|_, _| async { ok(1) });
    q.update_config(ConfigUpdate::new().max_retries(4)).unwrap();
    let after = q.submit(|_, _| async { ok(1) });

    assert_eq!(q.task(&before).unwrap().options.max_retries, 0);
    assert_eq!(q.task(&after).unwrap().options.max_retries, 4);
}

#[tokio::test(start_paused = true)]
async fn panicking_observers_do_not_break_the_run() {
    let q: TaskQueue<u32> = TaskQueue::builder()
        .config(config(2))
        .on_task_complete(|_, _| panic!("observer bug"))
        .on_progress(|_| panic!("observer bug"))
        .build()
        .unwrap();
    for i in 0..4 {
        q.submit(move |_, _| async move { ok(i) });
    }
    let results = q.start().await.unwrap();
    assert_eq!(results.stats.completed, 4);
}

#[tokio::test(start_paused = true)]
async fn starting_an_empty_queue_waits_for_work() {
    let q = queue(config(1));
    let waited = tokio::time::timeout(Duration::from_secs(5), q.start()).await;
    assert!(waited.is_err());

    // The waiting start resolves once work arrives.
    let runner = tokio::spawn({
        let q = q.clone();
        async move { q.start().await }
    });
    sleep(Duration::from_millis(1)).await;
    q.submit(|_, _| async { ok(3) });
    let results = runner.await.unwrap().unwrap();
    assert_eq!(results.stats.completed, 1);
}

#[tokio::test(start_paused = true)]
async fn request_interval_spaces_out_slot_reuse() {
    let q = queue(QueueConfig {
        request_interval_ms: 100,
        ..config(1)
    });
    let calls = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        q.submit(move |_, _| {
            calls.lock().unwrap().push(Instant::now());
            async { ok(1) }
        });
    }

    let started = Instant::now();
    q.start().await.unwrap();
    let calls = calls.lock().unwrap();
    assert!(calls[1] - calls[0] >= Duration::from_millis(100));
    // The trailing throttle does not hold back completion.
    assert!(Instant::now() - started < Duration::from_millis(150));
}

#[tokio::test(start_paused = true)]
async fn duplicate_ids_create_separate_tasks() {
    let q = queue(config(1));
    q.submit_with_id("dup", |_, _| async { ok(1) });
    q.submit_with_id("dup", |_, _| async { ok(2) });
    let results = q.start().await.unwrap();

    assert_eq!(results.stats.completed, 2);
    let latest = q.task(&TaskId::from("dup")).unwrap();
    assert_eq!(latest.result, Some(2));
}

#[tokio::test(start_paused = true)]
async fn batch_submission_preserves_order_and_payloads() {
    let q: TaskQueue<String, String> = TaskQueue::builder().config(config(1)).build().unwrap();
    let echo = |input: crate::domain::TaskInput<String>, _: CancellationToken| async move {
        Ok::<_, BoxError>(format!("{}:{}", input.task_id, input.data))
    };
    let ids = q.submit_batch(vec![
        BatchItem::new(echo, "a".to_owned()).with_id("first"),
        BatchItem::new(echo, "b".to_owned()).with_id("second"),
    ]);
    assert_eq!(ids, vec![TaskId::from("first"), TaskId::from("second")]);

    let results = q.start().await.unwrap();
    let values: Vec<_> = results.completed.iter().filter_map(|t| t.result.clone()).collect();
    assert_eq!(values, vec!["first:a".to_owned(), "second:b".to_owned()]);
}

#[test]
fn launching_outside_a_runtime_is_an_error() {
    let q = queue(config(1));
    q.submit(|_, _| async { ok(1) });
    assert!(matches!(q.launch(), Err(QueueError::NoRuntime)));
}

#[tokio::test(start_paused = true)]
async fn destroy_drops_everything() {
    let q = queue(config(1));
    q.submit(|_, _| async {
        sleep(Duration::from_secs(1)).await;
        ok(1)
    });
    q.launch().unwrap();
    sleep(Duration::from_millis(1)).await;

    q.destroy();
    assert!(q.is_destroyed());
    assert_eq!(q.stats().total, 0);
    assert!(q.status().stopped);
}
