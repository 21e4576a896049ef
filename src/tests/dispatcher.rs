use super::{new_log, MockContext};
use crate::threading::{JobStatus, LockFreeDispatcher, ThreadKind};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn message_thread() -> MockContext {
    let ctx = MockContext::initialised();
    ctx.set_thread(ThreadKind::Message);
    ctx
}

#[test]
fn busy_engine_defers_until_idle_tick() {
    let ctx = message_thread();
    ctx.set_busy(true);
    let dispatcher = LockFreeDispatcher::new(8);
    let calls = Arc::new(AtomicUsize::new(0));

    let (ran, handle) = dispatcher.dispatch_tracked(&ctx, &calls, |calls| {
        calls.fetch_add(1, Ordering::SeqCst);
        JobStatus::Ok
    });
    assert!(!ran);
    assert!(handle.is_pending());
    assert_eq!(dispatcher.pending(), 1);

    assert_eq!(dispatcher.timer_tick(&ctx), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    ctx.set_busy(false);
    assert_eq!(dispatcher.timer_tick(&ctx), 1);
    assert_eq!(dispatcher.timer_tick(&ctx), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status(), JobStatus::Ok);
}

#[test]
fn other_threads_always_queue() {
    let ctx = MockContext::initialised();
    let dispatcher = LockFreeDispatcher::new(8);
    let target = Arc::new(AtomicUsize::new(0));
    assert!(!dispatcher.dispatch_after_suspension(&ctx, &target, |_| JobStatus::Ok));
    assert_eq!(dispatcher.pending(), 1);
}

#[test]
fn shutdown_cancels_without_invoking() {
    let ctx = message_thread();
    ctx.set_busy(true);
    let dispatcher = LockFreeDispatcher::new(8);
    let calls = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..3 {
        let (_, handle) = dispatcher.dispatch_tracked(&ctx, &calls, |calls| {
            calls.fetch_add(1, Ordering::SeqCst);
            JobStatus::NeedsToRunAgain
        });
        handles.push(handle);
    }
    ctx.set_busy(false);
    // The first job parks itself at the head of the queue.
    assert_eq!(dispatcher.timer_tick(&ctx), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(dispatcher.shutdown(), 3);
    assert_eq!(dispatcher.pending(), 0);
    assert!(handles
        .iter()
        .all(|handle| handle.status() == JobStatus::Cancelled));
    assert_eq!(dispatcher.timer_tick(&ctx), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let (ran, late) = dispatcher.dispatch_tracked(&ctx, &calls, |_| JobStatus::Ok);
    assert!(!ran);
    assert_eq!(late.status(), JobStatus::Cancelled);
}

#[test]
fn jobs_may_query_the_dispatcher_while_running() {
    let ctx = Arc::new(message_thread());
    ctx.set_busy(true);
    let dispatcher = Arc::new(LockFreeDispatcher::new(8));
    let seen = Arc::new(AtomicUsize::new(usize::MAX));
    let nested = Arc::new(AtomicUsize::new(usize::MAX));

    {
        let seen = Arc::clone(&seen);
        let nested = Arc::clone(&nested);
        let tick_ctx = Arc::clone(&ctx);
        dispatcher.dispatch_after_suspension(ctx.as_ref(), &dispatcher, move |d| {
            seen.store(d.pending(), Ordering::SeqCst);
            nested.store(d.timer_tick(tick_ctx.as_ref()), Ordering::SeqCst);
            JobStatus::Ok
        });
    }
    dispatcher.dispatch_after_suspension(ctx.as_ref(), &dispatcher, |_| JobStatus::Ok);

    ctx.set_busy(false);
    assert_eq!(dispatcher.timer_tick(ctx.as_ref()), 2);
    // The second job was still queued while the first one ran.
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(nested.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.pending(), 0);
}

#[test]
fn job_may_shut_its_dispatcher_down() {
    let ctx = message_thread();
    ctx.set_busy(true);
    let dispatcher = Arc::new(LockFreeDispatcher::new(8));
    let (_, first) = dispatcher.dispatch_tracked(&ctx, &dispatcher, |d| {
        d.shutdown();
        JobStatus::NeedsToRunAgain
    });
    let (_, second) = dispatcher.dispatch_tracked(&ctx, &dispatcher, |_| JobStatus::Ok);

    ctx.set_busy(false);
    assert_eq!(dispatcher.timer_tick(&ctx), 0);
    assert!(dispatcher.is_shut_down());
    assert_eq!(dispatcher.pending(), 0);
    assert_eq!(first.status(), JobStatus::Cancelled);
    assert_eq!(second.status(), JobStatus::Cancelled);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn retried_job_runs_exactly_n_plus_one_times_in_order(
        retries in 0usize..6,
        before in 0usize..3,
        after in 0usize..3,
    ) {
        let ctx = MockContext::initialised();
        let dispatcher = LockFreeDispatcher::new(32);
        let log = new_log();
        let target = Arc::new(());

        for idx in 0..before {
            let log = Arc::clone(&log);
            dispatcher.dispatch_after_suspension(&ctx, &target, move |_| {
                log.lock().push(format!("before-{idx}"));
                JobStatus::Ok
            });
        }
        let attempts = Arc::new(AtomicUsize::new(0));
        let (_, handle) = {
            let log = Arc::clone(&log);
            let attempts = Arc::clone(&attempts);
            dispatcher.dispatch_tracked(&ctx, &target, move |_| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                log.lock().push("retry".to_string());
                if attempt < retries {
                    JobStatus::NeedsToRunAgain
                } else {
                    JobStatus::Ok
                }
            })
        };
        for idx in 0..after {
            let log = Arc::clone(&log);
            dispatcher.dispatch_after_suspension(&ctx, &target, move |_| {
                log.lock().push(format!("after-{idx}"));
                JobStatus::Ok
            });
        }

        for _ in 0..retries + 4 {
            dispatcher.timer_tick(&ctx);
        }

        prop_assert_eq!(attempts.load(Ordering::SeqCst), retries + 1);
        prop_assert_eq!(handle.status(), JobStatus::Ok);

        let mut expected: Vec<String> = (0..before).map(|idx| format!("before-{idx}")).collect();
        expected.extend(std::iter::repeat("retry".to_string()).take(retries + 1));
        expected.extend((0..after).map(|idx| format!("after-{idx}")));
        prop_assert_eq!(log.lock().clone(), expected);
    }

    #[test]
    fn cancelled_job_is_never_invoked_again(retries_before_cancel in 0usize..4) {
        let ctx = MockContext::initialised();
        let dispatcher = LockFreeDispatcher::new(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let (_, handle) = dispatcher.dispatch_tracked(&ctx, &calls, |calls| {
            calls.fetch_add(1, Ordering::SeqCst);
            JobStatus::NeedsToRunAgain
        });
        for _ in 0..retries_before_cancel {
            dispatcher.timer_tick(&ctx);
        }
        prop_assert!(handle.cancel());
        for _ in 0..3 {
            dispatcher.timer_tick(&ctx);
        }
        prop_assert_eq!(calls.load(Ordering::SeqCst), retries_before_cancel);
        prop_assert_eq!(dispatcher.pending(), 0);
    }
}
