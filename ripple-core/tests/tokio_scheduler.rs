//! Tokio Scheduler Tests
//!
//! Throttling and rate limiting on real tokio timers. Reactive nodes are
//! `!Send`, so everything runs inside a `LocalSet`; the clock is paused and
//! moved with `tokio::time::advance`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use ripple_core::reactive::RateLimit;
use ripple_core::scheduler::{Scheduler, TokioScheduler};
use ripple_core::{Computed, Observable};
use tokio::task::LocalSet;

/// Let spawned timers register, move the clock, then let due timers run.
async fn settle(by: Duration) {
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
    tokio::time::advance(by).await;
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn throttled_computed_on_tokio_timers() {
    LocalSet::new()
        .run_until(async {
            let scheduler = Rc::new(TokioScheduler::new());
            let source = Observable::new(0);
            let computed = {
                let source = source.clone();
                Computed::options()
                    .read(move || source.get() + 1)
                    .throttle_evaluation(Duration::from_millis(100))
                    .scheduler(scheduler.clone())
                    .build()
                    .unwrap()
            };

            source.set(1);
            source.set(2);
            assert_eq!(scheduler.pending(), 1);
            assert_eq!(computed.evaluation_count(), 1);

            settle(Duration::from_millis(101)).await;
            assert_eq!(computed.evaluation_count(), 2);
            assert_eq!(computed.peek(), 3);
            assert_eq!(scheduler.pending(), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn rate_limited_observable_on_tokio_timers() {
    LocalSet::new()
        .run_until(async {
            let scheduler = Rc::new(TokioScheduler::new());
            let value = Observable::new(0);
            value.extend(RateLimit::debounce(Duration::from_millis(50)).with_scheduler(scheduler.clone()));

            let seen = Rc::new(RefCell::new(Vec::new()));
            {
                let seen = Rc::clone(&seen);
                value.subscribe(move |v| seen.borrow_mut().push(*v));
            }

            for n in 1..=3 {
                value.set(n);
                settle(Duration::from_millis(30)).await;
            }
            assert!(seen.borrow().is_empty());

            settle(Duration::from_millis(25)).await;
            assert_eq!(*seen.borrow(), vec![3]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn cleared_timer_never_fires() {
    LocalSet::new()
        .run_until(async {
            let scheduler = TokioScheduler::new();
            let fired = Rc::new(RefCell::new(false));
            let id = {
                let fired = Rc::clone(&fired);
                scheduler.set_timeout(Duration::from_millis(10), Box::new(move || *fired.borrow_mut() = true))
            };
            scheduler.clear_timeout(id);
            assert_eq!(scheduler.pending(), 0);

            settle(Duration::from_millis(20)).await;
            assert!(!*fired.borrow());
        })
        .await;
}
