//! Rate Limiting Tests
//!
//! Bursts of writes against rate-limited observables and computeds, driven
//! by a virtual-clock task queue.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use ripple_core::config::ExtenderConfig;
use ripple_core::reactive::{RateLimit, SubscribeOptions, BEFORE_CHANGE};
use ripple_core::scheduler::{self, TaskQueue};
use ripple_core::{Computed, Observable};

fn recorder<T: Clone + 'static>() -> (Rc<RefCell<Vec<T>>>, impl Fn(&T) + 'static) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    (log, move |v: &T| sink.borrow_mut().push(v.clone()))
}

/// Test that a burst of writes produces one change and one beforeChange.
#[test]
fn burst_of_writes_flushes_once() {
    let queue = Rc::new(TaskQueue::new());
    let value = Observable::new(0);
    value.extend(RateLimit::throttle(Duration::from_millis(50)).with_scheduler(queue.clone()));

    let (changes, on_changes) = recorder::<i32>();
    value.subscribe(on_changes);
    let (befores, on_befores) = recorder::<i32>();
    value.subscribe_to(BEFORE_CHANGE, on_befores, SubscribeOptions::default());

    for n in 1..=10 {
        value.set(n);
    }
    assert_eq!(value.peek(), 10);
    assert!(changes.borrow().is_empty());
    assert_eq!(*befores.borrow(), vec![0]);

    queue.advance(Duration::from_millis(50));
    assert_eq!(*changes.borrow(), vec![10]);
    assert_eq!(*befores.borrow(), vec![0]);
}

/// Test that a rate-limited computed pays for one evaluation per flush.
#[test]
fn rate_limited_computed_evaluates_at_flush() {
    let queue = Rc::new(TaskQueue::new());
    let source = Observable::new(1);
    let doubled = {
        let source = source.clone();
        Computed::new(move || source.get() * 2)
    };
    doubled.extend(RateLimit::throttle(Duration::from_millis(10)).with_scheduler(queue.clone()));
    assert_eq!(doubled.evaluation_count(), 1);

    let (changes, on_changes) = recorder::<i32>();
    doubled.subscribe(on_changes);
    let (befores, on_befores) = recorder::<i32>();
    doubled.subscribe_to(BEFORE_CHANGE, on_befores, SubscribeOptions::default());

    source.set(2);
    source.set(3);
    source.set(4);
    assert_eq!(doubled.evaluation_count(), 1);
    assert_eq!(*befores.borrow(), vec![2]);

    queue.advance(Duration::from_millis(10));
    assert_eq!(doubled.evaluation_count(), 2);
    assert_eq!(*changes.borrow(), vec![8]);
    assert_eq!(doubled.peek(), 8);
}

/// Test that a burst ending on the starting value stays silent.
#[test]
fn burst_back_to_start_is_silent() {
    let queue = Rc::new(TaskQueue::new());
    let value = Observable::new(String::from("a"));
    value.extend(RateLimit::immediate().with_scheduler(queue.clone()));
    let (changes, on_changes) = recorder::<String>();
    value.subscribe(on_changes);

    value.set("b".into());
    value.set("a".into());
    queue.run_pending();

    assert!(changes.borrow().is_empty());
}

/// Test that debouncing waits for writes to stop.
#[test]
fn debounce_waits_for_quiet() {
    let queue = Rc::new(TaskQueue::new());
    let value = Observable::new(0);
    value.extend(RateLimit::debounce(Duration::from_millis(30)).with_scheduler(queue.clone()));
    let (changes, on_changes) = recorder::<i32>();
    value.subscribe(on_changes);

    for n in 1..=5 {
        value.set(n);
        queue.advance(Duration::from_millis(20));
    }
    assert!(changes.borrow().is_empty());

    queue.advance(Duration::from_millis(10));
    assert_eq!(*changes.borrow(), vec![5]);
}

/// Test that disposing a rate-limited computed drops its pending flush.
#[test]
fn disposal_cancels_pending_flush() {
    let queue = Rc::new(TaskQueue::new());
    let source = Observable::new(1);
    let computed = {
        let source = source.clone();
        Computed::new(move || source.get())
    };
    computed.extend(RateLimit::throttle(Duration::from_millis(5)).with_scheduler(queue.clone()));
    let (changes, on_changes) = recorder::<i32>();
    computed.subscribe(on_changes);

    source.set(2);
    computed.dispose();
    queue.run_until_idle();

    assert!(changes.borrow().is_empty());
    assert_eq!(computed.evaluation_count(), 1);
}

/// Test that extenders can be applied from a configuration document on the
/// thread's current scheduler.
#[test]
fn extenders_from_config() {
    let queue = Rc::new(TaskQueue::new());
    scheduler::set_current(queue.clone());

    let value = Observable::new(0);
    let config = ExtenderConfig::from_json(r#"{"rateLimit": 20, "notify": "always"}"#).unwrap();
    value.subscribable().extend_with_config(&config);
    let (changes, on_changes) = recorder::<i32>();
    value.subscribe(on_changes);

    value.value_has_mutated();
    value.value_has_mutated();
    assert!(changes.borrow().is_empty());

    queue.advance(Duration::from_millis(20));
    assert_eq!(*changes.borrow(), vec![0]);
    scheduler::reset_current();
}
