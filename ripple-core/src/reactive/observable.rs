//! Observable Implementation
//!
//! An Observable is the writable leaf of the graph: a subscribable holding
//! one value.
//!
//! # How Observables Work
//!
//! 1. Reading with [`Observable::get`] inside an evaluation registers the
//!    observable as a dependency of that evaluation.
//!
//! 2. Writing with [`Observable::set`] sends `"beforeChange"` with the old
//!    value, commits, then sends `"change"` with the new value. Writes the
//!    equality comparer considers no-ops send nothing.
//!
//! 3. `"change"` bubbles into `"outdated"`, which is what dependent
//!    computeds listen to.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;

use super::context::{DependencyDetection, DependencyHandle, DependencyId};
use super::extend::Extender;
use super::subscribable::{
    Comparer, Subscribable, SubscribeOptions, ValueSource, BEFORE_CHANGE, CHANGE,
};
use super::subscription::Subscription;
use crate::error::NotifyReport;

struct ObservableInner<T: 'static> {
    subscribable: Subscribable<T>,
    value: RefCell<T>,
}

/// A reactive value holder.
///
/// Cloning yields another handle to the same value.
///
/// # Example
///
/// ```
/// use ripple_core::Observable;
///
/// let count = Observable::new(0);
/// count.set(5);
/// assert_eq!(count.get(), 5);
/// ```
pub struct Observable<T: Clone + PartialEq + 'static> {
    inner: Rc<ObservableInner<T>>,
}

impl<T: Clone + PartialEq + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + 'static> Observable<T> {
    /// Create an observable holding `value`.
    pub fn new(value: T) -> Self {
        let inner = Rc::new(ObservableInner {
            subscribable: Subscribable::new(),
            value: RefCell::new(value),
        });

        let comparer: Comparer<T> = Rc::new(|a: &T, b: &T| a == b);
        inner.subscribable.set_equality_comparer(Some(comparer));

        let current = {
            let weak = Rc::downgrade(&inner);
            Rc::new(move || weak.upgrade().map(|inner| inner.value.borrow().clone()))
        };
        inner.subscribable.set_value_source(ValueSource {
            latest: current.clone(),
            refresh: current,
        });

        Self { inner }
    }

    pub fn id(&self) -> DependencyId {
        self.inner.subscribable.id()
    }

    /// Read the value, registering a dependency in the active frame.
    pub fn get(&self) -> T {
        DependencyDetection::register_dependency(&self.inner.subscribable);
        self.peek()
    }

    /// Read the value without registering a dependency.
    pub fn peek(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Write a new value.
    pub fn set(&self, value: T) -> NotifyReport {
        let old = self.peek();
        if self.inner.subscribable.values_equal(&old, &value) {
            return NotifyReport::default();
        }
        let mut report = self.inner.subscribable.notify_subscribers(&old, BEFORE_CHANGE);
        *self.inner.value.borrow_mut() = value;
        report.merge(self.value_has_mutated());
        report
    }

    /// Write a value derived from the current one.
    pub fn update<F>(&self, f: F) -> NotifyReport
    where
        F: FnOnce(&T) -> T,
    {
        let next = {
            let current = self.inner.value.borrow();
            f(&current)
        };
        self.set(next)
    }

    /// Send `"change"` with the current value, whether or not it changed.
    /// Used after mutating a value in place through interior mutability.
    pub fn value_has_mutated(&self) -> NotifyReport {
        let current = self.peek();
        self.inner.subscribable.notify_subscribers(&current, CHANGE)
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription<T> {
        self.inner.subscribable.subscribe(callback)
    }

    pub fn subscribe_to(
        &self,
        event: &str,
        callback: impl Fn(&T) + 'static,
        options: SubscribeOptions,
    ) -> Subscription<T> {
        self.inner.subscribable.subscribe_to(event, callback, options)
    }

    pub fn extend(&self, extender: impl Extender<T>) -> &Self {
        self.inner.subscribable.extend(extender);
        self
    }

    pub fn get_subscriptions_count(&self) -> usize {
        self.inner.subscribable.get_subscriptions_count()
    }

    /// The underlying event channels.
    pub fn subscribable(&self) -> &Subscribable<T> {
        &self.inner.subscribable
    }

    /// Type-erased handle for [`DependencyDetection::register_any`].
    pub fn as_dependency(&self) -> DependencyHandle {
        DependencyHandle(Rc::new(self.inner.subscribable.clone()))
    }
}

impl<T: Clone + PartialEq + Debug + 'static> Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("id", &self.id())
            .field("value", &*self.inner.value.borrow())
            .field("subscribers", &self.get_subscriptions_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::context::Frame;
    use std::cell::Cell;

    #[test]
    fn observable_get_and_set() {
        let observable = Observable::new(1);
        assert_eq!(observable.get(), 1);
        observable.set(2);
        assert_eq!(observable.peek(), 2);
    }

    #[test]
    fn observable_update() {
        let observable = Observable::new(10);
        observable.update(|v| v * 3);
        assert_eq!(observable.peek(), 30);
    }

    #[test]
    fn set_sends_before_change_then_change() {
        let observable = Observable::new(1);
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let log = Rc::clone(&log);
            observable.subscribe_to(
                BEFORE_CHANGE,
                move |v| log.borrow_mut().push(format!("before:{v}")),
                SubscribeOptions::default(),
            );
        }
        {
            let log = Rc::clone(&log);
            observable.subscribe(move |v| log.borrow_mut().push(format!("change:{v}")));
        }

        let report = observable.set(2);
        assert_eq!(*log.borrow(), vec!["before:1", "change:2"]);
        assert_eq!(report.delivered, 2);
    }

    #[test]
    fn equal_writes_are_silent() {
        let observable = Observable::new(3);
        let hits = Rc::new(Cell::new(0));
        {
            let hits = Rc::clone(&hits);
            observable.subscribe(move |_| hits.set(hits.get() + 1));
        }
        observable.set(3);
        assert_eq!(hits.get(), 0);

        observable.value_has_mutated();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn get_registers_and_peek_does_not() {
        let observable = Observable::new(0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _scope = {
            let seen = Rc::clone(&seen);
            DependencyDetection::begin(
                Some(Frame::new(move |dep| seen.borrow_mut().push(dep.dependency_id()))),
                None,
            )
        };

        observable.peek();
        assert!(seen.borrow().is_empty());
        observable.get();
        observable.get();
        assert_eq!(*seen.borrow(), vec![observable.id()]);
    }

    #[test]
    fn listener_may_write_back() {
        let observable = Observable::new(0);
        {
            let target = observable.clone();
            observable.subscribe(move |v| {
                if *v < 3 {
                    target.set(v + 1);
                }
            });
        }
        observable.set(1);
        assert_eq!(observable.peek(), 3);
    }

    #[test]
    fn as_dependency_is_accepted_by_register_any() {
        let observable = Observable::new(0);
        let handle = observable.as_dependency();
        assert!(DependencyDetection::register_any(&handle).is_ok());
    }
}
