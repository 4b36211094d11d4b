//! Subscriptions: the edges of the dependency graph.
//!
//! A [`Subscription`] binds one callback to one (subscribable, event) pair.
//! It keeps a non-owning link back to its target and exclusively owns the
//! *nested repeaters* created while its callback ran. Those are disposed
//! before every re-delivery and when the subscription itself is disposed.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use super::context::DependencyDetection;
use super::subscribable::SubscribableInner;
use crate::error::{ListenerFailure, NotifyReport};

/// A resource that can be torn down.
pub trait Disposable {
    /// Release the resource. Calling it again has no further effect.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// Any disposable resource whose creation inside an evaluation or a
/// listener should be tracked by that enclosing owner.
pub type Repeater = Rc<dyn Disposable>;

/// Type-erased view of a subscription, held by computeds on their
/// dependencies (whose value types they do not know).
pub trait SubscriptionHandle: Disposable {
    /// Switch the edge between eager and lazy mode.
    fn set_eager(&self, eager: bool) -> NotifyReport;

    fn is_eager(&self) -> bool;
}

/// Run one listener, turning a panic into a [`ListenerFailure`].
pub(crate) fn invoke_guarded(event: &str, f: impl FnOnce()) -> Option<ListenerFailure> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => None,
        Err(payload) => {
            let failure = ListenerFailure::from_panic(event, payload);
            tracing::warn!(event, message = %failure.message, "listener failed; continuing dispatch");
            Some(failure)
        }
    }
}

pub(crate) struct SubscriptionInner<T: 'static> {
    id: u64,
    target: Weak<SubscribableInner<T>>,
    event: String,
    callback: Rc<dyn Fn(&T)>,
    disposed: Cell<bool>,
    eager: Cell<bool>,
    nested: RefCell<Vec<Repeater>>,
    eager_handlers: RefCell<Vec<Rc<dyn Fn(bool)>>>,
}

/// One callback attached to one event channel of a subscribable.
///
/// Cloning yields another handle to the same subscription.
pub struct Subscription<T: 'static> {
    inner: Rc<SubscriptionInner<T>>,
}

impl<T: 'static> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Subscription<T> {
    /// Create a subscription on `target`. The caller is responsible for
    /// inserting it into the target's channel list.
    pub(crate) fn new(
        target: &Rc<SubscribableInner<T>>,
        event: &str,
        callback: Rc<dyn Fn(&T)>,
        eager: bool,
    ) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let subscription = Self {
            inner: Rc::new(SubscriptionInner {
                id: COUNTER.fetch_add(1, Ordering::Relaxed),
                target: Rc::downgrade(target),
                event: event.to_string(),
                callback,
                disposed: Cell::new(false),
                eager: Cell::new(false),
                nested: RefCell::new(Vec::new()),
                eager_handlers: RefCell::new(Vec::new()),
            }),
        };

        DependencyDetection::register_repeater(Rc::new(subscription.clone()));

        if eager {
            subscription.inner.eager.set(true);
            target.slide_eager_subscription_count(1);
        }
        subscription
    }

    /// Event channel this subscription listens on.
    pub fn event(&self) -> &str {
        &self.inner.event
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    pub fn is_eager(&self) -> bool {
        self.inner.eager.get()
    }

    /// Change this subscription's eager mode.
    ///
    /// Adjusts the target's eager counter and then tells this subscription's
    /// own eager-change handlers. Handler panics are collected, not raised.
    pub fn set_eager(&self, eager: bool) -> NotifyReport {
        if self.inner.eager.get() == eager || (eager && self.is_disposed()) {
            return NotifyReport::default();
        }
        self.inner.eager.set(eager);

        let mut report = NotifyReport::default();
        if let Some(target) = self.inner.target.upgrade() {
            let delta = if eager { 1 } else { -1 };
            report.merge(target.slide_eager_subscription_count(delta));
        }

        let handlers: Vec<_> = self.inner.eager_handlers.borrow().clone();
        for handler in handlers {
            report.delivered += 1;
            if let Some(failure) = invoke_guarded("eagerChange", || handler(eager)) {
                report.failures.push(failure);
            }
        }
        report
    }

    /// Register a handler told whenever this subscription's eager mode flips.
    pub fn on_eager_change(&self, handler: impl Fn(bool) + 'static) {
        self.inner.eager_handlers.borrow_mut().push(Rc::new(handler));
    }

    /// Number of resources currently owned by this subscription.
    pub fn nested_repeater_count(&self) -> usize {
        self.inner.nested.borrow().len()
    }

    /// Dispose every nested repeater claimed during earlier deliveries.
    pub fn dispose_nested_repeaters(&self) {
        let nested = std::mem::take(&mut *self.inner.nested.borrow_mut());
        for repeater in nested {
            repeater.dispose();
        }
    }

    /// Deliver `value` to the callback, claiming whatever it creates.
    pub(crate) fn deliver(&self, value: &T) -> Option<ListenerFailure> {
        self.dispose_nested_repeaters();

        let callback = Rc::clone(&self.inner.callback);
        let harvest = DependencyDetection::collect_repeaters(|| {
            invoke_guarded(&self.inner.event, || callback(value))
        });

        if self.is_disposed() {
            // Disposed from inside its own callback.
            for repeater in harvest.repeaters {
                repeater.dispose();
            }
        } else {
            self.inner.nested.borrow_mut().extend(harvest.repeaters);
        }
        harvest.value
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Tear the subscription down: stop its eager contribution, dispose its
    /// nested repeaters and detach it from the target.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        let target = self.inner.target.upgrade();

        if self.inner.eager.replace(false) {
            if let Some(target) = &target {
                target.slide_eager_subscription_count(-1);
            }
        }

        self.dispose_nested_repeaters();

        if let Some(target) = &target {
            target.remove_subscription(&self.inner.event, self);
        }
        tracing::trace!(subscription = self.inner.id, event = %self.inner.event, "subscription disposed");
    }
}

impl<T: 'static> Disposable for Subscription<T> {
    fn dispose(&self) {
        Subscription::dispose(self);
    }

    fn is_disposed(&self) -> bool {
        Subscription::is_disposed(self)
    }
}

impl<T: 'static> SubscriptionHandle for Subscription<T> {
    fn set_eager(&self, eager: bool) -> NotifyReport {
        Subscription::set_eager(self, eager)
    }

    fn is_eager(&self) -> bool {
        Subscription::is_eager(self)
    }
}

impl<T: 'static> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("event", &self.inner.event)
            .field("eager", &self.is_eager())
            .field("disposed", &self.is_disposed())
            .field("nested_repeaters", &self.nested_repeater_count())
            .finish()
    }
}
