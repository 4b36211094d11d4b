//! Subscribable Implementation
//!
//! The publish/subscribe primitive every reactive node is built on. A
//! subscribable owns named event channels, each an ordered list of
//! [`Subscription`]s, plus a counter of eager subscribers.
//!
//! # Dispatch
//!
//! `notify_subscribers` runs with dependency detection suppressed, iterates a
//! snapshot of the channel (subscriptions added during dispatch wait for the
//! next round, disposed ones are skipped) and isolates every listener: a
//! panicking listener is recorded in the returned [`NotifyReport`] and the
//! round carries on.
//!
//! # Event bubbling
//!
//! A notification on one channel also reaches the channels it bubbles into.
//! By default `"change"` bubbles into `"outdated"`, so anything waiting for
//! staleness hears about real changes too. Bubbled channels are dispatched
//! before the originating one, which lets dependent computeds refresh before
//! plain change listeners run.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::context::{Dependency, DependencyDetection, DependencyId};
use super::extend::Extender;
use super::subscription::{invoke_guarded, Subscription, SubscriptionHandle};
use crate::config::ExtenderConfig;
use crate::error::NotifyReport;

/// Default event: a new value is available.
pub const CHANGE: &str = "change";
/// Emitted with the old value just before a change is committed.
pub const BEFORE_CHANGE: &str = "beforeChange";
/// Lightweight "something changed, re-check" signal.
pub const OUTDATED: &str = "outdated";

/// Equality comparer used to suppress no-op notifications.
pub type Comparer<T> = Rc<dyn Fn(&T, &T) -> bool>;

/// Mapping from an event to the broader event it also satisfies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBubbling {
    map: IndexMap<String, String>,
}

impl EventBubbling {
    /// No bubbling at all.
    pub fn none() -> Self {
        Self {
            map: IndexMap::new(),
        }
    }

    /// Add (or replace) a bubbling edge.
    pub fn with(mut self, event: impl Into<String>, broader: impl Into<String>) -> Self {
        self.map.insert(event.into(), broader.into());
        self
    }

    pub fn broader(&self, event: &str) -> Option<&str> {
        self.map.get(event).map(String::as_str)
    }

    /// `event` followed by every event it bubbles into, without repeats.
    fn chain<'a>(&'a self, event: &'a str) -> SmallVec<[&'a str; 4]> {
        let mut chain: SmallVec<[&str; 4]> = SmallVec::new();
        let mut current = Some(event);
        while let Some(name) = current {
            if chain.contains(&name) {
                break;
            }
            chain.push(name);
            current = self.broader(name);
        }
        chain
    }
}

impl Default for EventBubbling {
    fn default() -> Self {
        Self::none().with(CHANGE, OUTDATED)
    }
}

/// Options accepted by [`Subscribable::subscribe_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Eager subscribers make the target (transitively) eager.
    pub eager: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { eager: true }
    }
}

/// Value handed to a [`NotifyWrapper`].
pub enum NotifyValue<'a, T> {
    Value(&'a T),
    /// Stand-in for "whatever the owner's current value is"; resolved lazily
    /// through the owner's value source.
    Current,
}

/// Interceptor installed by an extender around `notify_subscribers`.
pub trait NotifyWrapper<T: 'static> {
    fn notify(&self, target: &Subscribable<T>, value: NotifyValue<'_, T>, event: &str)
        -> NotifyReport;

    /// Drop any deferred work (pending timers).
    fn cancel(&self) {}
}

/// How the owner of a subscribable exposes its value to extenders.
pub(crate) struct ValueSource<T> {
    /// Last committed value, without evaluating anything.
    pub latest: Rc<dyn Fn() -> Option<T>>,
    /// Current value, evaluating silently first if it is stale.
    pub refresh: Rc<dyn Fn() -> Option<T>>,
}

impl<T> Clone for ValueSource<T> {
    fn clone(&self) -> Self {
        Self {
            latest: Rc::clone(&self.latest),
            refresh: Rc::clone(&self.refresh),
        }
    }
}

pub(crate) struct SubscribableInner<T: 'static> {
    id: Cell<Option<DependencyId>>,
    subscriptions: RefCell<IndexMap<String, Vec<Subscription<T>>>>,
    eager_count: Cell<usize>,
    eager_handlers: RefCell<Vec<Rc<dyn Fn(bool)>>>,
    bubbling: RefCell<Rc<EventBubbling>>,
    equality: RefCell<Option<Comparer<T>>>,
    wrapper: RefCell<Option<Rc<dyn NotifyWrapper<T>>>>,
    value_source: RefCell<Option<ValueSource<T>>>,
}

impl<T: 'static> SubscribableInner<T> {
    /// Adjust the eager counter, telling eager-change handlers if the
    /// "any subscriber eager" state flipped.
    pub(crate) fn slide_eager_subscription_count(&self, delta: isize) -> NotifyReport {
        let before = self.eager_count.get();
        let after = before.saturating_add_signed(delta);
        self.eager_count.set(after);

        let mut report = NotifyReport::default();
        if (before > 0) == (after > 0) {
            return report;
        }

        let is_eager = after > 0;
        tracing::debug!(eager = is_eager, "subscribable eagerness changed");
        let handlers: Vec<_> = self.eager_handlers.borrow().clone();
        for handler in handlers {
            report.delivered += 1;
            if let Some(failure) = invoke_guarded("eagerChange", || handler(is_eager)) {
                report.failures.push(failure);
            }
        }
        report
    }

    pub(crate) fn remove_subscription(&self, event: &str, subscription: &Subscription<T>) {
        let mut subscriptions = self.subscriptions.borrow_mut();
        let now_empty = match subscriptions.get_mut(event) {
            Some(list) => {
                list.retain(|s| !s.ptr_eq(subscription));
                list.is_empty()
            }
            None => false,
        };
        if now_empty {
            subscriptions.shift_remove(event);
        }
    }
}

/// A set of named event channels.
///
/// Cloning yields another handle to the same channels.
pub struct Subscribable<T: 'static> {
    inner: Rc<SubscribableInner<T>>,
}

impl<T: 'static> Clone for Subscribable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for Subscribable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Subscribable<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SubscribableInner {
                id: Cell::new(None),
                subscriptions: RefCell::new(IndexMap::new()),
                eager_count: Cell::new(0),
                eager_handlers: RefCell::new(Vec::new()),
                bubbling: RefCell::new(Rc::new(EventBubbling::default())),
                equality: RefCell::new(None),
                wrapper: RefCell::new(None),
                value_source: RefCell::new(None),
            }),
        }
    }

    /// Replace the event-bubbling map.
    pub fn with_bubbling(self, bubbling: EventBubbling) -> Self {
        *self.inner.bubbling.borrow_mut() = Rc::new(bubbling);
        self
    }

    /// Identity of this subscribable, assigned on first use.
    pub fn id(&self) -> DependencyId {
        match self.inner.id.get() {
            Some(id) => id,
            None => {
                let id = DependencyId::next();
                self.inner.id.set(Some(id));
                id
            }
        }
    }

    /// Subscribe eagerly to `"change"`.
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription<T> {
        self.subscribe_to(CHANGE, callback, SubscribeOptions::default())
    }

    /// Subscribe to `event`.
    ///
    /// The new subscription is announced to the repeater context, so an
    /// enclosing evaluation or listener can claim and later dispose it.
    pub fn subscribe_to(
        &self,
        event: &str,
        callback: impl Fn(&T) + 'static,
        options: SubscribeOptions,
    ) -> Subscription<T> {
        let subscription = Subscription::new(&self.inner, event, Rc::new(callback), options.eager);
        self.inner
            .subscriptions
            .borrow_mut()
            .entry(event.to_string())
            .or_default()
            .push(subscription.clone());
        subscription
    }

    /// Notify subscribers of `event`, going through any installed extender.
    pub fn notify_subscribers(&self, value: &T, event: &str) -> NotifyReport {
        let wrapper = self.inner.wrapper.borrow().clone();
        match wrapper {
            Some(wrapper) => wrapper.notify(self, NotifyValue::Value(value), event),
            None => self.notify_unwrapped(value, event),
        }
    }

    /// Notify subscribers of `event` with the owner's current value.
    pub(crate) fn notify_current(&self, event: &str) -> NotifyReport {
        let wrapper = self.inner.wrapper.borrow().clone();
        if let Some(wrapper) = wrapper {
            return wrapper.notify(self, NotifyValue::Current, event);
        }
        match self.refresh_current() {
            Some(value) => self.notify_unwrapped(&value, event),
            None => NotifyReport::default(),
        }
    }

    /// Dispatch to `event` (and the events it bubbles into) bypassing
    /// extenders.
    pub fn notify_unwrapped(&self, value: &T, event: &str) -> NotifyReport {
        if !self.has_subscriptions_for_event(event) {
            return NotifyReport::default();
        }
        let bubbling = Rc::clone(&self.inner.bubbling.borrow());

        DependencyDetection::ignore(|| {
            let mut report = NotifyReport::default();
            for channel in bubbling.chain(event).into_iter().rev() {
                let snapshot: Vec<Subscription<T>> = self
                    .inner
                    .subscriptions
                    .borrow()
                    .get(channel)
                    .cloned()
                    .unwrap_or_default();
                for subscription in snapshot {
                    if subscription.is_disposed() {
                        continue;
                    }
                    report.delivered += 1;
                    if let Some(failure) = subscription.deliver(value) {
                        report.failures.push(failure);
                    }
                }
            }
            report
        })
    }

    /// True if `event`, or any event it bubbles into, has subscribers.
    pub fn has_subscriptions_for_event(&self, event: &str) -> bool {
        let bubbling = Rc::clone(&self.inner.bubbling.borrow());
        let subscriptions = self.inner.subscriptions.borrow();
        let found = bubbling
            .chain(event)
            .iter()
            .any(|channel| subscriptions.get(*channel).is_some_and(|list| !list.is_empty()));
        found
    }

    /// Adjust the eager-subscriber counter.
    pub fn slide_eager_subscription_count(&self, delta: isize) -> NotifyReport {
        self.inner.slide_eager_subscription_count(delta)
    }

    /// Register a handler told when "any subscriber is eager" flips.
    pub fn on_eager_change(&self, handler: impl Fn(bool) + 'static) {
        self.inner.eager_handlers.borrow_mut().push(Rc::new(handler));
    }

    pub fn is_eager(&self) -> bool {
        self.inner.eager_count.get() > 0
    }

    pub fn eager_subscription_count(&self) -> usize {
        self.inner.eager_count.get()
    }

    /// Apply an extender (rate limiting, notify-always, ...).
    pub fn extend(&self, extender: impl Extender<T>) -> &Self {
        extender.extend(self);
        self
    }

    /// Apply the extenders described by a configuration document.
    pub fn extend_with_config(&self, config: &ExtenderConfig) -> &Self
    where
        T: Clone,
    {
        if config.notify_always() {
            self.extend(super::extend::NotifyAlways);
        }
        if let Some(rate_limit) = config.rate_limit() {
            self.extend(rate_limit);
        }
        self
    }

    /// Total subscriptions across all events.
    pub fn get_subscriptions_count(&self) -> usize {
        self.inner.subscriptions.borrow().values().map(Vec::len).sum()
    }

    /// Subscriptions on one event channel.
    pub fn subscriptions_count_for(&self, event: &str) -> usize {
        self.inner
            .subscriptions
            .borrow()
            .get(event)
            .map_or(0, Vec::len)
    }

    pub fn set_equality_comparer(&self, comparer: Option<Comparer<T>>) {
        *self.inner.equality.borrow_mut() = comparer;
    }

    /// True if the configured comparer reports `a` and `b` equal. Without a
    /// comparer every pair counts as different.
    pub fn values_equal(&self, a: &T, b: &T) -> bool {
        let comparer = self.inner.equality.borrow().clone();
        comparer.is_some_and(|eq| eq(a, b))
    }

    /// Install (or remove) the notification interceptor.
    pub fn set_notify_wrapper(&self, wrapper: Option<Rc<dyn NotifyWrapper<T>>>) {
        let previous = std::mem::replace(&mut *self.inner.wrapper.borrow_mut(), wrapper);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.inner.wrapper.borrow().is_some()
    }

    /// Cancel deferred notifications held by an extender.
    pub fn cancel_pending_notifications(&self) {
        let wrapper = self.inner.wrapper.borrow().clone();
        if let Some(wrapper) = wrapper {
            wrapper.cancel();
        }
    }

    pub(crate) fn set_value_source(&self, source: ValueSource<T>) {
        *self.inner.value_source.borrow_mut() = Some(source);
    }

    pub(crate) fn latest_current(&self) -> Option<T> {
        let source = self.inner.value_source.borrow().clone();
        source.and_then(|source| (source.latest)())
    }

    pub(crate) fn refresh_current(&self) -> Option<T> {
        let source = self.inner.value_source.borrow().clone();
        source.and_then(|source| (source.refresh)())
    }

    pub(crate) fn downgrade(&self) -> std::rc::Weak<SubscribableInner<T>> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Rc<SubscribableInner<T>>) -> Self {
        Self { inner }
    }
}

impl<T: 'static> Dependency for Subscribable<T> {
    fn dependency_id(&self) -> DependencyId {
        self.id()
    }

    fn subscribe_outdated(
        &self,
        on_outdated: Rc<dyn Fn()>,
        eager: bool,
    ) -> Rc<dyn SubscriptionHandle> {
        let subscription = self.subscribe_to(OUTDATED, move |_| on_outdated(), SubscribeOptions { eager });
        Rc::new(subscription)
    }
}

impl<T: 'static> fmt::Debug for Subscribable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribable")
            .field("id", &self.inner.id.get())
            .field("subscriptions", &self.get_subscriptions_count())
            .field("eager_count", &self.eager_subscription_count())
            .field("rate_limited", &self.is_rate_limited())
            .finish()
    }
}
