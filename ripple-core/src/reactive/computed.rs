//! Computed Implementation
//!
//! A Computed is a derived value. Its read function is re-run whenever one
//! of the subscribables it read last time reports a change, and the set of
//! dependencies is rediscovered on every run.
//!
//! # How Computeds Work
//!
//! 1. Evaluation opens a detection frame. Every subscribable read inside the
//!    read function lands in that frame and becomes a subscription to the
//!    dependency's `"outdated"` channel, owned by the computed.
//!
//! 2. Before the next evaluation all of those subscriptions are disposed and
//!    rebuilt from scratch, so branches that stopped being read stop being
//!    dependencies.
//!
//! 3. When a dependency reports `"outdated"`, an eager computed re-evaluates
//!    on the spot (or after its throttle delay). A lazy one only marks itself
//!    stale and forwards `"outdated"` to its own listeners; the next read
//!    pays for the evaluation.
//!
//! 4. If the new value differs from the old one (per the equality
//!    comparer), `"beforeChange"` and `"change"` are sent.
//!
//! # State
//!
//! ```text
//! Fresh -> Evaluating -> Clean <-> Stale
//!                 (any) -> Disposed
//! ```
//!
//! Reads while the computed is evaluating, or while its write function runs,
//! return the last value instead of re-entering evaluation.
//!
//! # Ownership
//!
//! Dependency subscriptions reach the computed through a weak link, so the
//! computed lives exactly as long as its handles (or the evaluation that
//! claimed it as a nested resource). Dropping the last handle releases its
//! dependency subscriptions the same way [`Computed::dispose`] does. A
//! computed kept only for its side effects must therefore be held somewhere.

use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug};
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::context::{Dependency, DependencyDetection, DependencyHandle, DependencyId, Frame};
use super::extend::Extender;
use super::subscribable::{
    Comparer, Subscribable, SubscribeOptions, ValueSource, BEFORE_CHANGE, CHANGE, OUTDATED,
};
use super::subscription::{Disposable, Repeater, Subscription, SubscriptionHandle};
use crate::config::ComputedConfig;
use crate::error::{ReactiveError, Result};
use crate::lifecycle::{DisposeCallback, NodeHandle, NodeLifecycle};
use crate::scheduler::{self, Scheduler, TimerId};

type ReadFn<T> = Rc<dyn Fn() -> T>;
type WriteFn<T> = Rc<dyn Fn(T)>;
type Predicate = Rc<dyn Fn() -> bool>;

/// Where a computed is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputedState {
    /// Never evaluated.
    Fresh,
    /// The read function is running.
    Evaluating,
    /// Has a value and no dependency changed since.
    Clean,
    /// Has a value but a dependency changed.
    Stale,
    /// Terminal.
    Disposed,
}

/// Builder for [`Computed`].
pub struct ComputedOptions<T: 'static> {
    read: Option<ReadFn<T>>,
    write: Option<WriteFn<T>>,
    defer_evaluation: bool,
    dispose_when: Option<Predicate>,
    node: Option<(Rc<dyn NodeLifecycle>, NodeHandle)>,
    manage_nested_repeaters: bool,
    eager: bool,
    throttle: Option<Duration>,
    /// `None` keeps the default `PartialEq` comparer.
    comparer: Option<Comparer<T>>,
    always_notify: bool,
    scheduler: Option<Rc<dyn Scheduler>>,
}

impl<T: Clone + PartialEq + 'static> Default for ComputedOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + PartialEq + 'static> ComputedOptions<T> {
    pub fn new() -> Self {
        Self {
            read: None,
            write: None,
            defer_evaluation: false,
            dispose_when: None,
            node: None,
            manage_nested_repeaters: false,
            eager: true,
            throttle: None,
            comparer: None,
            always_notify: false,
            scheduler: None,
        }
    }

    /// The function producing the value. Required.
    pub fn read(mut self, read: impl Fn() -> T + 'static) -> Self {
        self.read = Some(Rc::new(read));
        self
    }

    /// Read function evaluated against an owner value.
    pub fn read_with_owner<O: 'static>(self, owner: Rc<O>, read: impl Fn(&O) -> T + 'static) -> Self {
        self.read(move || read(&owner))
    }

    /// Makes the computed writable.
    pub fn write(mut self, write: impl Fn(T) + 'static) -> Self {
        self.write = Some(Rc::new(write));
        self
    }

    pub fn write_with_owner<O: 'static>(self, owner: Rc<O>, write: impl Fn(&O, T) + 'static) -> Self {
        self.write(move |value| write(&owner, value))
    }

    /// Skip the evaluation that would otherwise happen at construction.
    pub fn defer_evaluation(mut self, defer: bool) -> Self {
        self.defer_evaluation = defer;
        self
    }

    /// Dispose the computed once `predicate` returns true. Checked before
    /// every evaluation after the first.
    pub fn dispose_when(mut self, predicate: impl Fn() -> bool + 'static) -> Self {
        self.dispose_when = Some(Rc::new(predicate));
        self
    }

    /// Dispose the computed when `node` is released or detached.
    pub fn dispose_when_node_is_removed(mut self, lifecycle: Rc<dyn NodeLifecycle>, node: NodeHandle) -> Self {
        self.node = Some((lifecycle, node));
        self
    }

    /// Take ownership of resources created by the read function, disposing
    /// them before each re-evaluation.
    pub fn manage_nested_repeaters(mut self, manage: bool) -> Self {
        self.manage_nested_repeaters = manage;
        self
    }

    /// `false` makes the computed lazy unless something eager subscribes.
    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    /// Delay eager re-evaluation; a burst of changes causes one evaluation.
    /// A zero delay means no throttling.
    pub fn throttle_evaluation(mut self, delay: Duration) -> Self {
        self.throttle = (!delay.is_zero()).then_some(delay);
        self
    }

    pub fn equality_comparer(mut self, comparer: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.comparer = Some(Rc::new(comparer));
        self
    }

    /// Notify on every evaluation, even when the value compares equal.
    /// Takes precedence over [`ComputedOptions::equality_comparer`] while set.
    pub fn always_notify(mut self, always: bool) -> Self {
        self.always_notify = always;
        self
    }

    /// Scheduler for throttled evaluation. Defaults to the thread's current
    /// scheduler.
    pub fn scheduler(mut self, scheduler: Rc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Apply a declarative configuration. Only keys present in the document
    /// override earlier builder calls.
    pub fn config(mut self, config: &ComputedConfig) -> Self {
        if let Some(defer) = config.defer_evaluation {
            self.defer_evaluation = defer;
        }
        if let Some(manage) = config.manage_nested_repeaters {
            self.manage_nested_repeaters = manage;
        }
        if let Some(eager) = config.eager {
            self.eager = eager;
        }
        if config.throttle_evaluation.is_some() {
            self.throttle = config.throttle();
        }
        if let Some(always) = config.always_notify {
            self.always_notify = always;
        }
        self
    }

    pub fn build(self) -> Result<Computed<T>> {
        let read = self.read.clone().ok_or(ReactiveError::MissingEvaluator)?;
        Ok(Computed::construct(read, self))
    }
}

struct ComputedInner<T: 'static> {
    subscribable: Subscribable<T>,
    read: ReadFn<T>,
    write: Option<WriteFn<T>>,
    value: RefCell<Option<T>>,
    has_been_evaluated: Cell<bool>,
    is_being_evaluated: Cell<bool>,
    hold_evaluation: Cell<bool>,
    is_outdated: Cell<bool>,
    is_disposed: Cell<bool>,
    eager: bool,
    manage_nested_repeaters: bool,
    throttle: Option<Duration>,
    scheduler: Rc<dyn Scheduler>,
    throttle_timer: Cell<Option<TimerId>>,
    dependencies: RefCell<Vec<Rc<dyn SubscriptionHandle>>>,
    nested_repeaters: RefCell<Vec<Repeater>>,
    dispose_when: RefCell<Option<Predicate>>,
    node_watch: RefCell<Option<(Rc<dyn NodeLifecycle>, NodeHandle, DisposeCallback)>>,
    evaluation_count: Cell<u64>,
}

impl<T: 'static> ComputedInner<T> {
    fn dispose_dependencies(&self) {
        let dependencies = std::mem::take(&mut *self.dependencies.borrow_mut());
        for dependency in dependencies {
            dependency.dispose();
        }
    }

    fn dispose_nested_repeaters(&self) {
        let nested = std::mem::take(&mut *self.nested_repeaters.borrow_mut());
        for repeater in nested {
            repeater.dispose();
        }
    }

    /// Detach from everything this node reaches: its pending timer, its
    /// rate-limited notifications, its dependencies, its nested resources and
    /// its watched node.
    fn release(&self) {
        if let Some(timer) = self.throttle_timer.take() {
            self.scheduler.clear_timeout(timer);
        }
        self.subscribable.cancel_pending_notifications();
        self.dispose_dependencies();
        self.dispose_nested_repeaters();

        let watch = self.node_watch.borrow_mut().take();
        if let Some((lifecycle, node, callback)) = watch {
            lifecycle.remove_dispose_callback(node, &callback);
        }
    }
}

impl<T: 'static> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        if !self.is_disposed.replace(true) {
            self.release();
        }
    }
}

/// A derived, automatically re-evaluated value.
///
/// Cloning yields another handle to the same node.
///
/// # Example
///
/// ```
/// use ripple_core::{Computed, Observable};
///
/// let dep = Observable::new(1);
/// let doubled = {
///     let dep = dep.clone();
///     Computed::new(move || dep.get() * 2)
/// };
/// assert_eq!(doubled.get(), 2);
///
/// dep.set(5);
/// assert_eq!(doubled.peek(), 10);
/// ```
pub struct Computed<T: Clone + PartialEq + 'static> {
    inner: Rc<ComputedInner<T>>,
}

impl<T: Clone + PartialEq + 'static> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Resets the evaluation flags even if the read function panics.
struct EvaluationGuard<'a> {
    is_being_evaluated: &'a Cell<bool>,
    is_outdated: &'a Cell<bool>,
}

impl Drop for EvaluationGuard<'_> {
    fn drop(&mut self) {
        self.is_being_evaluated.set(false);
        self.is_outdated.set(false);
    }
}

/// Resets the hold flag even if the write function panics.
struct HoldGuard<'a>(&'a Cell<bool>);

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl<T: Clone + PartialEq + 'static> Computed<T> {
    /// Create an eager, read-only computed.
    pub fn new(read: impl Fn() -> T + 'static) -> Self {
        Self::construct(Rc::new(read), ComputedOptions::new())
    }

    /// Start building a computed with options.
    pub fn options() -> ComputedOptions<T> {
        ComputedOptions::new()
    }

    fn construct(read: ReadFn<T>, options: ComputedOptions<T>) -> Self {
        let scheduler = options.scheduler.clone().unwrap_or_else(scheduler::current);
        let computed = Self {
            inner: Rc::new(ComputedInner {
                subscribable: Subscribable::new(),
                read,
                write: options.write.clone(),
                value: RefCell::new(None),
                has_been_evaluated: Cell::new(false),
                is_being_evaluated: Cell::new(false),
                hold_evaluation: Cell::new(false),
                is_outdated: Cell::new(true),
                is_disposed: Cell::new(false),
                eager: options.eager,
                manage_nested_repeaters: options.manage_nested_repeaters,
                throttle: options.throttle,
                scheduler,
                throttle_timer: Cell::new(None),
                dependencies: RefCell::new(Vec::new()),
                nested_repeaters: RefCell::new(Vec::new()),
                dispose_when: RefCell::new(options.dispose_when.clone()),
                node_watch: RefCell::new(None),
                evaluation_count: Cell::new(0),
            }),
        };

        let comparer = match (options.always_notify, options.comparer) {
            (true, _) => None,
            (false, Some(comparer)) => Some(comparer),
            (false, None) => Some(Rc::new(|a: &T, b: &T| a == b) as Comparer<T>),
        };
        computed.inner.subscribable.set_equality_comparer(comparer);
        computed.install_value_source();
        computed.install_eager_propagation();

        DependencyDetection::register_repeater(Rc::new(computed.clone()));

        if computed.is_effectively_eager() && !options.defer_evaluation {
            computed.evaluate(true);
        }

        if let Some((lifecycle, node)) = options.node {
            if computed.is_active() {
                computed.watch_node(lifecycle, node);
            }
        }

        tracing::trace!(id = computed.id().raw(), eager = options.eager, "computed created");
        computed
    }

    fn downgrade(&self) -> Weak<ComputedInner<T>> {
        Rc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<ComputedInner<T>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn install_value_source(&self) {
        let latest = {
            let weak = self.downgrade();
            Rc::new(move || Self::upgrade(&weak).and_then(|computed| computed.try_value()))
        };
        let refresh = {
            let weak = self.downgrade();
            Rc::new(move || {
                let computed = Self::upgrade(&weak)?;
                if computed.inner.is_outdated.get() {
                    computed.evaluate(false);
                }
                computed.try_value()
            })
        };
        self.inner.subscribable.set_value_source(ValueSource { latest, refresh });
    }

    /// Flip every dependency subscription when this node's own eagerness
    /// changes, so laziness propagates down the chain.
    fn install_eager_propagation(&self) {
        let weak = self.downgrade();
        self.inner.subscribable.on_eager_change(move |is_eager| {
            let Some(computed) = Self::upgrade(&weak) else {
                return;
            };
            let eager = computed.inner.eager || is_eager;
            let dependencies: Vec<_> = computed.inner.dependencies.borrow().clone();
            for dependency in dependencies {
                dependency.set_eager(eager);
            }
        });
    }

    fn watch_node(&self, lifecycle: Rc<dyn NodeLifecycle>, node: NodeHandle) {
        let callback: DisposeCallback = {
            let weak = self.downgrade();
            Rc::new(move || {
                if let Some(computed) = Self::upgrade(&weak) {
                    tracing::debug!(id = computed.id().raw(), "watched node released");
                    computed.dispose();
                }
            })
        };
        lifecycle.add_dispose_callback(node, Rc::clone(&callback));

        let existing = self.inner.dispose_when.borrow_mut().take();
        let detached: Predicate = {
            let lifecycle = Rc::clone(&lifecycle);
            Rc::new(move || !lifecycle.is_attached(node) || existing.as_ref().is_some_and(|f| f()))
        };
        *self.inner.dispose_when.borrow_mut() = Some(detached);
        *self.inner.node_watch.borrow_mut() = Some((lifecycle, node, callback));
    }

    /// Identity of this node as a dependency.
    pub fn id(&self) -> DependencyId {
        self.inner.subscribable.id()
    }

    fn is_effectively_eager(&self) -> bool {
        self.inner.eager || self.inner.subscribable.is_eager()
    }

    fn try_value(&self) -> Option<T> {
        self.inner.value.borrow().clone()
    }

    fn should_dispose(&self) -> bool {
        let predicate = self.inner.dispose_when.borrow().clone();
        predicate.is_some_and(|f| f())
    }

    fn mark_outdated(&self) {
        self.inner.is_outdated.set(true);
        if self.inner.is_disposed.get() {
            return;
        }

        if !self.is_effectively_eager() {
            if let Some(latest) = self.try_value() {
                self.inner.subscribable.notify_subscribers(&latest, OUTDATED);
            }
            return;
        }

        if self.inner.subscribable.is_rate_limited() {
            self.inner.subscribable.notify_current(CHANGE);
            return;
        }

        match self.inner.throttle {
            Some(delay) => {
                if let Some(timer) = self.inner.throttle_timer.take() {
                    self.inner.scheduler.clear_timeout(timer);
                }
                let weak = self.downgrade();
                let timer = self.inner.scheduler.set_timeout(
                    delay,
                    Box::new(move || {
                        if let Some(computed) = Self::upgrade(&weak) {
                            computed.inner.throttle_timer.set(None);
                            computed.evaluate(true);
                        }
                    }),
                );
                self.inner.throttle_timer.set(Some(timer));
            }
            None => self.evaluate(true),
        }
    }

    fn add_dependency(&self, dependency: &dyn Dependency) {
        if dependency.dependency_id() == self.id() {
            return;
        }
        let on_outdated: Rc<dyn Fn()> = {
            let weak = self.downgrade();
            Rc::new(move || {
                if let Some(computed) = Self::upgrade(&weak) {
                    computed.mark_outdated();
                }
            })
        };
        let eager = self.is_effectively_eager();
        let subscription = DependencyDetection::preserve_repeaters(|| {
            dependency.subscribe_outdated(on_outdated, eager)
        });
        self.inner.dependencies.borrow_mut().push(subscription);
    }

    /// Run the read function, rebuilding the dependency set. With `notify`
    /// unset the new value is committed without notifying anyone.
    fn evaluate(&self, notify: bool) {
        let inner = &self.inner;
        if inner.hold_evaluation.get() || inner.is_being_evaluated.get() || inner.is_disposed.get() {
            return;
        }
        if inner.has_been_evaluated.get() && self.should_dispose() {
            self.dispose();
            return;
        }

        inner.dispose_dependencies();
        if inner.manage_nested_repeaters {
            inner.dispose_nested_repeaters();
        }

        inner.is_being_evaluated.set(true);
        let _guard = EvaluationGuard {
            is_being_evaluated: &inner.is_being_evaluated,
            is_outdated: &inner.is_outdated,
        };
        tracing::trace!(id = self.id().raw(), "evaluation started");

        let harvest = {
            let frame = {
                let computed = self.clone();
                Frame::new(move |dependency| computed.add_dependency(dependency))
            };
            let _scope = DependencyDetection::begin(Some(frame), None);
            let read = Rc::clone(&inner.read);
            DependencyDetection::collect_repeaters(|| read())
        };
        let new_value = harvest.value;

        inner.has_been_evaluated.set(true);
        inner.evaluation_count.set(inner.evaluation_count.get() + 1);
        if inner.manage_nested_repeaters {
            inner.nested_repeaters.borrow_mut().extend(harvest.repeaters);
        }
        tracing::trace!(
            id = self.id().raw(),
            dependencies = self.get_dependencies_count(),
            "evaluation finished"
        );

        let old_value = self.try_value();
        let changed = match &old_value {
            Some(old) => !inner.subscribable.values_equal(old, &new_value),
            None => true,
        };
        if !changed {
            return;
        }

        if notify {
            if let Some(old) = &old_value {
                inner.subscribable.notify_subscribers(old, BEFORE_CHANGE);
            }
        }
        *inner.value.borrow_mut() = Some(new_value.clone());
        if notify {
            inner.subscribable.notify_subscribers(&new_value, CHANGE);
        }
    }

    /// Read the value, evaluating first if stale, and register this node as
    /// a dependency of the active frame.
    ///
    /// # Panics
    ///
    /// If the computed has no value yet and cannot produce one (it was
    /// disposed before its first evaluation). Use [`Computed::try_get`] there.
    pub fn get(&self) -> T {
        self.try_get().expect("computed was disposed before producing a value")
    }

    pub fn try_get(&self) -> Option<T> {
        let value = self.try_peek();
        DependencyDetection::register_dependency(&self.inner.subscribable);
        value
    }

    /// Read without registering a dependency.
    ///
    /// # Panics
    ///
    /// Same as [`Computed::get`].
    pub fn peek(&self) -> T {
        self.try_peek().expect("computed was disposed before producing a value")
    }

    pub fn try_peek(&self) -> Option<T> {
        self.update();
        self.try_value()
    }

    /// Evaluate now if stale.
    pub fn update(&self) {
        if self.inner.is_outdated.get() {
            self.evaluate(true);
        }
    }

    /// Route `value` to the write function.
    pub fn write(&self, value: T) -> Result<()> {
        let write = self.inner.write.clone().ok_or(ReactiveError::NotWritable)?;
        {
            self.inner.hold_evaluation.set(true);
            let _hold = HoldGuard(&self.inner.hold_evaluation);
            write(value);
        }
        self.mark_outdated();
        Ok(())
    }

    pub fn has_write_function(&self) -> bool {
        self.inner.write.is_some()
    }

    /// Release every dependency subscription and owned resource. Later calls
    /// do nothing.
    pub fn dispose(&self) {
        if self.inner.is_disposed.replace(true) {
            return;
        }
        self.inner.release();
        tracing::debug!(id = self.id().raw(), "computed disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed.get()
    }

    /// True until the node has evaluated without reading anything, or has
    /// been disposed.
    pub fn is_active(&self) -> bool {
        !self.inner.is_disposed.get()
            && (!self.inner.has_been_evaluated.get() || self.get_dependencies_count() > 0)
    }

    pub fn get_dependencies_count(&self) -> usize {
        self.inner.dependencies.borrow().len()
    }

    /// Number of completed evaluations.
    pub fn evaluation_count(&self) -> u64 {
        self.inner.evaluation_count.get()
    }

    pub fn state(&self) -> ComputedState {
        let inner = &self.inner;
        if inner.is_disposed.get() {
            ComputedState::Disposed
        } else if inner.is_being_evaluated.get() {
            ComputedState::Evaluating
        } else if !inner.has_been_evaluated.get() {
            ComputedState::Fresh
        } else if inner.is_outdated.get() {
            ComputedState::Stale
        } else {
            ComputedState::Clean
        }
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

    /// The computed's own event channels.
    pub fn subscribable(&self) -> &Subscribable<T> {
        &self.inner.subscribable
    }

    /// Type-erased handle for [`DependencyDetection::register_any`].
    pub fn as_dependency(&self) -> DependencyHandle {
        DependencyHandle(Rc::new(self.inner.subscribable.clone()))
    }
}

impl<T: Clone + PartialEq + 'static> Disposable for Computed<T> {
    fn dispose(&self) {
        Computed::dispose(self);
    }

    fn is_disposed(&self) -> bool {
        Computed::is_disposed(self)
    }
}

impl<T: Clone + PartialEq + Debug + 'static> Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("value", &*self.inner.value.borrow())
            .field("dependencies", &self.get_dependencies_count())
            .finish()
    }
}
