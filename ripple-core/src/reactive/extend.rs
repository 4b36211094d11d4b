//! Extenders
//!
//! Extenders modify a subscribable's notification behavior after it has been
//! built. Two are provided:
//!
//! - [`RateLimit`] coalesces bursts of `"change"` notifications into at most
//!   one per scheduling quantum.
//! - [`NotifyAlways`] turns off equality suppression.
//!
//! # Rate limiting
//!
//! Within a burst the first `"beforeChange"` is delivered right away (it
//! carries the pre-burst value) and later ones are dropped. `"change"`
//! notifications only update the pending value; when the scheduler fires,
//! the pending value is compared against the pre-burst value and a single
//! unthrottled `"change"` goes out if they differ. Owners that pass
//! [`NotifyValue::Current`] instead of a value (a rate-limited computed) are
//! read once, at flush time, so evaluation is paid once per flush rather than
//! once per burst element. Other events pass straight through.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde::Deserialize;

use super::subscribable::{
    NotifyValue, NotifyWrapper, Subscribable, SubscribableInner, BEFORE_CHANGE, CHANGE,
};
use crate::error::NotifyReport;
use crate::scheduler::{self, Scheduler, TimerId};

/// A behavior modifier applied through [`Subscribable::extend`].
pub trait Extender<T: 'static> {
    fn extend(&self, target: &Subscribable<T>);
}

/// Every write notifies, even when the value compares equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyAlways;

impl<T: 'static> Extender<T> for NotifyAlways {
    fn extend(&self, target: &Subscribable<T>) {
        target.set_equality_comparer(None);
    }
}

/// When a rate-limited flush happens relative to the burst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RateLimitMethod {
    /// Flush `timeout` after the first notification of a burst (throttle).
    #[default]
    NotifyAtFixedRate,
    /// Flush once no notification arrived for `timeout` (debounce).
    NotifyWhenChangesStop,
}

/// Rate-limiting extender.
#[derive(Clone)]
pub struct RateLimit {
    timeout: Duration,
    method: RateLimitMethod,
    scheduler: Option<Rc<dyn Scheduler>>,
}

impl RateLimit {
    pub fn new(timeout: Duration, method: RateLimitMethod) -> Self {
        Self {
            timeout,
            method,
            scheduler: None,
        }
    }

    pub fn throttle(timeout: Duration) -> Self {
        Self::new(timeout, RateLimitMethod::NotifyAtFixedRate)
    }

    pub fn debounce(timeout: Duration) -> Self {
        Self::new(timeout, RateLimitMethod::NotifyWhenChangesStop)
    }

    /// Flush on the next scheduler turn.
    pub fn immediate() -> Self {
        Self::throttle(Duration::ZERO)
    }

    /// Use `scheduler` instead of the thread's current one.
    pub fn with_scheduler(mut self, scheduler: Rc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn method(&self) -> RateLimitMethod {
        self.method
    }
}

impl std::fmt::Debug for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimit")
            .field("timeout", &self.timeout)
            .field("method", &self.method)
            .field("custom_scheduler", &self.scheduler.is_some())
            .finish()
    }
}

impl<T: Clone + 'static> Extender<T> for RateLimit {
    fn extend(&self, target: &Subscribable<T>) {
        let scheduler = self.scheduler.clone().unwrap_or_else(scheduler::current);
        let limiter = Rc::new_cyclic(|this| RateLimiter {
            this: this.clone(),
            target: target.downgrade(),
            timeout: self.timeout,
            method: self.method,
            scheduler,
            timer: Cell::new(None),
            burst: RefCell::new(Burst::default()),
        });
        target.set_notify_wrapper(Some(limiter as Rc<dyn NotifyWrapper<T>>));
    }
}

enum Pending<T> {
    Value(T),
    Current,
}

struct Burst<T> {
    /// Pre-burst value, once the burst has started.
    before: Option<Option<T>>,
    pending: Option<Pending<T>>,
}

impl<T> Default for Burst<T> {
    fn default() -> Self {
        Self {
            before: None,
            pending: None,
        }
    }
}

struct RateLimiter<T: 'static> {
    this: Weak<RateLimiter<T>>,
    target: Weak<SubscribableInner<T>>,
    timeout: Duration,
    method: RateLimitMethod,
    scheduler: Rc<dyn Scheduler>,
    timer: Cell<Option<TimerId>>,
    burst: RefCell<Burst<T>>,
}

impl<T: Clone + 'static> RateLimiter<T> {
    /// Open the burst if needed, delivering `"beforeChange"` once.
    fn begin_burst(&self, target: &Subscribable<T>, before: Option<T>) -> NotifyReport {
        if self.burst.borrow().before.is_some() {
            return NotifyReport::default();
        }
        self.burst.borrow_mut().before = Some(before.clone());
        match before {
            Some(value) => target.notify_unwrapped(&value, BEFORE_CHANGE),
            None => NotifyReport::default(),
        }
    }

    fn schedule_flush(&self) {
        match self.method {
            RateLimitMethod::NotifyAtFixedRate => {
                if self.timer.get().is_some() {
                    return;
                }
            }
            RateLimitMethod::NotifyWhenChangesStop => {
                if let Some(timer) = self.timer.take() {
                    self.scheduler.clear_timeout(timer);
                }
            }
        }
        let this = self.this.clone();
        let timer = self.scheduler.set_timeout(
            self.timeout,
            Box::new(move || {
                if let Some(limiter) = this.upgrade() {
                    limiter.flush();
                }
            }),
        );
        self.timer.set(Some(timer));
    }

    fn flush(&self) -> NotifyReport {
        self.timer.set(None);
        let Burst { before, pending } = std::mem::take(&mut *self.burst.borrow_mut());
        let Some(target) = self.target.upgrade().map(Subscribable::from_inner) else {
            return NotifyReport::default();
        };
        let value = match pending {
            Some(Pending::Value(value)) => Some(value),
            Some(Pending::Current) => target.refresh_current(),
            None => None,
        };
        let Some(value) = value else {
            return NotifyReport::default();
        };
        if let Some(Some(previous)) = &before {
            if target.values_equal(previous, &value) {
                tracing::trace!("rate-limited flush suppressed: value unchanged");
                return NotifyReport::default();
            }
        }
        target.notify_unwrapped(&value, CHANGE)
    }
}

impl<T: Clone + 'static> NotifyWrapper<T> for RateLimiter<T> {
    fn notify(&self, target: &Subscribable<T>, value: NotifyValue<'_, T>, event: &str) -> NotifyReport {
        match (event, value) {
            (BEFORE_CHANGE, NotifyValue::Value(value)) => self.begin_burst(target, Some(value.clone())),
            (CHANGE, value) => {
                let (report, pending) = match value {
                    NotifyValue::Value(value) => (NotifyReport::default(), Pending::Value(value.clone())),
                    NotifyValue::Current => {
                        (self.begin_burst(target, target.latest_current()), Pending::Current)
                    }
                };
                self.burst.borrow_mut().pending = Some(pending);
                self.schedule_flush();
                report
            }
            (_, NotifyValue::Value(value)) => target.notify_unwrapped(value, event),
            (_, NotifyValue::Current) => match target.latest_current() {
                Some(value) => target.notify_unwrapped(&value, event),
                None => NotifyReport::default(),
            },
        }
    }

    fn cancel(&self) {
        if let Some(timer) = self.timer.take() {
            self.scheduler.clear_timeout(timer);
        }
        *self.burst.borrow_mut() = Burst::default();
    }
}
