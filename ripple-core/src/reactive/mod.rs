//! Reactive Primitives
//!
//! This module implements the dependency-tracking engine: observables,
//! computeds, and the publish/subscribe layer they share.
//!
//! # Concepts
//!
//! ## Subscribables
//!
//! A Subscribable owns named event channels (`"change"`, `"beforeChange"`,
//! `"outdated"`, or anything else) and delivers notifications to the
//! subscriptions attached to them, in order.
//!
//! ## Observables
//!
//! An Observable is a Subscribable holding one writable value.
//!
//! ## Computeds
//!
//! A Computed is a derived value. It re-runs its read function when any of
//! the subscribables read during the previous run changes. Eager computeds
//! re-run immediately; lazy ones mark themselves stale and wait for the next
//! read.
//!
//! # Implementation Notes
//!
//! Dependencies are never declared. While a computed evaluates, a
//! thread-local detection frame is active and every read of a subscribable
//! registers with it. The same mechanism hands resources created during an
//! evaluation (subscriptions, nested computeds) to their owner, which
//! disposes them before the next run.
//!
//! Everything here is single-threaded: nodes are `Rc`-based and `!Send`.

mod computed;
mod context;
mod extend;
mod observable;
mod subscribable;
mod subscription;

pub use computed::{Computed, ComputedOptions, ComputedState};
pub use context::{
    Dependency, DependencyDetection, DependencyHandle, DependencyId, DetectionScope, Frame,
    FrameCallback, Harvest, RepeaterHandler, RepeaterScope,
};
pub use extend::{Extender, NotifyAlways, RateLimit, RateLimitMethod};
pub use observable::Observable;
pub use subscribable::{
    Comparer, EventBubbling, NotifyValue, NotifyWrapper, SubscribeOptions, Subscribable,
    BEFORE_CHANGE, CHANGE, OUTDATED,
};
pub use subscription::{Disposable, Repeater, Subscription, SubscriptionHandle};
