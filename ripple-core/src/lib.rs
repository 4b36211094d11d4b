//! Ripple Core
//!
//! This crate provides an implicit dependency-tracking engine: a graph of
//! observable values and derived computed nodes that discovers which
//! computeds read which observables, re-evaluates computeds when their
//! inputs change, and notifies arbitrary listeners along the way.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: dependency detection, subscribables, observables, computeds
//!   and extenders
//! - `scheduler`: the host loop used by throttling and rate limiting
//! - `lifecycle`: hooks for tying a computed to an external node
//! - `config`: declarative option documents
//! - `error`: error and dispatch-report types
//!
//! # Example
//!
//! ```
//! use ripple_core::{Computed, Observable};
//!
//! let count = Observable::new(1);
//!
//! // A derived value; `count` is discovered as its dependency.
//! let doubled = {
//!     let count = count.clone();
//!     Computed::new(move || count.get() * 2)
//! };
//! assert_eq!(doubled.get(), 2);
//!
//! // Eager computeds re-evaluate as soon as a dependency changes.
//! count.set(5);
//! assert_eq!(doubled.peek(), 10);
//! ```
//!
//! # Lifetime and disposal
//!
//! A computed lives as long as its handles. Dropping the last one releases
//! its dependency subscriptions, so keep a handle to any computed that runs
//! only for its side effects.
//!
//! `Computed::get` and `Computed::peek` panic when the node was disposed
//! before it ever produced a value (for example a deferred computed disposed
//! before its first read). `Computed::try_get` and `Computed::try_peek`
//! return `None` in that case.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod reactive;
pub mod scheduler;

pub use error::{ListenerFailure, NotifyReport, ReactiveError, Result};
pub use reactive::{Computed, ComputedOptions, Observable, Subscribable, Subscription};
