//! Error types for the reactive engine.
//!
//! Only three conditions are reported as errors. Failures inside
//! notification listeners are not errors: they are collected into a
//! [`NotifyReport`] so one broken listener never blocks delivery to the
//! others.

use std::any::Any;
use std::fmt;

/// Errors raised by the engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum ReactiveError {
    /// Something that is not a subscribable was registered as a dependency.
    #[error("only subscribable values can act as dependencies (got {type_name})")]
    InvalidDependency { type_name: String },

    /// A computed was built without a read function.
    #[error("a computed needs a read function that returns its value")]
    MissingEvaluator,

    /// A value was written to a computed that has no write function.
    #[error("cannot write a value to a computed unless it has a write function")]
    NotWritable,

    /// A configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ReactiveError>;

/// A listener or eager-change handler that panicked during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    /// Event channel being dispatched when the failure happened.
    pub event: String,
    /// Panic message, when it could be recovered.
    pub message: String,
}

impl ListenerFailure {
    pub(crate) fn from_panic(event: &str, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "listener panicked".to_string()
        };
        Self {
            event: event.to_string(),
            message,
        }
    }
}

impl fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener for '{}' failed: {}", self.event, self.message)
    }
}

/// Outcome of a single dispatch round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Number of callbacks that were invoked (including failed ones).
    pub delivered: usize,
    /// Callbacks that panicked. Dispatch continued past each of them.
    pub failures: Vec<ListenerFailure>,
}

impl NotifyReport {
    /// True when every invoked callback returned normally.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn merge(&mut self, other: NotifyReport) {
        self.delivered += other.delivered;
        self.failures.extend(other.failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        let failure = ListenerFailure::from_panic("change", Box::new("boom"));
        assert_eq!(failure.message, "boom");

        let failure = ListenerFailure::from_panic("change", Box::new(String::from("owned")));
        assert_eq!(failure.message, "owned");

        let failure = ListenerFailure::from_panic("outdated", Box::new(7_u32));
        assert_eq!(failure.message, "listener panicked");
        assert_eq!(failure.event, "outdated");
    }

    #[test]
    fn reports_merge() {
        let mut report = NotifyReport {
            delivered: 2,
            failures: Vec::new(),
        };
        report.merge(NotifyReport {
            delivered: 1,
            failures: vec![ListenerFailure {
                event: "change".into(),
                message: "x".into(),
            }],
        });
        assert_eq!(report.delivered, 3);
        assert!(!report.is_clean());
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            ReactiveError::NotWritable.to_string(),
            "cannot write a value to a computed unless it has a write function"
        );
        let err = ReactiveError::InvalidDependency {
            type_name: "u32".into(),
        };
        assert!(err.to_string().contains("u32"));
    }
}
