//! Configuration documents.
//!
//! Computed options and extenders can be described declaratively, which is
//! how binding layers usually hand them over. Keys use camelCase.
//!
//! ```
//! use ripple_core::config::{ComputedConfig, ExtenderConfig};
//!
//! let computed = ComputedConfig::from_json(r#"{"deferEvaluation": true, "throttleEvaluation": 20}"#).unwrap();
//! assert_eq!(computed.defer_evaluation, Some(true));
//!
//! let extenders = ExtenderConfig::from_json(r#"{"rateLimit": {"timeout": 500, "method": "notifyWhenChangesStop"}}"#).unwrap();
//! assert!(extenders.rate_limit().is_some());
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::reactive::{RateLimit, RateLimitMethod};

/// Declarative options for a computed.
///
/// Absent keys stay `None` and leave the corresponding builder setting alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComputedConfig {
    pub defer_evaluation: Option<bool>,
    pub manage_nested_repeaters: Option<bool>,
    pub eager: Option<bool>,
    /// Delay, in milliseconds, applied to eager re-evaluation. Zero disables
    /// throttling.
    pub throttle_evaluation: Option<u64>,
    pub always_notify: Option<bool>,
}

impl ComputedConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn throttle(&self) -> Option<Duration> {
        self.throttle_evaluation
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }
}

/// `"rateLimit"` value: a bare timeout or a detailed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RateLimitConfig {
    Timeout(u64),
    Detailed {
        timeout: u64,
        #[serde(default)]
        method: RateLimitMethod,
    },
}

/// `"notify"` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotifyMode {
    Always,
}

/// Named extenders to apply to a subscribable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtenderConfig {
    pub rate_limit: Option<RateLimitConfig>,
    pub notify: Option<NotifyMode>,
}

impl ExtenderConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The rate limiter described by `"rateLimit"`, on the thread's current
    /// scheduler.
    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.rate_limit.map(|config| match config {
            RateLimitConfig::Timeout(ms) => RateLimit::throttle(Duration::from_millis(ms)),
            RateLimitConfig::Detailed { timeout, method } => {
                RateLimit::new(Duration::from_millis(timeout), method)
            }
        })
    }

    pub fn notify_always(&self) -> bool {
        self.notify == Some(NotifyMode::Always)
    }
}
