//! Event loop configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Environment variables
//!
//! - `RTD_AGED_CALLBACK_MS` - warn when one dispatch exceeds this
//! - `RTD_MAX_POLL_WAIT_MS` - upper bound on one poll sleep

use std::str::FromStr;
use std::time::Duration;

use crate::error::{EventError, EventResult};
use crate::timeval::TimeVal;

/// Get an environment variable parsed as `T`, or the default.
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

mod defaults {
    pub const AGED_CALLBACK_MS: u64 = 500;
    pub const MAX_POLL_WAIT_MS: u64 = 60_000;
}

/// Tunables for one [`EventLoop`](crate::event_loop::EventLoop).
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// One callback dispatch exceeding this is logged as aged.
    pub aged_callback: Duration,
    /// The loop never sleeps in `poll(2)` longer than this, even with
    /// no timer pending, so teardown and fd registration stay prompt.
    pub max_poll_wait: TimeVal,
}

impl EventLoopConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> EventLoopConfig {
        EventLoopConfig {
            aged_callback: Duration::from_millis(env_get(
                "RTD_AGED_CALLBACK_MS",
                defaults::AGED_CALLBACK_MS,
            )),
            max_poll_wait: TimeVal::from_millis(env_get(
                "RTD_MAX_POLL_WAIT_MS",
                defaults::MAX_POLL_WAIT_MS,
            ) as i64),
        }
    }

    pub fn aged_callback(mut self, d: Duration) -> Self {
        self.aged_callback = d;
        self
    }

    pub fn max_poll_wait(mut self, t: TimeVal) -> Self {
        self.max_poll_wait = t;
        self
    }

    pub fn validate(&self) -> EventResult<()> {
        if self.max_poll_wait <= TimeVal::ZERO {
            return Err(EventError::InvalidConfig(
                "max_poll_wait must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EventLoopConfig::from_env();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validate() {
        let config = EventLoopConfig::from_env().max_poll_wait(TimeVal::ZERO);
        assert!(config.validate().is_err());

        let config = EventLoopConfig::from_env()
            .aged_callback(Duration::from_millis(10))
            .max_poll_wait(TimeVal::from_secs(1));
        assert!(config.validate().is_ok());
        assert_eq!(config.aged_callback, Duration::from_millis(10));
    }
}
