//! Gated retry with exponential backoff.
//!
//! Both rate-limited external dependencies (the inference provider and the
//! evolution reasoner) go through this one abstraction: exponential delay,
//! capped attempts, and a typed exhausted outcome instead of an error, so
//! call sites degrade gracefully rather than crash.

use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// Retry policy for one external dependency.
#[derive(Debug, Clone)]
pub struct RetryGate {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryGate {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Terminal result of a gated call.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Completed(T),
    /// Every attempt failed; the caller falls back rather than erroring.
    Exhausted {
        attempts: u32,
        last_error: anyhow::Error,
    },
}

impl<T> RetryOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            RetryOutcome::Completed(value) => Some(value),
            RetryOutcome::Exhausted { .. } => None,
        }
    }
}

impl RetryGate {
    /// Zero-delay gate for tests and scripted callers.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Run `op` until it succeeds or attempts are exhausted, sleeping an
    /// exponentially growing delay between attempts.
    pub fn run<T>(&self, label: &str, mut op: impl FnMut() -> Result<T>) -> RetryOutcome<T> {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match op() {
                Ok(value) => return RetryOutcome::Completed(value),
                Err(err) => {
                    warn!(label, attempt, attempts, err = %err, "gated call failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        std::thread::sleep(self.delay_for(attempt));
                    }
                }
            }
        }
        RetryOutcome::Exhausted {
            attempts,
            last_error: last_error.expect("at least one attempt ran"),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt - 1).min(16);
        (self.base_delay * factor).min(self.max_delay)
    }
}
