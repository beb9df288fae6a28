//! Bounded exponential backoff and run cancellation.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProviderError;

/// How often a capability call is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds; doubles afterwards.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never waits.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Run `op`, retrying transient failures with backoff.
    ///
    /// Permanent failures return immediately. Cancellation is checked before
    /// every attempt and interrupts the waits.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts run out, or
    /// [`ProviderError::Cancelled`].
    pub fn run<T>(
        &self,
        label: &str,
        cancel: &CancelToken,
        mut op: impl FnMut() -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            cancel.check()?;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.delay_after(attempt);
                    debug!(%label, attempt, ?delay, "retrying after: {e}");
                    if !cancel.sleep(delay) {
                        return Err(ProviderError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(%label, attempts, "giving up: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[derive(Debug)]
struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
    deadline: Option<Instant>,
}

/// Shared cancellation flag with an optional deadline.
///
/// Clones observe the same state. Calls already in flight are not interrupted;
/// their results are discarded once the token trips.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that only trips when [`CancelToken::cancel`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A token that also trips at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    /// A token that also trips after `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Instant::now().checked_add(timeout))
    }

    fn build(deadline: Option<Instant>) -> Self {
        Self {
            state: Arc::new(CancelState {
                cancelled: Mutex::new(false),
                wake: Condvar::new(),
                deadline,
            }),
        }
    }

    /// Trip the token and wake any sleeper.
    pub fn cancel(&self) {
        let mut flag = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *flag = true;
        self.state.wake.notify_all();
    }

    /// Whether the token was cancelled or its deadline has passed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        let flag = *self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        flag || self.deadline_passed()
    }

    fn deadline_passed(&self) -> bool {
        self.state
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// `Err(Cancelled)` once the token has tripped.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Cancelled`] if cancelled.
    pub fn check(&self) -> Result<(), ProviderError> {
        if self.is_cancelled() {
            Err(ProviderError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` if cancelled.
    #[must_use]
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now().checked_add(duration);
        let mut flag = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if *flag || self.deadline_passed() {
                return false;
            }
            let now = Instant::now();
            let wake_at = match (until, self.state.deadline) {
                (Some(u), Some(d)) => u.min(d),
                (Some(u), None) => u,
                (None, Some(d)) => d,
                (None, None) => now + Duration::from_secs(3600),
            };
            if until.is_some_and(|u| now >= u) {
                return true;
            }
            let (guard, _) = self
                .state
                .wake
                .wait_timeout(flag, wake_at.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner);
            flag = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(4), Duration::from_millis(800));
        assert_eq!(policy.delay_after(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_after(60), Duration::from_millis(1_000));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let out = fast(3).run("detect", &CancelToken::new(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(ProviderError::Transient("503".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(out, Ok(7));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn attempts_are_bounded() {
        let calls = Cell::new(0);
        let out: Result<(), _> = fast(2).run("edit", &CancelToken::new(), || {
            calls.set(calls.get() + 1);
            Err(ProviderError::Transient("timeout".into()))
        });
        assert_eq!(out, Err(ProviderError::Transient("timeout".into())));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let out: Result<(), _> = fast(5).run("edit", &CancelToken::new(), || {
            calls.set(calls.get() + 1);
            Err(ProviderError::Permanent("bad image".into()))
        });
        assert!(out.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn cancelled_token_skips_the_call() {
        let token = CancelToken::new();
        token.cancel();
        let calls = Cell::new(0);
        let out: Result<(), _> = fast(3).run("verify", &token, || {
            calls.set(calls.get() + 1);
            Ok(())
        });
        assert_eq!(out, Err(ProviderError::Cancelled));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn expired_deadline_counts_as_cancelled() {
        let token = CancelToken::with_deadline(Instant::now());
        assert!(token.is_cancelled());
        assert!(!token.sleep(Duration::from_secs(5)));
    }

    #[test]
    fn cancel_wakes_a_sleeper() {
        let token = CancelToken::new();
        let sleeper = token.clone();
        let handle = std::thread::spawn(move || sleeper.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn short_sleep_completes() {
        assert!(CancelToken::new().sleep(Duration::from_millis(1)));
        assert!(CancelToken::with_timeout(Duration::from_secs(60)).sleep(Duration::ZERO));
    }
}
