//! Retry support: error classification for [`keen_retry`], plus the explicit
//! backoff state used by the dispatcher.

use std::time::Duration;

use keen_retry::RetryResult;
use reqwest::StatusCode;

use crate::async_utils::BoxedFuture;

/// On error, return a [`RetryResult::Fatal`] value.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if IsKnownTransient::is_known_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Export the macros within the crate as if they were normal symbols.
pub(crate) use {try_fatal, try_potentially_transient};

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Build an [`RetryResult::Transient`] value.
pub(crate) fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Transient { input: (), error }
}

/// Is this error a known transient error?
///
/// Errors are assumed to be permanent until they've been observed in the wild
/// and shown to go away on retry. Otherwise we'd spend a unit's whole backoff
/// budget on errors that will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if self.is_builder() {
            // A bad URL or header. Retrying won't fix it.
            false
        } else if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Connection resets, DNS hiccups, truncated bodies. `reqwest`
            // doesn't expose enough detail to tell these apart.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        // 529 is Anthropic's "overloaded".
        transient_failures.contains(self) || self.as_u16() == 529
    }
}

/// How many times to try a unit, and how long to back off between tries.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    max_attempts: u32,

    /// Delay before the first retry. Doubles for each retry after that.
    base_delay: Duration,
}

impl RetryPolicy {
    /// Create a new policy. `max_attempts` of 0 is treated as 1.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Start tracking retries for one unit.
    pub fn start(&self) -> RetryState {
        RetryState {
            policy: *self,
            attempts: 0,
        }
    }
}

/// Retry bookkeeping for a single unit.
#[derive(Clone, Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryState {
    /// Record that we're starting another attempt, and return its 1-based
    /// number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// How many attempts have been started so far?
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// After a transient failure, how long should we wait before trying
    /// again? Returns `None` once every attempt has been used.
    ///
    /// The `n`th retry waits `base_delay * 2^(n-1)`.
    pub fn next_delay(&self) -> Option<Duration> {
        if self.attempts == 0 || self.attempts >= self.policy.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempts - 1).unwrap_or(u32::MAX);
        Some(self.policy.base_delay.saturating_mul(factor))
    }
}

/// Something that can wait. Injected into the dispatcher so that tests can
/// observe backoff delays without real timers.
pub trait Sleeper: Send + Sync + 'static {
    /// Wait for `delay`.
    fn sleep(&self, delay: Duration) -> BoxedFuture<()>;
}

/// Sleep using the Tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, delay: Duration) -> BoxedFuture<()> {
        Box::pin(tokio::time::sleep(delay))
    }
}
