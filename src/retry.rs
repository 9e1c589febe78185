use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::BoxError;
use crate::duration::{self, DurationList};

/// How to retry a single fallible operation.
///
/// Zero values mean "use the default": `max_attempts = 0` retries without an
/// attempt limit and a zero `timeout` becomes five minutes. A timeout of
/// thirty years or more (up to `Duration::MAX`) means no deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryHelper {
    pub max_attempts: u32,
    pub fast_fail: Vec<FastFail>,
    #[serde(with = "crate::duration::text")]
    pub pause: Duration,
    /// Backoff before the 2nd, 3rd, ... attempt; the last entry repeats.
    pub interval: DurationList,
    #[serde(with = "crate::duration::text")]
    pub timeout: Duration,
}

impl Default for RetryHelper {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            fast_fail: Vec::new(),
            pause: Duration::ZERO,
            interval: default_interval(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// Same horizon tokio uses for sleeps that would overflow `Instant`.
const NO_DEADLINE: Duration = Duration::from_secs(86400 * 365 * 30);

fn default_interval() -> DurationList {
    DurationList::from(vec![
        Duration::from_secs(10),
        Duration::from_secs(20),
        Duration::from_secs(30),
    ])
}

/// A regular expression that stops retrying when it matches an attempt's error.
#[derive(Debug, Clone)]
pub struct FastFail(Regex);

impl FastFail {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self)
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for FastFail {
    type Err = regex::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for FastFail {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FastFail {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Self::new(&pattern).map_err(serde::de::Error::custom)
    }
}

/// Why a retry loop gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    #[error("aborted after {0} attempt(s)")]
    MaxAttempts(u32),
    #[error("deadline exceeded")]
    Deadline,
    #[error("fast fail on {0:?}")]
    FastFail(String),
    #[error("cancelled")]
    Cancelled,
}

/// A retry loop that ended without success.
///
/// `last_error` is only `None` when the loop stopped before the first attempt.
#[derive(Error, Debug)]
#[error("{reason}, {}", describe_last(.last_error))]
pub struct RetryExhausted {
    pub reason: AbortReason,
    pub attempts: u32,
    #[source]
    pub last_error: Option<BoxError>,
}

fn describe_last(err: &Option<BoxError>) -> String {
    match err {
        Some(err) => err.to_string(),
        None => "no attempt made".to_string(),
    }
}

impl RetryExhausted {
    pub fn last_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.last_error.as_deref()
    }
}

impl RetryHelper {
    /// Replaces unset fields with their defaults.
    pub fn with_defaults(mut self) -> Self {
        if self.interval.is_empty() {
            self.interval = default_interval();
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        self
    }

    /// When the defaulted timeout runs out from now, or `None` if it never does.
    fn deadline(&self) -> Option<Instant> {
        let timeout = if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        };
        if timeout >= NO_DEADLINE {
            return None;
        }
        Instant::now().checked_add(timeout)
    }

    /// Returns a child of `ctx` that is also cancelled once the timeout
    /// elapses. Dropping the guard cancels the child and stops its timer.
    pub fn deadline_token(&self, ctx: &CancellationToken) -> (CancellationToken, DropGuard) {
        cancel_at(ctx, self.deadline())
    }

    /// Calls `attempt_fn` with attempt numbers 1, 2, ... until it succeeds or
    /// the loop is aborted.
    ///
    /// The token handed to `attempt_fn` is a child of `ctx` that is also
    /// cancelled once `timeout` has elapsed.
    pub async fn retry<F, Fut, T, E>(
        &self,
        ctx: &CancellationToken,
        mut attempt_fn: F,
    ) -> Result<T, RetryExhausted>
    where
        F: FnMut(CancellationToken, u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let policy = self.clone().with_defaults();
        let max_attempts = if policy.max_attempts == 0 {
            u32::MAX
        } else {
            policy.max_attempts
        };

        let deadline = policy.deadline();
        let (attempt_ctx, _stop_timer) = cancel_at(ctx, deadline);
        let expired = || deadline.is_some_and(|at| Instant::now() >= at);

        let mut attempts: u32 = 0;
        let mut last_error: Option<BoxError> = None;
        let stopped = |attempts: u32, last_error: Option<BoxError>| RetryExhausted {
            reason: if ctx.is_cancelled() {
                AbortReason::Cancelled
            } else {
                AbortReason::Deadline
            },
            attempts,
            last_error,
        };

        if !policy.pause.is_zero() && !wait(&attempt_ctx, policy.pause).await {
            return Err(stopped(attempts, last_error));
        }

        loop {
            if attempts >= max_attempts {
                return Err(RetryExhausted {
                    reason: AbortReason::MaxAttempts(attempts),
                    attempts,
                    last_error,
                });
            }
            if attempt_ctx.is_cancelled() || expired() {
                return Err(stopped(attempts, last_error));
            }
            if attempts > 0 {
                let index = (attempts as usize - 1).min(policy.interval.len() - 1);
                if !wait(&attempt_ctx, policy.interval[index]).await {
                    return Err(stopped(attempts, last_error));
                }
            }

            attempts += 1;
            let err: BoxError = match attempt_fn(attempt_ctx.clone(), attempts).await {
                Ok(value) => return Ok(value),
                Err(err) => err.into(),
            };

            let message = err.to_string();
            debug!(attempt = attempts, error = %message, "attempt failed");
            last_error = Some(err);

            if let Some(hint) = policy.fast_fail.iter().find(|hint| hint.is_match(&message)) {
                return Err(RetryExhausted {
                    reason: AbortReason::FastFail(hint.as_str().to_string()),
                    attempts,
                    last_error,
                });
            }
        }
    }
}

fn cancel_at(ctx: &CancellationToken, deadline: Option<Instant>) -> (CancellationToken, DropGuard) {
    let child = ctx.child_token();
    if let Some(deadline) = deadline {
        let timer = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep_until(deadline) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });
    }
    let guard = child.clone().drop_guard();
    (child, guard)
}

/// Sleeps for `d`; returns `false` if `ctx` was cancelled first.
async fn wait(ctx: &CancellationToken, d: Duration) -> bool {
    info!(duration = %duration::format(d), "waiting");
    tokio::select! {
        _ = ctx.cancelled() => false,
        _ = sleep(d) => true,
    }
}

impl fmt::Display for RetryHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempts={} pause={} interval={} timeout={}",
            self.max_attempts,
            duration::format(self.pause),
            self.interval,
            duration::format(self.timeout)
        )
    }
}
