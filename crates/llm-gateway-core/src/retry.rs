use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::errors::{ClassifiedError, ErrorKind};
use crate::model::ModelRef;
use crate::stream::Phase;

/// One attempt outcome handed to [`RetryPolicy::on_attempt`] observers.
#[derive(Debug)]
pub struct AttemptReport<'a> {
    /// 1-based attempt number. The scheduled `delay` is
    /// `delay_for(attempt - 1)`, so `attempt - 1` is the 0-based attempt index.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Sleep scheduled before the next attempt; `None` when no retry follows.
    pub delay: Option<Duration>,
    /// Classified failure of this attempt; `None` on success.
    pub error: Option<&'a ClassifiedError>,
}

pub type AttemptObserver = Arc<dyn Fn(&AttemptReport<'_>) + Send + Sync>;

/// Builds the policy for a given lifecycle phase.
pub type RetryConfigFactory = Arc<dyn Fn(Phase) -> RetryPolicy + Send + Sync>;

/// Bounded retry with exponential backoff, driven by classified error kinds.
///
/// The delay before retry `i` (0-based) is `delay_base^i` seconds. The last
/// attempt never sleeps; its failure is returned.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    pub delay_base: f64,
    pub retryable_kinds: HashSet<ErrorKind>,
    pub on_attempt: Option<AttemptObserver>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 2.0)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay_base", &self.delay_base)
            .field("retryable_kinds", &self.retryable_kinds)
            .field("on_attempt", &self.on_attempt.is_some())
            .finish()
    }
}

pub(crate) struct RetryOutcome<T> {
    pub result: Result<T, ClassifiedError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay_base: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay_base,
            retryable_kinds: ErrorKind::default_retryable(),
            on_attempt: None,
        }
    }

    pub fn single_attempt() -> Self {
        Self::new(1, 1.0)
    }

    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = kinds.into_iter().collect();
        self
    }

    pub fn with_on_attempt<F>(mut self, observer: F) -> Self
    where
        F: Fn(&AttemptReport<'_>) + Send + Sync + 'static,
    {
        self.on_attempt = Some(Arc::new(observer));
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Sleep before retry `retry_index` (0-based).
    ///
    /// Saturates at `Duration::MAX` once the delay no longer fits; a
    /// non-positive delay is zero.
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        let exp = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let secs = self.delay_base.powi(exp);
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_kinds.contains(&kind)
    }

    /// Runs `op` until it succeeds, fails with a kind outside
    /// `retryable_kinds`, or attempts run out. Every failure is classified
    /// against `model` before it is inspected.
    pub async fn call<T, E, F, Fut>(&self, model: &ModelRef, op: F) -> Result<T, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        self.run(model, op).await.result
    }

    pub(crate) async fn run<T, E, F, Fut>(&self, model: &ModelRef, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        let max_attempts = self.attempts();
        let mut retries_done = 0u32;
        loop {
            let attempt = retries_done + 1;
            match op().await {
                Ok(value) => {
                    self.notify(attempt, max_attempts, None, None);
                    debug!(
                        event = "retry.attempt_succeeded",
                        domain = "stream",
                        provider = model.provider.as_str(),
                        model = model.model.as_str(),
                        attempt = attempt,
                        max_attempts = max_attempts
                    );
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    let classified = ClassifiedError::from_error(err, model);
                    let retryable = self.is_retryable(classified.kind);
                    let can_retry = retryable && attempt < max_attempts;
                    debug!(
                        event = "retry.attempt_failed",
                        domain = "stream",
                        provider = model.provider.as_str(),
                        model = model.model.as_str(),
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error_kind = classified.kind.as_str(),
                        retryable = retryable,
                        can_retry = can_retry,
                        error = %classified
                    );
                    if can_retry {
                        let backoff = self.delay_for(retries_done);
                        self.notify(attempt, max_attempts, Some(backoff), Some(&classified));
                        info!(
                            event = "retry.scheduled",
                            domain = "stream",
                            provider = model.provider.as_str(),
                            model = model.model.as_str(),
                            error_kind = classified.kind.as_str(),
                            attempt = attempt,
                            next_attempt = attempt + 1,
                            backoff_ms = backoff.as_millis() as u64
                        );
                        tokio::time::sleep(backoff).await;
                        retries_done += 1;
                        continue;
                    }
                    self.notify(attempt, max_attempts, None, Some(&classified));
                    return RetryOutcome {
                        result: Err(classified),
                        attempts: attempt,
                    };
                }
            }
        }
    }

    fn notify(
        &self,
        attempt: u32,
        max_attempts: u32,
        delay: Option<Duration>,
        error: Option<&ClassifiedError>,
    ) {
        if let Some(observer) = &self.on_attempt {
            observer(&AttemptReport {
                attempt,
                max_attempts,
                delay,
                error,
            });
        }
    }
}
