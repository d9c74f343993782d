//! Wall-clock bounds around the start phase.
//!
//! Two guards share the same contract: a bound of zero, a negative bound or a
//! non-finite bound disables the guard entirely.
//!
//! - [`with_timeout`] is preemptive. The guarded future races a tokio timer and
//!   is dropped when the timer wins, which releases whatever it had acquired.
//! - [`with_timeout_blocking`] is cooperative. A synchronous body always runs to
//!   completion; it may poll the [`Deadline`] it is handed, and the bound is
//!   checked once control returns.
//!
//! Neither guard touches process-wide state, so guards nest freely and work on
//! any thread.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// How the bound was enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardMode {
    Preemptive,
    Cooperative,
}

/// Raised when a guarded body did not finish within its bound.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("operation timed out after {seconds}s ({mode:?} guard)")]
pub struct TimeoutElapsed {
    pub seconds: f64,
    pub mode: GuardMode,
}

/// Named wall-clock bounds in seconds.
///
/// Only `start_secs` is enforced by the streaming adapter. The rest are
/// advisory values for backends and transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Bound on establishing a stream (one start attempt).
    #[serde(default = "default_start_secs")]
    pub start_secs: f64,
    /// Longest acceptable silence between chunks.
    #[serde(default = "default_mid_stream_idle_secs")]
    pub mid_stream_idle_secs: f64,
    /// Baseline bound for non-streaming requests.
    #[serde(default = "default_request_secs")]
    pub request_secs: f64,
    /// Optional cap on a whole stream.
    #[serde(default)]
    pub overall_secs: Option<f64>,
}

const fn default_start_secs() -> f64 {
    30.0
}

const fn default_mid_stream_idle_secs() -> f64 {
    60.0
}

const fn default_request_secs() -> f64 {
    120.0
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start_secs: default_start_secs(),
            mid_stream_idle_secs: default_mid_stream_idle_secs(),
            request_secs: default_request_secs(),
            overall_secs: None,
        }
    }
}

impl TimeoutConfig {
    pub fn with_start_secs(mut self, seconds: f64) -> Self {
        self.start_secs = seconds;
        self
    }

    /// Enforced start bound, `None` when disabled.
    pub fn start_bound(&self) -> Option<Duration> {
        bound(self.start_secs)
    }

    pub fn mid_stream_idle(&self) -> Option<Duration> {
        bound(self.mid_stream_idle_secs)
    }

    pub fn request(&self) -> Option<Duration> {
        bound(self.request_secs)
    }

    pub fn overall(&self) -> Option<Duration> {
        self.overall_secs.and_then(bound)
    }
}

fn bound(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}

/// Runs `body`, failing with [`TimeoutElapsed`] if it has not completed within
/// `seconds`. The body is dropped on expiry.
pub async fn with_timeout<F>(seconds: f64, body: F) -> Result<F::Output, TimeoutElapsed>
where
    F: Future,
{
    let Some(limit) = bound(seconds) else {
        return Ok(body.await);
    };
    tokio::time::timeout(limit, body).await.map_err(|_| {
        debug!(
            event = "timeout.elapsed",
            domain = "stream",
            mode = "preemptive",
            seconds = seconds
        );
        TimeoutElapsed {
            seconds,
            mode: GuardMode::Preemptive,
        }
    })
}

/// Deadline handed to a cooperative body so it can stop early on its own.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn after_secs(seconds: f64) -> Self {
        Self {
            started: Instant::now(),
            limit: bound(seconds),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            started: Instant::now(),
            limit: None,
        }
    }

    pub fn expired(&self) -> bool {
        self.limit
            .is_some_and(|limit| self.started.elapsed() >= limit)
    }

    /// Time left before expiry; `None` for an unbounded deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.limit
            .map(|limit| limit.saturating_sub(self.started.elapsed()))
    }
}

/// Cooperative guard for synchronous bodies. The body is never interrupted;
/// its output is discarded and [`TimeoutElapsed`] returned if the bound passed
/// while it ran.
pub fn with_timeout_blocking<T, F>(seconds: f64, body: F) -> Result<T, TimeoutElapsed>
where
    F: FnOnce(&Deadline) -> T,
{
    let deadline = Deadline::after_secs(seconds);
    let output = body(&deadline);
    if deadline.expired() {
        debug!(
            event = "timeout.elapsed",
            domain = "stream",
            mode = "cooperative",
            seconds = seconds
        );
        return Err(TimeoutElapsed {
            seconds,
            mode: GuardMode::Cooperative,
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorKind, classify};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_guard_never_fires() {
        for seconds in [0.0, -5.0, f64::NAN] {
            let result = with_timeout(seconds, async {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                7
            })
            .await;
            assert_eq!(result, Ok(7));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn preemptive_guard_fires_and_drops_body() {
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(dropped.clone());
        let result = with_timeout(1.5, async move {
            let _guard = guard;
            futures::future::pending::<()>().await
        })
        .await;

        let err = result.expect_err("should time out");
        assert_eq!(err.mode, GuardMode::Preemptive);
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(classify(&err), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn body_finishing_in_time_returns_output() {
        let result = with_timeout(5.0, async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            "ok"
        })
        .await;
        assert_eq!(result, Ok("ok"));
    }

    #[test]
    fn cooperative_guard_detects_overrun_after_return() {
        let result = with_timeout_blocking(0.001, |_deadline| {
            std::thread::sleep(Duration::from_millis(20));
            42
        });
        let err = result.expect_err("bound exceeded");
        assert_eq!(err.mode, GuardMode::Cooperative);
    }

    #[test]
    fn cooperative_guard_disabled_and_in_time() {
        let slow = with_timeout_blocking(0.0, |_| {
            std::thread::sleep(Duration::from_millis(5));
            1
        });
        assert_eq!(slow, Ok(1));

        let fast = with_timeout_blocking(60.0, |deadline| {
            assert!(!deadline.expired());
            assert!(deadline.remaining().is_some());
            2
        });
        assert_eq!(fast, Ok(2));
    }

    #[test]
    fn nested_cooperative_guards_are_independent() {
        let outer = with_timeout_blocking(60.0, |_| with_timeout_blocking(0.0, |_| "inner"));
        assert_eq!(outer, Ok(Ok("inner")));
    }

    #[test]
    fn timeout_config_exposes_only_positive_bounds() {
        let config = TimeoutConfig::default().with_start_secs(0.0);
        assert_eq!(config.start_bound(), None);
        assert_eq!(config.request(), Some(Duration::from_secs(120)));
        assert_eq!(config.overall(), None);

        let parsed: TimeoutConfig =
            serde_json::from_value(serde_json::json!({"start_secs": 2.5})).expect("parse");
        assert_eq!(parsed.start_bound(), Some(Duration::from_millis(2_500)));
        assert_eq!(parsed.mid_stream_idle_secs, 60.0);
    }
}
