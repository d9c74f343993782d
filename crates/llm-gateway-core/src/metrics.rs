use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Per-stream counters.
///
/// `time_to_first_content_ms` is set exactly when `emitted_count > 0`.
/// `total_duration_ms` is set on the terminal snapshot only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub emitted_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_first_content_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<f64>,
}

/// Tracks one adapter invocation from its start instant.
#[derive(Debug)]
pub(crate) struct MetricsRecorder {
    started: Instant,
    emitted_count: u64,
    first_content: Option<Duration>,
}

impl MetricsRecorder {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            emitted_count: 0,
            first_content: None,
        }
    }

    pub fn record_emission(&mut self) {
        self.emitted_count += 1;
        if self.first_content.is_none() {
            self.first_content = Some(self.started.elapsed());
        }
    }

    pub fn has_emitted(&self) -> bool {
        self.emitted_count > 0
    }

    /// Snapshot without a total duration, for mid-stream records.
    pub fn snapshot(&self) -> StreamMetrics {
        StreamMetrics {
            emitted_count: self.emitted_count,
            time_to_first_content_ms: self.first_content.map(as_millis),
            total_duration_ms: None,
        }
    }

    pub fn finish(&self) -> StreamMetrics {
        StreamMetrics {
            total_duration_ms: Some(as_millis(self.started.elapsed())),
            ..self.snapshot()
        }
    }
}

// A coarse clock can report zero elapsed; durations are floored at one
// nanosecond so totals stay positive and ordering with the first-content
// time is preserved.
fn as_millis(elapsed: Duration) -> f64 {
    elapsed.max(Duration::from_nanos(1)).as_secs_f64() * 1_000.0
}
