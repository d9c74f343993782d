use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ClassifiedError, ErrorKind};
use crate::metrics::StreamMetrics;
use crate::model::{ModelRef, ProviderId};

/// Uniform event produced by the streaming adapter.
///
/// Across one stream at most one event has `finish = true`, and it is always
/// the last one. Content events carry a non-empty `delta`, a non-empty
/// `structured` partial, or both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub provider: ProviderId,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
    pub finish: bool,
    /// `"{KIND}: {message}"` on a failed terminal event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Final metrics, present on the terminal event only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StreamMetrics>,
}

impl StreamEvent {
    pub(crate) fn content(
        model: &ModelRef,
        delta: Option<String>,
        structured: Option<serde_json::Value>,
    ) -> Self {
        Self {
            provider: model.provider.clone(),
            model: model.model.clone(),
            delta,
            structured,
            finish: false,
            error: None,
            error_kind: None,
            metrics: None,
        }
    }

    pub(crate) fn terminal(
        model: &ModelRef,
        error: Option<&ClassifiedError>,
        metrics: StreamMetrics,
    ) -> Self {
        Self {
            provider: model.provider.clone(),
            model: model.model.clone(),
            delta: None,
            structured: None,
            finish: true,
            error: error.map(ToString::to_string),
            error_kind: error.map(|e| e.kind),
            metrics: Some(metrics),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish
    }

    pub fn is_failure(&self) -> bool {
        self.finish && self.error.is_some()
    }
}

/// Lifecycle phase used to tag log records and to select retry policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Start,
    MidStream,
    Finalize,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::MidStream => "mid_stream",
            Phase::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the adapter reached its terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Completed,
    StartFailed,
    DecodeFailed,
    MidStreamError,
    Cancelled,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Completed => "completed",
            Termination::StartFailed => "start_failed",
            Termination::DecodeFailed => "decode_failed",
            Termination::MidStreamError => "mid_stream_error",
            Termination::Cancelled => "cancelled",
        }
    }
}
