//! Phase-tagged stream records and process-level log setup.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::adapter::StartMeta;
use crate::config::parse_bool;
use crate::errors::ErrorKind;
use crate::metrics::StreamMetrics;
use crate::model::{ModelRef, ProviderId};
use crate::stream::{Phase, Termination};

/// Normalized record emitted at phase boundaries.
///
/// Absent optional fields are omitted rather than null-filled, so "no error"
/// stays distinguishable from an error of kind `UNKNOWN`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseRecord {
    pub stream_id: uuid::Uuid,
    pub provider: ProviderId,
    pub model: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    pub metrics: StreamMetrics,
}

/// Receiver for phase records. The adapter behaves identically with or
/// without one.
pub trait LogSink: Send + Sync {
    fn record(&self, record: &PhaseRecord);

    /// Whether per-chunk `mid_stream` records are wanted.
    fn verbose(&self) -> bool {
        false
    }
}

/// Sink that forwards records to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    verbose: bool,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl LogSink for TracingSink {
    fn record(&self, record: &PhaseRecord) {
        let event_name = match record.phase {
            Phase::Start => "stream.start",
            Phase::MidStream => "stream.mid_stream",
            Phase::Finalize => "stream.finalize",
        };
        let metrics = &record.metrics;
        let termination = record.termination.map(Termination::as_str);
        match (record.phase, record.error_kind) {
            (Phase::MidStream, _) => debug!(
                event = event_name,
                domain = "stream",
                stream_id = %record.stream_id,
                provider = record.provider.as_str(),
                model = record.model.as_str(),
                emitted_count = metrics.emitted_count,
                time_to_first_content_ms = ?metrics.time_to_first_content_ms
            ),
            (_, Some(kind)) => warn!(
                event = event_name,
                domain = "stream",
                stream_id = %record.stream_id,
                provider = record.provider.as_str(),
                model = record.model.as_str(),
                attempt = ?record.attempt,
                error_kind = kind.as_str(),
                termination = ?termination,
                request_id = ?record.request_id,
                emitted_count = metrics.emitted_count,
                time_to_first_content_ms = ?metrics.time_to_first_content_ms,
                total_duration_ms = ?metrics.total_duration_ms
            ),
            (_, None) => info!(
                event = event_name,
                domain = "stream",
                stream_id = %record.stream_id,
                provider = record.provider.as_str(),
                model = record.model.as_str(),
                attempt = ?record.attempt,
                termination = ?termination,
                request_id = ?record.request_id,
                response_id = ?record.response_id,
                emitted_count = metrics.emitted_count,
                time_to_first_content_ms = ?metrics.time_to_first_content_ms,
                total_duration_ms = ?metrics.total_duration_ms
            ),
        }
    }

    fn verbose(&self) -> bool {
        self.verbose
    }
}

/// Identity of one adapter invocation as it appears in records.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub stream_id: uuid::Uuid,
    pub model: ModelRef,
    request_id: Option<String>,
    response_id: Option<String>,
}

impl LogContext {
    pub fn new(model: ModelRef) -> Self {
        Self {
            stream_id: uuid::Uuid::new_v4(),
            model,
            request_id: None,
            response_id: None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    /// Picks `request_id`/`response_id` out of start meta. An id that is
    /// already set is never overwritten.
    pub fn attach_meta(&mut self, meta: &StartMeta) {
        if self.request_id.is_none() {
            self.request_id = meta_id(meta, "request_id");
        }
        if self.response_id.is_none() {
            self.response_id = meta_id(meta, "response_id");
        }
    }

    pub fn record(
        &self,
        phase: Phase,
        attempt: Option<u32>,
        error_kind: Option<ErrorKind>,
        termination: Option<Termination>,
        metrics: StreamMetrics,
    ) -> PhaseRecord {
        PhaseRecord {
            stream_id: self.stream_id,
            provider: self.model.provider.clone(),
            model: self.model.model.clone(),
            phase,
            attempt,
            error_kind,
            termination,
            request_id: self.request_id.clone(),
            response_id: self.response_id.clone(),
            metrics,
        }
    }
}

fn meta_id(meta: &StartMeta, key: &str) -> Option<String> {
    match meta.get(key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

static INIT: OnceCell<()> = OnceCell::new();

/// Process-level log settings read by [`init_observability`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// `GATEWAY_OBSERVABILITY_ENABLED`; unparseable values keep logging on.
    pub enabled: bool,
    /// `GATEWAY_LOG_LEVEL`, falling back to `RUST_LOG`.
    pub filter: Option<String>,
    /// `GATEWAY_JSON_LOG_PATH`; JSONL goes there instead of stdout.
    pub json_log_path: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: None,
            json_log_path: None,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            enabled: var("GATEWAY_OBSERVABILITY_ENABLED")
                .and_then(|raw| parse_bool(&raw))
                .unwrap_or(true),
            filter: var("GATEWAY_LOG_LEVEL").or_else(|| var("RUST_LOG")),
            json_log_path: var("GATEWAY_JSON_LOG_PATH").map(PathBuf::from),
        }
    }

    /// Invalid filters fall back to `info`.
    fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        self.filter
            .as_deref()
            .and_then(|raw| tracing_subscriber::EnvFilter::try_new(raw).ok())
            .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"))
    }

    /// Directory and file name for the JSONL appender.
    fn json_target(&self) -> Option<(PathBuf, String)> {
        let path = self.json_log_path.as_ref()?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(DEFAULT_JSON_LOG_FILE)
            .to_string();
        Some((dir, file_name))
    }
}

const DEFAULT_JSON_LOG_FILE: &str = "gateway.logs.jsonl";

/// Installs a global `tracing` subscriber once per process from
/// [`LogSettings::from_env`]. Meant for binaries; the library never calls it.
pub fn init_observability() {
    init_observability_with(LogSettings::from_env());
}

/// Same as [`init_observability`] with explicit settings. Only the first call
/// in a process has any effect.
pub fn init_observability_with(settings: LogSettings) {
    INIT.get_or_init(|| {
        if !settings.enabled {
            return;
        }
        let env_filter = settings.env_filter();
        let installed = if let Some((dir, file_name)) = settings.json_target() {
            if let Err(err) = std::fs::create_dir_all(&dir) {
                warn!(
                    event = "observability.log_dir_failed",
                    domain = "observability",
                    dir = %dir.display(),
                    error = %err,
                );
            }
            let writer = tracing_appender::rolling::never(&dir, &file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init()
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stdout);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init()
        };
        if installed.is_ok() {
            debug!(
                event = "observability.initialized",
                domain = "observability",
                json = settings.json_log_path.is_some(),
            );
        }
    });
}
