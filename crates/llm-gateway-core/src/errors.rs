use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{ModelRef, ProviderId};
use crate::timeout::TimeoutElapsed;

/// Closed taxonomy every failure is mapped into before retry decisions and
/// terminal events are made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Auth,
    RateLimit,
    Timeout,
    Transient,
    NotFound,
    Unavailable,
    Validation,
    Unsupported,
    Cancelled,
    Internal,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 11] = [
        ErrorKind::Auth,
        ErrorKind::RateLimit,
        ErrorKind::Timeout,
        ErrorKind::Transient,
        ErrorKind::NotFound,
        ErrorKind::Unavailable,
        ErrorKind::Validation,
        ErrorKind::Unsupported,
        ErrorKind::Cancelled,
        ErrorKind::Internal,
        ErrorKind::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Auth => "AUTH",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Unsupported => "UNSUPPORTED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Kinds that are worth another attempt when nothing more specific is configured.
    pub fn is_retryable_by_default(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::Transient | ErrorKind::Unavailable
        )
    }

    pub fn default_retryable() -> HashSet<ErrorKind> {
        Self::ALL
            .into_iter()
            .filter(|kind| kind.is_retryable_by_default())
            .collect()
    }

    /// Fixed HTTP status table. Codes outside the table return `None` so the
    /// message heuristics still get a chance.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            400 | 422 => Some(ErrorKind::Validation),
            401 | 403 => Some(ErrorKind::Auth),
            404 => Some(ErrorKind::NotFound),
            408 | 504 => Some(ErrorKind::Timeout),
            429 => Some(ErrorKind::RateLimit),
            501 => Some(ErrorKind::Unsupported),
            503 => Some(ErrorKind::Unavailable),
            500..=599 => Some(ErrorKind::Transient),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown error kind: {0}")]
pub struct UnknownErrorKind(pub String);

impl FromStr for ErrorKind {
    type Err = UnknownErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownErrorKind(s.to_string()))
    }
}

/// A failure that has been mapped into [`ErrorKind`] and tagged with the
/// provider/model it happened against.
///
/// `Display` renders as `"{KIND}: {message}"`, which is also the text carried
/// by a failed terminal `StreamEvent`.
#[derive(Clone)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub provider: ProviderId,
    pub model: String,
    /// Default retryability of `kind`. Retry policies decide from their own
    /// `retryable_kinds` set.
    pub retryable: bool,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, model: &ModelRef) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: model.provider.clone(),
            model: model.model.clone(),
            retryable: kind.is_retryable_by_default(),
            cause: None,
        }
    }

    /// Classifies an arbitrary error. A `ClassifiedError` passes through as-is.
    pub fn from_error<E>(err: E, model: &ModelRef) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        if let Some(classified) = (&err as &(dyn StdError + 'static)).downcast_ref::<ClassifiedError>()
        {
            return classified.clone();
        }
        let kind = classify(&err);
        let message = err.to_string();
        Self {
            cause: Some(Arc::new(err)),
            ..Self::new(kind, message, model)
        }
    }

    pub fn cancelled(model: &ModelRef) -> Self {
        Self::new(ErrorKind::Cancelled, "stream cancelled by caller", model)
    }

    pub fn internal(message: impl Into<String>, model: &ModelRef) -> Self {
        Self::new(ErrorKind::Internal, message, model)
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Original error this classification was derived from, if any.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl fmt::Debug for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifiedError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("retryable", &self.retryable)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl StdError for ClassifiedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// Errors returned by a backend adapter before they are classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Backend returned an application-level failure (HTTP status, auth, etc.).
    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: ProviderId,
        message: String,
        status_code: Option<u16>,
    },
    /// Transport or stream I/O failed.
    #[error("transport error ({provider}): {message}")]
    Transport {
        provider: ProviderId,
        message: String,
    },
    /// Backend response shape or event sequencing was invalid.
    #[error("protocol error ({provider}): {message}")]
    Protocol {
        provider: ProviderId,
        message: String,
    },
}

impl ProviderError {
    pub fn provider(
        provider: impl Into<ProviderId>,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
        }
    }

    pub fn transport(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn protocol(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Protocol {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn provider_id(&self) -> &ProviderId {
        match self {
            Self::Provider { provider, .. }
            | Self::Transport { provider, .. }
            | Self::Protocol { provider, .. } => provider,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Provider { message, .. }
            | Self::Transport { message, .. }
            | Self::Protocol { message, .. } => message,
        }
    }

    /// HTTP-like status reported by the backend, when it had one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Provider { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

/// Top-level error for the gateway surface (builder, request validation,
/// output collection). The event stream itself never yields it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Invalid gateway/backend configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid request.
    #[error("validation error: {0}")]
    Validation(String),
    /// Requested provider is not registered.
    #[error("provider not found: {provider}")]
    ProviderNotFound { provider: ProviderId },
    /// A stream finished with a failed terminal event.
    #[error("stream failed ({kind}): {message}")]
    Stream { kind: ErrorKind, message: String },
    /// The event stream broke its own contract (for example no terminal event).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<ClassifiedError> for GatewayError {
    fn from(value: ClassifiedError) -> Self {
        GatewayError::Stream {
            kind: value.kind,
            message: value.message,
        }
    }
}

/// Maps any error to an [`ErrorKind`]. Never panics.
///
/// Checks, in order: an existing classification, an HTTP-like status anywhere
/// in the `source()` chain, typed timeout/connection signals, message
/// heuristics, backend error variant defaults.
pub fn classify(err: &(dyn StdError + 'static)) -> ErrorKind {
    if let Some(classified) = err.downcast_ref::<ClassifiedError>() {
        return classified.kind;
    }
    if let Some(kind) = status_code(err).and_then(ErrorKind::from_status) {
        return kind;
    }
    if let Some(kind) = chain(err).find_map(typed_signal) {
        return kind;
    }
    if let Some(kind) = classify_message(&err.to_string()) {
        return kind;
    }
    match chain(err).find_map(|e| e.downcast_ref::<ProviderError>()) {
        Some(ProviderError::Transport { .. }) => ErrorKind::Transient,
        Some(ProviderError::Protocol { .. }) => ErrorKind::Internal,
        _ => ErrorKind::Unknown,
    }
}

/// Case-insensitive substring heuristics applied when nothing typed matched.
pub fn classify_message(message: &str) -> Option<ErrorKind> {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if has(&["rate limit", "rate-limit", "too many requests"]) {
        return Some(ErrorKind::RateLimit);
    }
    if has(&["timed out", "timeout"]) {
        return Some(ErrorKind::Timeout);
    }
    if has(&["unsupported", "not supported"]) {
        return Some(ErrorKind::Unsupported);
    }
    if has(&["unauthorized", "missing api key", "invalid api key"]) {
        return Some(ErrorKind::Auth);
    }
    if has(&["cancelled", "canceled"]) {
        return Some(ErrorKind::Cancelled);
    }
    if has(&["connection reset", "connection refused", "broken pipe"]) {
        return Some(ErrorKind::Transient);
    }
    None
}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

fn status_code(err: &(dyn StdError + 'static)) -> Option<u16> {
    chain(err).find_map(|e| {
        if let Some(provider_err) = e.downcast_ref::<ProviderError>() {
            return provider_err.status_code();
        }
        if let Some(http_err) = e.downcast_ref::<reqwest::Error>() {
            return http_err.status().map(|s| s.as_u16());
        }
        None
    })
}

fn typed_signal(err: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    if err.is::<TimeoutElapsed>() || err.is::<tokio::time::error::Elapsed>() {
        return Some(ErrorKind::Timeout);
    }
    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        use std::io::ErrorKind as Io;
        return match io_err.kind() {
            Io::TimedOut => Some(ErrorKind::Timeout),
            Io::ConnectionReset
            | Io::ConnectionRefused
            | Io::ConnectionAborted
            | Io::BrokenPipe
            | Io::UnexpectedEof => Some(ErrorKind::Transient),
            _ => None,
        };
    }
    if let Some(http_err) = err.downcast_ref::<reqwest::Error>() {
        if http_err.is_timeout() {
            return Some(ErrorKind::Timeout);
        }
        if http_err.is_connect() {
            return Some(ErrorKind::Transient);
        }
    }
    None
}
