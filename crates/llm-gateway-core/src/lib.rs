//! Streaming normalization and resilience engine for multi-backend text
//! generation.
//!
//! Backends hand out opaque native streams; the [`StreamAdapter`] turns them
//! into one uniform sequence of [`StreamEvent`]s with classified errors,
//! bounded start retries, a start timeout, cooperative cancellation and
//! per-stream metrics. [`Gateway`] routes requests to registered backends.
//!
//! # Gateway usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use llm_gateway_core::prelude::*;
//!
//! # async fn demo(backend: Arc<dyn StreamBackend>) -> Result<(), GatewayError> {
//! let gateway = Gateway::builder()
//!     .register_backend(backend)
//!     .config(StreamingConfig::from_env()?)
//!     .build()?;
//!
//! let text = gateway
//!     .collect_text(
//!         StreamRequest::new(ModelRef::new("local", "tiny"))
//!             .system_prompt("Answer briefly.")
//!             .user_text("Say hello"),
//!     )
//!     .await?;
//!
//! println!("{text}");
//! # Ok(())
//! # }
//! ```

/// Streaming adapter state machine and starter output shapes.
pub mod adapter;
/// Cooperative cancellation token.
pub mod cancel;
/// Streaming, retry and timeout configuration.
pub mod config;
/// Input parts and output collection helpers.
pub mod content;
/// Error taxonomy, classifier and public error types.
pub mod errors;
/// Multi-backend entry point and backend contract.
pub mod gateway;
/// Per-stream metrics.
pub mod metrics;
/// Model and provider identifiers.
pub mod model;
/// Phase records, log sinks and subscriber setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Retry policy with exponential backoff.
pub mod retry;
/// Uniform stream events and lifecycle phases.
pub mod stream;
/// Preemptive and cooperative timeout guards.
pub mod timeout;
/// Chunk translator contracts.
pub mod translate;

pub use adapter::{
    CompletionCallback, EventStream, MissingStream, StartMeta, StarterOutput, StarterRecord,
    StreamAdapter,
};
pub use cancel::CancellationToken;
pub use config::{RetrySettings, StreamingConfig};
pub use content::{InputPart, StreamOutput, collect_output, collect_text};
pub use errors::{
    ClassifiedError, ErrorKind, GatewayError, ProviderError, UnknownErrorKind, classify,
    classify_message,
};
pub use gateway::{Gateway, GatewayBuilder, GatewayStream, NativeStream, StreamBackend, StreamRequest};
pub use metrics::StreamMetrics;
pub use model::{ModelRef, ProviderId};
pub use observability::{
    LogContext, LogSettings, LogSink, PhaseRecord, TracingSink, init_observability,
    init_observability_with,
};
pub use retry::{AttemptObserver, AttemptReport, RetryConfigFactory, RetryPolicy};
pub use stream::{Phase, StreamEvent, Termination};
pub use timeout::{
    Deadline, GuardMode, TimeoutConfig, TimeoutElapsed, with_timeout, with_timeout_blocking,
};
pub use translate::{StructuredTranslator, Translator, Translators};
