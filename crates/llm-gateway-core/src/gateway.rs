use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use futures::stream::BoxStream;
use serde_json::Value;
use tracing::debug;

use crate::adapter::{EventStream, StarterOutput, StreamAdapter};
use crate::cancel::CancellationToken;
use crate::config::StreamingConfig;
use crate::content::{InputPart, StreamOutput, collect_output};
use crate::errors::{GatewayError, ProviderError};
use crate::model::{ModelRef, ProviderId};
use crate::observability::{LogSink, TracingSink};
use crate::stream::StreamEvent;
use crate::translate::Translators;

/// Native chunk stream handed out by a backend.
pub type NativeStream = BoxStream<'static, Result<Value, ProviderError>>;

/// Contract a backend integration implements to be driven by the gateway.
///
/// `open_stream` is one attempt at acquiring a stream: it must not retry or
/// enforce its own start timeout. The translators are pure; `None` means the
/// chunk carries nothing to emit.
#[async_trait::async_trait]
pub trait StreamBackend: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn open_stream(
        &self,
        request: &StreamRequest,
    ) -> Result<StarterOutput<NativeStream>, ProviderError>;

    fn translate(&self, chunk: &Value) -> Option<String>;

    fn translate_structured(&self, _chunk: &Value) -> Option<Value> {
        None
    }
}

/// One generation request, routed by `model.provider`.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRequest {
    pub model: ModelRef,
    pub system_prompt: Option<String>,
    pub input_parts: Vec<InputPart>,
    vendor_options: HashMap<ProviderId, Value>,
}

impl StreamRequest {
    pub fn new(model: ModelRef) -> Self {
        Self {
            model,
            system_prompt: None,
            input_parts: Vec::new(),
            vendor_options: HashMap::new(),
        }
    }

    pub fn system_prompt(mut self, text: impl Into<String>) -> Self {
        self.system_prompt = Some(text.into());
        self
    }

    /// Appends a plain text input part.
    pub fn user_text(mut self, text: impl Into<String>) -> Self {
        self.input_parts.push(InputPart::Text(text.into()));
        self
    }

    /// Appends a JSON input part.
    pub fn user_json(mut self, value: Value) -> Self {
        self.input_parts.push(InputPart::Json(value));
        self
    }

    /// Replaces all input parts.
    pub fn input_parts(mut self, parts: Vec<InputPart>) -> Self {
        self.input_parts = parts;
        self
    }

    /// Stores opaque options for one backend. Only that backend sees them.
    pub fn vendor_options(mut self, provider: impl Into<ProviderId>, value: Value) -> Self {
        self.vendor_options.insert(provider.into(), value);
        self
    }

    pub fn vendor_options_for(&self, provider: &ProviderId) -> Option<&Value> {
        self.vendor_options.get(provider)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.model.provider.as_str().trim().is_empty() {
            return Err(GatewayError::Validation(
                "model provider must not be empty".into(),
            ));
        }
        if self.model.model.trim().is_empty() {
            return Err(GatewayError::Validation("model must not be empty".into()));
        }
        if self.input_parts.is_empty() {
            return Err(GatewayError::Validation(
                "at least one input part is required".into(),
            ));
        }
        for part in &self.input_parts {
            if let InputPart::Text(text) = part
                && text.trim().is_empty()
            {
                return Err(GatewayError::Validation(
                    "text input must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    fn normalized(mut self) -> Self {
        self.system_prompt = self.system_prompt.filter(|s| !s.trim().is_empty());
        self
    }
}

/// Multi-backend entry point. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    backends: HashMap<ProviderId, Arc<dyn StreamBackend>>,
    config: StreamingConfig,
    sink: Arc<dyn LogSink>,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.inner.config
    }

    /// Validates `request`, resolves its backend and returns the lazy event
    /// stream. Nothing reaches the backend until the stream is polled.
    pub fn stream(&self, request: StreamRequest) -> Result<GatewayStream, GatewayError> {
        request.validate()?;
        let request = Arc::new(request.normalized());
        let backend = self
            .inner
            .backends
            .get(&request.model.provider)
            .cloned()
            .ok_or_else(|| GatewayError::ProviderNotFound {
                provider: request.model.provider.clone(),
            })?;

        let config = &self.inner.config;
        let model = request.model.clone();
        let cancel = CancellationToken::new();
        debug!(
            event = "gateway.stream_requested",
            domain = "gateway",
            provider = model.provider.as_str(),
            model = model.model.as_str(),
            input_parts = request.input_parts.len()
        );

        let text_backend = backend.clone();
        let structured_backend = backend.clone();
        let translators = Translators::<Value>::text(move |chunk: &Value| {
            text_backend.translate(chunk)
        })
        .with_structured(move |chunk: &Value| structured_backend.translate_structured(chunk));

        let starter = move || {
            let backend = backend.clone();
            let request = request.clone();
            async move { backend.open_stream(&request).await }
        };

        let events = StreamAdapter::new(model.clone())
            .timeouts(config.timeouts.clone())
            .retry_config_factory(config.retry_factory())
            .sink(self.inner.sink.clone())
            .cancellation(cancel.clone())
            .stream(starter, translators);

        Ok(GatewayStream {
            model,
            events,
            cancel,
        })
    }

    /// Streams `request` to completion and returns the aggregated output.
    pub async fn collect_output(&self, request: StreamRequest) -> Result<StreamOutput, GatewayError> {
        self.stream(request)?.collect_output().await
    }

    pub async fn collect_text(&self, request: StreamRequest) -> Result<String, GatewayError> {
        Ok(self.collect_output(request).await?.text)
    }
}

/// Builder used to register backends before creating a [`Gateway`].
#[derive(Default)]
pub struct GatewayBuilder {
    backends: Vec<Arc<dyn StreamBackend>>,
    config: Option<StreamingConfig>,
    sink: Option<Arc<dyn LogSink>>,
}

impl GatewayBuilder {
    /// Registers a backend. One backend per provider id.
    pub fn register_backend(mut self, backend: Arc<dyn StreamBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn config(mut self, config: StreamingConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides the default [`TracingSink`].
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the gateway and rejects duplicate provider ids.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let mut backends: HashMap<ProviderId, Arc<dyn StreamBackend>> = HashMap::new();
        let mut seen: HashSet<ProviderId> = HashSet::new();
        for backend in self.backends {
            let id = backend.id();
            if !seen.insert(id.clone()) {
                return Err(GatewayError::Config(format!(
                    "duplicate backend registration: {id}"
                )));
            }
            backends.insert(id, backend);
        }
        let config = self.config.unwrap_or_default();
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(TracingSink::new().with_verbose(config.verbose_logging)));
        Ok(Gateway {
            inner: Arc::new(GatewayInner {
                backends,
                config,
                sink,
            }),
        })
    }
}

/// Event stream for one request plus its cancellation handle.
pub struct GatewayStream {
    model: ModelRef,
    events: EventStream,
    cancel: CancellationToken,
}

impl GatewayStream {
    pub fn model(&self) -> &ModelRef {
        &self.model
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests cancellation. Observed before the next native chunk is pulled.
    pub fn cancel(&self) {
        self.cancel.request_cancel();
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        futures::StreamExt::next(&mut self.events).await
    }

    pub async fn collect_output(self) -> Result<StreamOutput, GatewayError> {
        collect_output(self.events).await
    }

    pub async fn collect_text(self) -> Result<String, GatewayError> {
        Ok(self.collect_output().await?.text)
    }
}

impl Stream for GatewayStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.events.as_mut().poll_next(cx)
    }
}
