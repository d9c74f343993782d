//! Streaming adapter: turns an opaque starter and an opaque chunk format into
//! one uniform, pull-based sequence of [`StreamEvent`]s.
//!
//! Lifecycle: `NotStarted -> Starting -> Streaming -> Terminal`. `Starting`
//! runs the starter under the start-phase retry policy, with every attempt
//! bounded by the start timeout. `Terminal` is reached exactly once through one
//! of the [`Termination`] paths, and reaching it always produces exactly one
//! event with `finish = true`, which is the last event of the stream.
//!
//! The native stream is owned by the adapter and dropped before the terminal
//! event is handed out, on every path.

use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt as _};
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::errors::{ClassifiedError, ErrorKind};
use crate::metrics::{MetricsRecorder, StreamMetrics};
use crate::model::ModelRef;
use crate::observability::{LogContext, LogSink};
use crate::retry::{RetryConfigFactory, RetryPolicy};
use crate::stream::{Phase, StreamEvent, Termination};
use crate::timeout::{TimeoutConfig, with_timeout};
use crate::translate::Translators;

/// Free-form metadata returned next to a native stream.
pub type StartMeta = serde_json::Map<String, serde_json::Value>;

/// Uniform event stream returned by [`StreamAdapter::stream`].
pub type EventStream = BoxStream<'static, StreamEvent>;

/// Invoked once at finalize with whether any content was emitted.
pub type CompletionCallback = Box<dyn FnOnce(bool) + Send + Sync>;

/// Shapes a starter may return.
pub enum StarterOutput<S> {
    /// Just the native stream; meta is empty.
    Bare(S),
    /// Native stream plus meta.
    WithMeta(S, StartMeta),
    /// A record whose `stream` entry holds the native stream and whose other
    /// fields are meta. A record without a stream is a caller bug.
    Record(StarterRecord<S>),
}

/// Record-shaped starter output: an optional native stream plus free-form
/// fields that become meta.
pub struct StarterRecord<S> {
    pub stream: Option<S>,
    pub fields: StartMeta,
}

impl<S> StarterRecord<S> {
    /// Creates a record with meta fields and no stream yet.
    pub fn new(fields: StartMeta) -> Self {
        Self {
            stream: None,
            fields,
        }
    }

    /// Attaches the native stream.
    pub fn with_stream(mut self, stream: S) -> Self {
        self.stream = Some(stream);
        self
    }
}

/// A record-shaped starter output had no stream. Classified as `INTERNAL`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("starter returned a record without a \"stream\" entry (fields: {fields:?})")]
pub struct MissingStream {
    pub fields: Vec<String>,
}

impl<S> StarterOutput<S> {
    /// Splits the output into the native stream and its meta.
    pub fn into_parts(self) -> Result<(S, StartMeta), MissingStream> {
        match self {
            StarterOutput::Bare(stream) => Ok((stream, StartMeta::new())),
            StarterOutput::WithMeta(stream, meta) => Ok((stream, meta)),
            StarterOutput::Record(StarterRecord {
                stream: Some(stream),
                fields,
            }) => Ok((stream, fields)),
            StarterOutput::Record(StarterRecord {
                stream: None,
                fields,
            }) => Err(MissingStream {
                fields: fields.keys().cloned().collect(),
            }),
        }
    }
}

/// Configures and launches one adapter invocation.
pub struct StreamAdapter {
    model: ModelRef,
    timeouts: TimeoutConfig,
    retry_config: RetryConfigFactory,
    sink: Option<Arc<dyn LogSink>>,
    cancel: CancellationToken,
    on_complete: Option<CompletionCallback>,
}

fn default_retry_config(phase: Phase) -> RetryPolicy {
    match phase {
        Phase::Start => RetryPolicy::default(),
        Phase::MidStream | Phase::Finalize => RetryPolicy::single_attempt(),
    }
}

impl StreamAdapter {
    /// Creates an adapter with default timeouts, the default start retry
    /// policy, no sink and a fresh cancellation token.
    pub fn new(model: ModelRef) -> Self {
        Self {
            model,
            timeouts: TimeoutConfig::default(),
            retry_config: Arc::new(default_retry_config),
            sink: None,
            cancel: CancellationToken::new(),
            on_complete: None,
        }
    }

    /// Overrides the timeout bounds; only the start bound is enforced.
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the per-phase retry policy factory. Only `Phase::Start` is
    /// consulted: mid-stream failures are never retried.
    pub fn retry_config<F>(mut self, factory: F) -> Self
    where
        F: Fn(Phase) -> RetryPolicy + Send + Sync + 'static,
    {
        self.retry_config = Arc::new(factory);
        self
    }

    /// Same as [`StreamAdapter::retry_config`] for an already shared factory.
    pub fn retry_config_factory(mut self, factory: RetryConfigFactory) -> Self {
        self.retry_config = factory;
        self
    }

    /// Sets the receiver for phase records.
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Shares a caller-owned token with this invocation.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Returns a handle to this invocation's cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registers a callback run once at finalize with whether any content
    /// was emitted.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(bool) + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Returns the lazy event stream. Nothing runs until it is polled.
    ///
    /// `starter` must not retry or enforce timeouts itself; each call is one
    /// fresh attempt at acquiring the native stream.
    pub fn stream<St, Fut, S, C, E, SE>(self, starter: St, translators: Translators<C>) -> EventStream
    where
        St: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<StarterOutput<S>, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
        S: Stream<Item = Result<C, SE>> + Send + 'static,
        SE: StdError + Send + Sync + 'static,
        C: Send + 'static,
    {
        let machine = Machine {
            ctx: LogContext::new(self.model.clone()),
            config: self,
            starter,
            translators,
            metrics: MetricsRecorder::start(),
            attempts: None,
            state: State::NotStarted,
        };
        stream::unfold(machine, |mut machine| async move {
            let event = machine.next_event().await?;
            Some((event, machine))
        })
        .boxed()
    }
}

enum State<S> {
    NotStarted,
    Starting,
    Streaming(Pin<Box<S>>),
    Terminal,
}

struct Machine<St, S, C> {
    config: StreamAdapter,
    ctx: LogContext,
    starter: St,
    translators: Translators<C>,
    metrics: MetricsRecorder,
    attempts: Option<u32>,
    state: State<S>,
}

impl<St, Fut, S, C, E, SE> Machine<St, S, C>
where
    St: FnMut() -> Fut,
    Fut: Future<Output = Result<StarterOutput<S>, E>>,
    E: StdError + Send + Sync + 'static,
    S: Stream<Item = Result<C, SE>>,
    SE: StdError + Send + Sync + 'static,
    C: 'static,
{
    async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            match &mut self.state {
                State::Terminal => return None,
                State::NotStarted => {
                    self.metrics = MetricsRecorder::start();
                    self.state = State::Starting;
                }
                State::Starting => {
                    match self.start().await {
                        Ok(native) => self.state = State::Streaming(native),
                        Err((termination, err)) => {
                            return Some(self.finalize(termination, Some(err)));
                        }
                    }
                }
                State::Streaming(native) => {
                    if self.config.cancel.is_cancelled() {
                        let err = ClassifiedError::cancelled(&self.ctx.model);
                        return Some(self.finalize(Termination::Cancelled, Some(err)));
                    }
                    let next = native.next().await;
                    match next {
                        None => {
                            return Some(self.finalize(Termination::Completed, None));
                        }
                        Some(Err(err)) => {
                            let err = ClassifiedError::from_error(err, &self.ctx.model);
                            return Some(self.finalize(Termination::MidStreamError, Some(err)));
                        }
                        Some(Ok(chunk)) => {
                            let Some(content) = self.translators.apply(&chunk) else {
                                continue;
                            };
                            self.metrics.record_emission();
                            if self.config.sink.as_ref().is_some_and(|sink| sink.verbose()) {
                                self.log(Phase::MidStream, None, None, self.metrics.snapshot());
                            }
                            return Some(StreamEvent::content(
                                &self.ctx.model,
                                content.delta,
                                content.structured,
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn start(&mut self) -> Result<Pin<Box<S>>, (Termination, ClassifiedError)> {
        let policy = (self.config.retry_config)(Phase::Start);
        let start_secs = self.config.timeouts.start_secs;
        let model = &self.ctx.model;
        let starter = &mut self.starter;
        debug!(
            event = "stream.starting",
            domain = "stream",
            stream_id = %self.ctx.stream_id,
            provider = model.provider.as_str(),
            model = model.model.as_str(),
            max_attempts = policy.attempts(),
            start_timeout_secs = start_secs
        );

        let outcome = policy
            .run(model, || {
                let attempt = starter();
                async move {
                    match with_timeout(start_secs, attempt).await {
                        Ok(Ok(output)) => Ok(output),
                        Ok(Err(err)) => Err(ClassifiedError::from_error(err, model)),
                        Err(elapsed) => Err(ClassifiedError::from_error(elapsed, model)),
                    }
                }
            })
            .await;
        self.attempts = Some(outcome.attempts);

        let output = match outcome.result {
            Ok(output) => output,
            Err(err) => {
                self.log(Phase::Start, Some(err.kind), None, self.metrics.snapshot());
                return Err((Termination::StartFailed, err));
            }
        };
        let (native, meta) = match output.into_parts() {
            Ok(parts) => parts,
            Err(missing) => {
                let err = ClassifiedError::internal(missing.to_string(), &self.ctx.model)
                    .with_retryable(false);
                self.log(Phase::Start, Some(ErrorKind::Internal), None, self.metrics.snapshot());
                return Err((Termination::DecodeFailed, err));
            }
        };
        self.ctx.attach_meta(&meta);
        self.log(Phase::Start, None, None, self.metrics.snapshot());
        Ok(Box::pin(native))
    }
}

impl<St, S, C> Machine<St, S, C> {
    fn finalize(&mut self, termination: Termination, error: Option<ClassifiedError>) -> StreamEvent {
        self.state = State::Terminal;
        let metrics = self.metrics.finish();
        self.log(
            Phase::Finalize,
            error.as_ref().map(|e| e.kind),
            Some(termination),
            metrics.clone(),
        );
        if let Some(callback) = self.config.on_complete.take() {
            callback(self.metrics.has_emitted());
        }
        StreamEvent::terminal(&self.ctx.model, error.as_ref(), metrics)
    }

    fn log(
        &self,
        phase: Phase,
        error_kind: Option<ErrorKind>,
        termination: Option<Termination>,
        metrics: StreamMetrics,
    ) {
        if let Some(sink) = &self.config.sink {
            sink.record(&self.ctx.record(phase, self.attempts, error_kind, termination, metrics));
        }
    }
}

// A consumer that stops pulling once starting has begun still gets its
// finalize side effects (record and completion callback), reported as a
// cancellation.
impl<St, S, C> Drop for Machine<St, S, C> {
    fn drop(&mut self) {
        if matches!(self.state, State::Starting | State::Streaming(_)) {
            self.state = State::Terminal;
            let err = ClassifiedError::cancelled(&self.ctx.model);
            let _ = self.finalize(Termination::Cancelled, Some(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use crate::observability::testing::MemorySink;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::task::{Context, Poll};

    #[derive(Debug, Clone, thiserror::Error)]
    #[error("{0}")]
    struct Boom(String);

    type Chunk = Result<Value, Boom>;

    fn model() -> ModelRef {
        ModelRef::new("fake", "model-a")
    }

    fn delta_chunks(deltas: &[&str]) -> Vec<Chunk> {
        deltas.iter().map(|d| Ok(json!({ "delta": d }))).collect()
    }

    fn text_of(chunk: &Value) -> Option<String> {
        chunk.get("delta").and_then(Value::as_str).map(ToOwned::to_owned)
    }

    fn tool_args_of(chunk: &Value) -> Option<Value> {
        chunk.get("tool_args").cloned()
    }

    fn translators() -> Translators<Value> {
        Translators::<Value>::text(text_of)
    }

    fn bare_starter(
        items: Vec<Chunk>,
        calls: Arc<AtomicU32>,
    ) -> impl FnMut() -> futures::future::Ready<
        Result<StarterOutput<stream::Iter<std::vec::IntoIter<Chunk>>>, Boom>,
    > + Send
    + 'static {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(StarterOutput::Bare(stream::iter(items.clone()))))
        }
    }

    async fn drain(events: EventStream) -> Vec<StreamEvent> {
        events.collect().await
    }

    fn deltas(events: &[StreamEvent]) -> Vec<&str> {
        events.iter().filter_map(|e| e.delta.as_deref()).collect()
    }

    fn assert_well_formed(events: &[StreamEvent]) -> &StreamEvent {
        let terminals = events.iter().filter(|e| e.finish).count();
        assert_eq!(terminals, 1, "exactly one terminal event: {events:?}");
        let last = events.last().expect("at least one event");
        assert!(last.finish, "terminal event is last");

        let content = events
            .iter()
            .filter(|e| !e.finish && (e.delta.is_some() || e.structured.is_some()))
            .count() as u64;
        let metrics = last.metrics.as_ref().expect("terminal metrics");
        assert_eq!(metrics.emitted_count, content);
        assert_eq!(metrics.time_to_first_content_ms.is_some(), content > 0);
        let total = metrics.total_duration_ms.expect("total duration");
        assert!(total > 0.0);
        if let Some(ttfc) = metrics.time_to_first_content_ms {
            assert!(ttfc <= total);
        }
        last
    }

    struct Tracked<S> {
        inner: S,
        dropped: Arc<AtomicBool>,
    }

    impl<S: Stream + Unpin> Stream for Tracked<S> {
        type Item = S::Item;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<S::Item>> {
            Pin::new(&mut self.inner).poll_next(cx)
        }
    }

    impl<S> Drop for Tracked<S> {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn three_chunks_then_completion() {
        let calls = Arc::new(AtomicU32::new(0));
        let events = drain(
            StreamAdapter::new(model())
                .stream(bare_starter(delta_chunks(&["a", "b", "c"]), calls.clone()), translators()),
        )
        .await;

        assert_eq!(events.len(), 4);
        assert_eq!(deltas(&events), vec!["a", "b", "c"]);
        let last = assert_well_formed(&events);
        assert_eq!(last.error, None);
        assert_eq!(last.provider.as_str(), "fake");
        assert_eq!(last.model, "model-a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_stream_yields_only_terminal() {
        let events = drain(
            StreamAdapter::new(model())
                .stream(bare_starter(Vec::new(), Arc::new(AtomicU32::new(0))), translators()),
        )
        .await;

        assert_eq!(events.len(), 1);
        let last = assert_well_formed(&events);
        assert_eq!(last.error, None);
        let metrics = last.metrics.as_ref().expect("metrics");
        assert_eq!(metrics.emitted_count, 0);
        assert_eq!(metrics.time_to_first_content_ms, None);
    }

    #[tokio::test]
    async fn mid_stream_failure_after_first_chunk() {
        let items = vec![Ok(json!({"delta": "x"})), Err(Boom("boom".into())), Ok(json!({"delta": "y"}))];
        let events = drain(
            StreamAdapter::new(model())
                .stream(bare_starter(items, Arc::new(AtomicU32::new(0))), translators()),
        )
        .await;

        assert_eq!(deltas(&events), vec!["x"]);
        assert_eq!(events.len(), 2);
        let last = assert_well_formed(&events);
        assert!(last.error.as_deref().expect("error").ends_with("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn mid_stream_failures_are_never_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let items = vec![
            Ok(json!({"delta": "x"})),
            Err(Boom("upstream timed out".into())),
        ];
        let events = drain(
            StreamAdapter::new(model())
                .retry_config(|_| RetryPolicy::new(5, 1.0).with_retryable_kinds(ErrorKind::ALL))
                .stream(bare_starter(items, calls.clone()), translators()),
        )
        .await;

        let last = assert_well_formed(&events);
        assert_eq!(last.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn starter_failure_yields_single_classified_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let starter = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Err::<StarterOutput<stream::Empty<Chunk>>, _>(
                ProviderError::provider("fake", "invalid api key", Some(401)),
            ))
        };
        let events = drain(StreamAdapter::new(model()).stream(starter, translators())).await;

        assert_eq!(events.len(), 1);
        let last = assert_well_formed(&events);
        assert_eq!(last.error_kind, Some(ErrorKind::Auth));
        assert!(last.error.as_deref().expect("error").starts_with("AUTH: "));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_start_failures_are_retried_with_fresh_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let starter = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            futures::future::ready(if n < 3 {
                Err(ProviderError::provider("fake", "overloaded", Some(503)))
            } else {
                Ok(StarterOutput::Bare(stream::iter(delta_chunks(&["ok"]))))
            })
        };
        let sink = MemorySink::default();
        let events = drain(
            StreamAdapter::new(model())
                .retry_config(|_| RetryPolicy::new(3, 2.0))
                .sink(Arc::new(sink.clone()))
                .stream(starter, translators()),
        )
        .await;

        assert_eq!(deltas(&events), vec!["ok"]);
        assert_eq!(assert_well_formed(&events).error, None);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let start = sink
            .taken()
            .into_iter()
            .find(|r| r.phase == Phase::Start)
            .expect("start record");
        assert_eq!(start.attempt, Some(3));
        assert_eq!(start.error_kind, None);
    }

    #[tokio::test(start_paused = true)]
    async fn start_timeout_is_classified_and_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let starter = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::pending::<Result<StarterOutput<stream::Empty<Chunk>>, Boom>>()
        };
        let events = drain(
            StreamAdapter::new(model())
                .timeouts(TimeoutConfig::default().with_start_secs(2.0))
                .retry_config(|_| RetryPolicy::new(2, 1.0))
                .stream(starter, translators()),
        )
        .await;

        let last = assert_well_formed(&events);
        assert_eq!(last.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_before_first_chunk() {
        let adapter = StreamAdapter::new(model());
        adapter.cancellation_token().request_cancel();
        let events = drain(
            adapter.stream(bare_starter(delta_chunks(&["a", "b"]), Arc::new(AtomicU32::new(0))), translators()),
        )
        .await;

        assert_eq!(events.len(), 1);
        let last = assert_well_formed(&events);
        assert_eq!(last.error_kind, Some(ErrorKind::Cancelled));
        assert!(last.error.as_deref().expect("error").starts_with("CANCELLED"));
    }

    #[tokio::test]
    async fn cancellation_between_chunks_releases_native_stream() {
        let token = CancellationToken::new();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let starter = move || {
            futures::future::ready(Ok::<_, Boom>(StarterOutput::Bare(Tracked {
                inner: stream::iter(delta_chunks(&["a", "b", "c"])),
                dropped: flag.clone(),
            })))
        };
        let mut events = StreamAdapter::new(model())
            .cancellation(token.clone())
            .stream(starter, translators());

        let first = events.next().await.expect("first event");
        assert_eq!(first.delta.as_deref(), Some("a"));
        token.request_cancel();

        let terminal = events.next().await.expect("terminal event");
        assert!(terminal.finish);
        assert_eq!(terminal.error_kind, Some(ErrorKind::Cancelled));
        assert!(dropped.load(Ordering::SeqCst));
        assert!(events.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn record_without_stream_is_internal_and_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let starter = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let fields = json!({"request_id": "r-1"}).as_object().cloned().unwrap_or_default();
            futures::future::ready(Ok::<_, Boom>(StarterOutput::Record(
                StarterRecord::<stream::Empty<Chunk>>::new(fields),
            )))
        };
        let events = drain(
            StreamAdapter::new(model())
                .retry_config(|_| RetryPolicy::new(5, 1.0).with_retryable_kinds(ErrorKind::ALL))
                .stream(starter, translators()),
        )
        .await;

        assert_eq!(events.len(), 1);
        let last = assert_well_formed(&events);
        assert_eq!(last.error_kind, Some(ErrorKind::Internal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn record_and_pair_shapes_attach_meta_ids_once() {
        let sink = MemorySink::default();
        let starter = move || {
            let fields = json!({"request_id": "req-9", "response_id": "resp-1"})
                .as_object()
                .cloned()
                .unwrap_or_default();
            futures::future::ready(Ok::<_, Boom>(StarterOutput::Record(
                StarterRecord::new(fields).with_stream(stream::iter(delta_chunks(&["hi"]))),
            )))
        };
        let events = drain(
            StreamAdapter::new(model())
                .sink(Arc::new(sink.clone()))
                .stream(starter, translators()),
        )
        .await;

        assert_eq!(deltas(&events), vec!["hi"]);
        let finalize = sink
            .taken()
            .into_iter()
            .find(|r| r.phase == Phase::Finalize)
            .expect("finalize record");
        assert_eq!(finalize.request_id.as_deref(), Some("req-9"));
        assert_eq!(finalize.response_id.as_deref(), Some("resp-1"));
        assert_eq!(finalize.termination, Some(Termination::Completed));
        assert_eq!(finalize.error_kind, None);

        let pair = StarterOutput::WithMeta(stream::empty::<Chunk>(), StartMeta::new());
        assert!(pair.into_parts().is_ok());
    }

    #[tokio::test]
    async fn empty_translations_are_skipped_and_structured_partials_emitted() {
        let items = vec![
            Ok(json!({"delta": ""})),
            Ok(json!({"noise": true})),
            Ok(json!({"tool_args": {"city": "Par"}})),
            Ok(json!({"delta": "done", "tool_args": {"city": "Paris"}})),
        ];
        let events = drain(StreamAdapter::new(model()).stream(
            bare_starter(items, Arc::new(AtomicU32::new(0))),
            translators().with_structured(tool_args_of),
        ))
        .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].delta, None);
        assert_eq!(events[0].structured, Some(json!({"city": "Par"})));
        assert_eq!(events[1].delta.as_deref(), Some("done"));
        assert_eq!(events[1].structured, Some(json!({"city": "Paris"})));
        assert_well_formed(&events);
    }

    #[tokio::test]
    async fn completion_callback_fires_once_with_emission_flag() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        for chunks in [delta_chunks(&["a"]), Vec::new()] {
            let sink = seen.clone();
            drain(
                StreamAdapter::new(model())
                    .on_complete(move |emitted| sink.lock().expect("lock").push(emitted))
                    .stream(bare_starter(chunks, Arc::new(AtomicU32::new(0))), translators()),
            )
            .await;
        }

        assert_eq!(*seen.lock().expect("lock"), vec![true, false]);
    }

    #[tokio::test]
    async fn verbose_sink_gets_mid_stream_records_quiet_sink_does_not() {
        let chatty = MemorySink::chatty();
        let quiet = MemorySink::default();
        for sink in [chatty.clone(), quiet.clone()] {
            drain(StreamAdapter::new(model()).sink(Arc::new(sink)).stream(
                bare_starter(delta_chunks(&["a", "b"]), Arc::new(AtomicU32::new(0))),
                translators(),
            ))
            .await;
        }

        let mid = |records: Vec<crate::observability::PhaseRecord>| {
            records.iter().filter(|r| r.phase == Phase::MidStream).count()
        };
        assert_eq!(mid(chatty.taken()), 2);
        assert_eq!(mid(quiet.taken()), 0);
        let phases: Vec<Phase> = quiet.taken().iter().map(|r| r.phase).collect();
        assert_eq!(phases, vec![Phase::Start, Phase::Finalize]);
    }

    #[tokio::test]
    async fn dropping_mid_stream_still_finalizes_once() {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = MemorySink::default();
        let flags = emitted.clone();
        let mut events = StreamAdapter::new(model())
            .sink(Arc::new(sink.clone()))
            .on_complete(move |any| flags.lock().expect("lock").push(any))
            .stream(
                bare_starter(delta_chunks(&["a", "b"]), Arc::new(AtomicU32::new(0))),
                translators(),
            );

        assert!(events.next().await.is_some());
        drop(events);

        assert_eq!(*emitted.lock().expect("lock"), vec![true]);
        let finals: Vec<_> = sink
            .taken()
            .into_iter()
            .filter(|r| r.phase == Phase::Finalize)
            .collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].termination, Some(Termination::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_while_starting_still_finalizes_once() {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = MemorySink::default();
        let flags = emitted.clone();
        let starter = || futures::future::pending::<Result<StarterOutput<stream::Empty<Chunk>>, Boom>>();
        let mut events = StreamAdapter::new(model())
            .timeouts(TimeoutConfig::default().with_start_secs(60.0))
            .sink(Arc::new(sink.clone()))
            .on_complete(move |any| flags.lock().expect("lock").push(any))
            .stream(starter, translators());

        let waited = tokio::time::timeout(std::time::Duration::from_secs(1), events.next()).await;
        assert!(waited.is_err());
        drop(events);

        assert_eq!(*emitted.lock().expect("lock"), vec![false]);
        let finals: Vec<_> = sink
            .taken()
            .into_iter()
            .filter(|r| r.phase == Phase::Finalize)
            .collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].termination, Some(Termination::Cancelled));
        assert_eq!(finals[0].error_kind, Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn absent_sink_does_not_change_events() {
        let with_sink = drain(
            StreamAdapter::new(model())
                .sink(Arc::new(MemorySink::chatty()))
                .stream(bare_starter(delta_chunks(&["a", "b"]), Arc::new(AtomicU32::new(0))), translators()),
        )
        .await;
        let without = drain(
            StreamAdapter::new(model())
                .stream(bare_starter(delta_chunks(&["a", "b"]), Arc::new(AtomicU32::new(0))), translators()),
        )
        .await;

        assert_eq!(deltas(&with_sink), deltas(&without));
        assert_eq!(with_sink.len(), without.len());
    }
}
