use futures::{Stream, StreamExt as _};

use crate::errors::{ErrorKind, GatewayError};
use crate::metrics::StreamMetrics;
use crate::stream::StreamEvent;

/// Input content sent with a stream request.
///
/// Text-first, but the enum is non-exhaustive so new content kinds can be
/// added without breaking callers.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum InputPart {
    /// Plain text input.
    Text(String),
    /// Structured JSON input.
    Json(serde_json::Value),
}

/// Aggregated result of a successfully finished stream.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, Default)]
pub struct StreamOutput {
    /// All text deltas concatenated in order.
    pub text: String,
    /// Structured partials in the order they were produced.
    pub structured: Vec<serde_json::Value>,
    /// Metrics from the terminal event.
    pub metrics: StreamMetrics,
}

/// Drains an event stream into a [`StreamOutput`].
///
/// A failed terminal event becomes `GatewayError::Stream`; a stream that ends
/// without any terminal event is a protocol error.
pub async fn collect_output<S>(mut events: S) -> Result<StreamOutput, GatewayError>
where
    S: Stream<Item = StreamEvent> + Unpin,
{
    let mut output = StreamOutput::default();
    while let Some(event) = events.next().await {
        if event.finish {
            if let Some(error) = event.error {
                let kind = event.error_kind.unwrap_or(ErrorKind::Unknown);
                let prefix = format!("{kind}: ");
                let message = error.strip_prefix(&prefix).unwrap_or(&error).to_string();
                return Err(GatewayError::Stream { kind, message });
            }
            output.metrics = event.metrics.unwrap_or_default();
            return Ok(output);
        }
        if let Some(delta) = event.delta {
            output.text.push_str(&delta);
        }
        if let Some(structured) = event.structured {
            output.structured.push(structured);
        }
    }
    Err(GatewayError::Protocol(
        "event stream ended without a terminal event".into(),
    ))
}

/// Drains an event stream and returns only the concatenated text.
pub async fn collect_text<S>(events: S) -> Result<String, GatewayError>
where
    S: Stream<Item = StreamEvent> + Unpin,
{
    Ok(collect_output(events).await?.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ClassifiedError;
    use crate::model::ModelRef;
    use futures::stream;
    use serde_json::json;

    fn model() -> ModelRef {
        ModelRef::new("fake", "m")
    }

    fn finished(emitted: u64) -> StreamMetrics {
        StreamMetrics {
            emitted_count: emitted,
            time_to_first_content_ms: (emitted > 0).then_some(1.0),
            total_duration_ms: Some(2.0),
        }
    }

    #[tokio::test]
    async fn concatenates_text_and_keeps_structured_partials() {
        let events = vec![
            StreamEvent::content(&model(), Some("hello".into()), None),
            StreamEvent::content(&model(), None, Some(json!({"a": 1}))),
            StreamEvent::content(&model(), Some(" world".into()), None),
            StreamEvent::terminal(&model(), None, finished(3)),
        ];
        let output = collect_output(stream::iter(events)).await.expect("output");
        assert_eq!(output.text, "hello world");
        assert_eq!(output.structured, vec![json!({"a": 1})]);
        assert_eq!(output.metrics.emitted_count, 3);
    }

    #[tokio::test]
    async fn failed_terminal_becomes_stream_error() {
        let err = ClassifiedError::new(ErrorKind::RateLimit, "slow down", &model());
        let events = vec![
            StreamEvent::content(&model(), Some("partial".into()), None),
            StreamEvent::terminal(&model(), Some(&err), finished(1)),
        ];
        let result = collect_text(stream::iter(events)).await;
        assert_eq!(
            result,
            Err(GatewayError::Stream {
                kind: ErrorKind::RateLimit,
                message: "slow down".into()
            })
        );
    }

    #[tokio::test]
    async fn missing_terminal_is_protocol_error() {
        let events = vec![StreamEvent::content(&model(), Some("x".into()), None)];
        assert!(matches!(
            collect_output(stream::iter(events)).await,
            Err(GatewayError::Protocol(msg)) if msg.contains("terminal")
        ));
    }
}
