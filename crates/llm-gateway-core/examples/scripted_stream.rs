use std::sync::Arc;

use futures::stream;
use llm_gateway_core::prelude::*;
use serde_json::{Value, json};

/// Backend that replays a fixed list of JSON chunks.
struct ScriptedBackend {
    chunks: Vec<Value>,
}

#[async_trait::async_trait]
impl StreamBackend for ScriptedBackend {
    fn id(&self) -> ProviderId {
        ProviderId::new("scripted")
    }

    async fn open_stream(
        &self,
        _request: &StreamRequest,
    ) -> Result<StarterOutput<NativeStream>, ProviderError> {
        let chunks = self.chunks.clone().into_iter().map(Ok);
        let mut meta = StartMeta::new();
        meta.insert("request_id".into(), json!("scripted-1"));
        Ok(StarterOutput::WithMeta(Box::pin(stream::iter(chunks)), meta))
    }

    fn translate(&self, chunk: &Value) -> Option<String> {
        chunk.get("text").and_then(Value::as_str).map(ToOwned::to_owned)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), GatewayError> {
    init_observability();

    let gateway = Gateway::builder()
        .register_backend(Arc::new(ScriptedBackend {
            chunks: vec![
                json!({"text": "Hello"}),
                json!({"keepalive": true}),
                json!({"text": ", world"}),
            ],
        }))
        .config(StreamingConfig::from_env()?)
        .build()?;

    let mut events = gateway.stream(
        StreamRequest::new(ModelRef::new("scripted", "demo-1")).user_text("Say hello"),
    )?;

    while let Some(event) = events.next_event().await {
        if let Some(delta) = &event.delta {
            print!("{delta}");
        }
        if event.finish {
            println!();
            match (&event.error, &event.metrics) {
                (Some(error), _) => eprintln!("stream error: {error}"),
                (None, Some(metrics)) => eprintln!(
                    "emitted={} first_content_ms={:?} total_ms={:?}",
                    metrics.emitted_count,
                    metrics.time_to_first_content_ms,
                    metrics.total_duration_ms
                ),
                (None, None) => {}
            }
        }
    }
    Ok(())
}
