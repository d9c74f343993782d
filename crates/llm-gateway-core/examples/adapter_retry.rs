use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::{StreamExt as _, stream};
use llm_gateway_core::prelude::*;
use serde_json::{Value, json};

// Drives the adapter directly with a starter that is overloaded twice before
// it hands out a stream.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_observability();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let starter = move || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if attempt < 3 {
                return Err(ProviderError::provider("local", "overloaded", Some(503)));
            }
            let chunks: Vec<Result<Value, ProviderError>> =
                vec![Ok(json!({"delta": "third"})), Ok(json!({"delta": " time lucky"}))];
            Ok(StarterOutput::Bare(stream::iter(chunks)))
        }
    };

    let translators = Translators::<Value>::text(|chunk: &Value| {
        chunk.get("delta").and_then(Value::as_str).map(ToOwned::to_owned)
    });

    let events: Vec<StreamEvent> = StreamAdapter::new(ModelRef::new("local", "tiny"))
        .retry_config(|phase| match phase {
            Phase::Start => RetryPolicy::new(3, 0.1),
            _ => RetryPolicy::single_attempt(),
        })
        .sink(Arc::new(TracingSink::new()))
        .stream(starter, translators)
        .collect()
        .await;

    for event in &events {
        println!("{}", serde_json::to_string(event).unwrap_or_default());
    }
    println!("start attempts: {}", calls.load(Ordering::SeqCst));
}
