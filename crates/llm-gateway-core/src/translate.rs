//! Caller-supplied mapping from opaque native chunks to uniform content.
//!
//! Translators are pure and infallible: a chunk that carries no content and a
//! chunk that could not be understood both map to `None`, and the adapter
//! drops either one without emitting an event.

use serde_json::Value;

/// Maps a native chunk to an optional text delta.
pub trait Translator<C>: Send + Sync {
    fn translate(&self, chunk: &C) -> Option<String>;
}

impl<C, F> Translator<C> for F
where
    F: Fn(&C) -> Option<String> + Send + Sync,
{
    fn translate(&self, chunk: &C) -> Option<String> {
        self(chunk)
    }
}

/// Maps a native chunk to an optional structured partial (for example partial
/// tool-call arguments).
pub trait StructuredTranslator<C>: Send + Sync {
    fn translate_structured(&self, chunk: &C) -> Option<Value>;
}

impl<C, F> StructuredTranslator<C> for F
where
    F: Fn(&C) -> Option<Value> + Send + Sync,
{
    fn translate_structured(&self, chunk: &C) -> Option<Value> {
        self(chunk)
    }
}

/// Text translator plus an optional structured translator for one stream.
pub struct Translators<C> {
    text: Box<dyn Translator<C>>,
    structured: Option<Box<dyn StructuredTranslator<C>>>,
}

/// Content pulled out of one chunk. At least one side is non-empty.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Translated {
    pub delta: Option<String>,
    pub structured: Option<Value>,
}

impl<C: 'static> Translators<C> {
    pub fn text(translator: impl Translator<C> + 'static) -> Self {
        Self {
            text: Box::new(translator),
            structured: None,
        }
    }

    pub fn with_structured(mut self, translator: impl StructuredTranslator<C> + 'static) -> Self {
        self.structured = Some(Box::new(translator));
        self
    }

    /// Applies both translators; `None` when neither produced content.
    pub(crate) fn apply(&self, chunk: &C) -> Option<Translated> {
        let delta = self.text.translate(chunk).filter(|text| !text.is_empty());
        let structured = self
            .structured
            .as_ref()
            .and_then(|t| t.translate_structured(chunk))
            .filter(|value| !is_empty_value(value));
        if delta.is_none() && structured.is_none() {
            return None;
        }
        Some(Translated { delta, structured })
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
