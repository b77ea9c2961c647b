use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Error type produced by codec implementations.
pub type CodecError = Box<dyn std::error::Error + Send + Sync>;

/// Transformation applied to the payload of a tagged value.
pub type TagHandler = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Registry of tag handlers, consulted by the codec on encode and decode.
///
/// Registries are read-mostly: the store holds them behind an RCU cell and
/// operations observe whichever registry was installed when they started.
#[derive(Clone, Default)]
pub struct Handlers {
    by_tag: HashMap<String, TagHandler>,
}

impl Handlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `tag`, chainable.
    #[must_use]
    pub fn with<F>(mut self, tag: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.by_tag.insert(tag.into(), Arc::new(handler));
        self
    }

    pub(crate) fn get(&self, tag: &str) -> Option<&TagHandler> {
        self.by_tag.get(tag)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").field("tags", &self.by_tag.keys().collect::<Vec<_>>()).finish()
    }
}

/// Pluggable serialization boundary.
///
/// Implementations must produce a self-delimiting payload that round-trips
/// arbitrary value shapes. The store treats the payload as opaque bytes.
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value, handlers: &Handlers) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8], handlers: &Handlers) -> Result<Value, CodecError>;
}

/// Key of the tag member in a tagged-value envelope.
pub const TAG_KEY: &str = "@tag";
/// Key of the payload member in a tagged-value envelope.
pub const TAG_VALUE_KEY: &str = "@value";

/// Default codec: JSON payloads with tagged-value handler support.
///
/// A map of the exact shape `{"@tag": <string>, "@value": <payload>}` is a
/// tagged value; when a handler is registered for its tag, the payload is
/// rewritten through the handler (write handlers before encoding, read
/// handlers after decoding). Everything else passes through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value, handlers: &Handlers) -> Result<Vec<u8>, CodecError> {
        if handlers.is_empty() {
            return Ok(serde_json::to_vec(value)?);
        }
        let rewritten = apply_handlers(value.clone(), handlers);
        Ok(serde_json::to_vec(&rewritten)?)
    }

    fn decode(&self, bytes: &[u8], handlers: &Handlers) -> Result<Value, CodecError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Ok(apply_handlers(value, handlers))
    }
}

fn apply_handlers(value: Value, handlers: &Handlers) -> Value {
    if handlers.is_empty() {
        return value;
    }
    match value {
        Value::Object(mut map) => {
            let handler = if map.len() == 2 {
                map.get(TAG_KEY).and_then(Value::as_str).and_then(|tag| handlers.get(tag)).cloned()
            } else {
                None
            };
            if let Some(handler) = handler {
                if let Some(payload) = map.remove(TAG_VALUE_KEY) {
                    let rewritten = handler(apply_handlers(payload, handlers));
                    map.insert(TAG_VALUE_KEY.to_owned(), rewritten);
                    return Value::Object(map);
                }
            }
            Value::Object(map.into_iter().map(|(k, v)| (k, apply_handlers(v, handlers))).collect())
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| apply_handlers(v, handlers)).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec;
        let handlers = Handlers::new();
        let value = json!({"a": [1, 2.5, "three"], "b": {"nested": null}, "c": true});

        let bytes = codec.encode(&value, &handlers).unwrap();
        assert_eq!(codec.decode(&bytes, &handlers).unwrap(), value);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(JsonCodec.decode(b"{not json", &Handlers::new()).is_err());
    }

    #[test]
    fn test_read_handler_rewrites_tagged_payload() {
        let handlers = Handlers::new().with("instant", |v| json!({"epoch": v}));
        let bytes = serde_json::to_vec(&json!({"at": {"@tag": "instant", "@value": 1000}}))
            .unwrap();

        let decoded = JsonCodec.decode(&bytes, &handlers).unwrap();
        assert_eq!(decoded, json!({"at": {"@tag": "instant", "@value": {"epoch": 1000}}}));
    }

    #[test]
    fn test_write_handler_applies_inside_sequences() {
        let handlers = Handlers::new().with("upper", |v| {
            Value::String(v.as_str().unwrap_or_default().to_uppercase())
        });
        let value = json!([{"@tag": "upper", "@value": "shout"}, "leave me"]);

        let bytes = JsonCodec.encode(&value, &handlers).unwrap();
        let plain: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(plain, json!([{"@tag": "upper", "@value": "SHOUT"}, "leave me"]));
    }

    #[test]
    fn test_unregistered_tags_pass_through() {
        let handlers = Handlers::new().with("known", |v| v);
        let value = json!({"@tag": "unknown", "@value": 7});

        let bytes = JsonCodec.encode(&value, &handlers).unwrap();
        assert_eq!(JsonCodec.decode(&bytes, &handlers).unwrap(), value);
    }
}
