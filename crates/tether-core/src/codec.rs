use std::sync::Arc;

use serde_json::Value;

use crate::errors::InvalidData;

/// Hook applied to each message before it is serialized. The escape hatch
/// for callers whose values need massaging into plain JSON first.
pub type EncodeHook = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Hook applied to each decoded value before it is passed up.
pub type DecodeHook = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// JSON codec for SockJS payloads.
///
/// Output is compact: items separated by a single `,`, keys from values by a
/// single `:`, no other whitespace.
#[derive(Clone, Default)]
pub struct JsonCodec {
    encode_hook: Option<EncodeHook>,
    decode_hook: Option<DecodeHook>,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encode_hook(mut self, hook: EncodeHook) -> Self {
        self.encode_hook = Some(hook);
        self
    }

    pub fn with_decode_hook(mut self, hook: DecodeHook) -> Self {
        self.decode_hook = Some(hook);
        self
    }

    /// Serialize one value, applying the encode hook if present.
    pub fn encode(&self, value: &Value) -> Vec<u8> {
        let transformed;
        let value = match &self.encode_hook {
            Some(hook) => {
                transformed = hook(value.clone());
                &transformed
            }
            None => value,
        };
        // Serializing a Value cannot fail: map keys are always strings.
        serde_json::to_vec(value).expect("JSON value serialization is infallible")
    }

    /// Serialize a batch of messages as a JSON array, applying the encode
    /// hook to each message.
    pub fn encode_messages(&self, messages: &[Value]) -> Vec<u8> {
        let array = match &self.encode_hook {
            Some(hook) => Value::Array(messages.iter().map(|m| hook(m.clone())).collect()),
            None => Value::Array(messages.to_vec()),
        };
        serde_json::to_vec(&array).expect("JSON value serialization is infallible")
    }

    /// Decode one inbound payload, applying the decode hook if present.
    pub fn decode(&self, data: &[u8]) -> Result<Value, InvalidData> {
        if data.is_empty() {
            return Err(InvalidData::NoPayload);
        }
        let value: Value = serde_json::from_slice(data).map_err(|_| InvalidData::BadJson)?;
        Ok(match &self.decode_hook {
            Some(hook) => hook(value),
            None => value,
        })
    }
}

impl std::fmt::Debug for JsonCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonCodec")
            .field("encode_hook", &self.encode_hook.is_some())
            .field("decode_hook", &self.decode_hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_is_compact() {
        let codec = JsonCodec::new();
        let encoded = codec.encode(&json!([3000, "Go away!"]));
        assert_eq!(encoded, br#"[3000,"Go away!"]"#);

        let encoded = codec.encode(&json!({"a": 1, "b": [2, 3]}));
        assert_eq!(encoded, br#"{"a":1,"b":[2,3]}"#);
    }

    #[test]
    fn encode_messages_aggregates() {
        let codec = JsonCodec::new();
        let encoded = codec.encode_messages(&[json!("letter"), json!(2)]);
        assert_eq!(encoded, br#"["letter",2]"#);
    }

    #[test]
    fn decode_roundtrip() {
        let codec = JsonCodec::new();
        let value = json!({"k": ["v", 1, null, true]});
        let decoded = codec.decode(&codec.encode(&value)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn decode_empty_is_no_payload() {
        let codec = JsonCodec::new();
        assert_eq!(codec.decode(b""), Err(InvalidData::NoPayload));
    }

    #[test]
    fn decode_garbage_is_bad_json() {
        let codec = JsonCodec::new();
        assert_eq!(codec.decode(b"!!!"), Err(InvalidData::BadJson));
    }

    #[test]
    fn encode_hook_transforms_each_message() {
        // Model a caller type as a tagged object on the wire.
        let codec = JsonCodec::new().with_encode_hook(Arc::new(|v| match v {
            Value::Object(map) if map.contains_key("point") => map["point"].clone(),
            other => other,
        }));
        let encoded = codec.encode_messages(&[json!({"point": [2.0, 1.0]})]);
        assert_eq!(encoded, br#"[[2.0,1.0]]"#);
    }

    #[test]
    fn decode_hook_transforms_value() {
        let codec = JsonCodec::new().with_decode_hook(Arc::new(|v| match v {
            Value::Array(items) => json!({ "items": items }),
            other => other,
        }));
        let decoded = codec.decode(br#"[1,2,3]"#).unwrap();
        assert_eq!(decoded, json!({"items": [1, 2, 3]}));
    }

    #[test]
    fn hooks_roundtrip() {
        // encode: wrap; decode: unwrap. decode(encode(x)) == x.
        let codec = JsonCodec::new()
            .with_encode_hook(Arc::new(|v| json!({ "wrapped": v })))
            .with_decode_hook(Arc::new(|v| v["wrapped"].clone()));
        let value = json!(["a", 1]);
        assert_eq!(codec.decode(&codec.encode(&value)).unwrap(), value);
    }
}
