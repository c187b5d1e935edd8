//! Message segments: the typed units inside a composite message.
//!
//! Inbound segment arrays are tolerant by design. Backends sometimes send a
//! plain string instead of an array, omit `data` fields, or introduce segment
//! types this bridge has never seen; none of those may abort frame handling.

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

/// One typed unit within a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Verbatim text, newlines preserved.
    Text { text: String },
    /// An image reference: URL, path, or `base64://` inline payload.
    Image { file: String },
    /// A forwarded-message wrapper carrying nested content.
    Node(ForwardNode),
    /// Any segment type the bridge does not model; the tag is kept so
    /// flattened previews can render it as `[tag]`.
    Other { kind: String },
}

/// Nested content of a `node` segment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ForwardNode {
    pub sender_name: Option<String>,
    pub content: Vec<Segment>,
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text { text: text.into() }
    }

    fn from_parts(kind: &str, data: &Value) -> Self {
        match kind {
            "text" => Segment::Text {
                text: data
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "image" => Segment::Image {
                file: data
                    .get("file")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "node" => Segment::Node(ForwardNode {
                sender_name: data
                    .get("name")
                    .or_else(|| data.get("nickname"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                content: data.get("content").map(parse_segments).unwrap_or_default(),
            }),
            other => Segment::Other {
                kind: other.to_string(),
            },
        }
    }

    fn kind(&self) -> &str {
        match self {
            Segment::Text { .. } => "text",
            Segment::Image { .. } => "image",
            Segment::Node(_) => "node",
            Segment::Other { kind } => kind,
        }
    }

    fn data_value(&self) -> Value {
        match self {
            Segment::Text { text } => serde_json::json!({ "text": text }),
            Segment::Image { file } => serde_json::json!({ "file": file }),
            Segment::Node(node) => {
                let mut data = serde_json::Map::new();
                if let Some(name) = &node.sender_name {
                    data.insert("name".into(), Value::String(name.clone()));
                }
                data.insert(
                    "content".into(),
                    serde_json::to_value(&node.content).unwrap_or(Value::Null),
                );
                Value::Object(data)
            }
            Segment::Other { .. } => Value::Object(serde_json::Map::new()),
        }
    }
}

/// Parse a message payload that is either a segment array or a bare string.
/// Anything else yields no segments.
pub fn parse_segments(value: &Value) -> Vec<Segment> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let kind = item.get("type").and_then(Value::as_str).unwrap_or("");
                let data = item.get("data").cloned().unwrap_or(Value::Null);
                Segment::from_parts(kind, &data)
            })
            .collect(),
        Value::String(text) => vec![Segment::text(text.clone())],
        _ => Vec::new(),
    }
}

impl Serialize for Segment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", self.kind())?;
        map.serialize_entry("data", &self.data_value())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Segment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        Ok(Segment::from_parts(kind, &data))
    }
}
