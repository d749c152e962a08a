use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Txt2img,
    Img2img,
}

impl QueryKind {
    pub fn endpoint(self) -> &'static str {
        match self {
            QueryKind::Txt2img => "txt2img",
            QueryKind::Img2img => "img2img",
        }
    }
}

/// Request payload for the backend, one per resolved draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendQuery {
    pub kind: QueryKind,
    /// Short id of the draft this query was built from.
    pub draft_id: String,
    pub payload: Map<String, Value>,
}

impl BackendQuery {
    /// The payload shape follows from the presence of init images alone.
    pub fn new(draft_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        let has_init_images = payload
            .get("init_images")
            .and_then(Value::as_array)
            .is_some_and(|rows| !rows.is_empty());
        let kind = if has_init_images {
            QueryKind::Img2img
        } else {
            QueryKind::Txt2img
        };
        Self {
            kind,
            draft_id: draft_id.into(),
            payload,
        }
    }

    pub fn endpoint(&self) -> &'static str {
        self.kind.endpoint()
    }

    pub fn prompt(&self) -> &str {
        self.payload
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn first_init_image(&self) -> Option<&str> {
        self.payload
            .get("init_images")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(Value::as_str)
    }

    /// Payload copy safe for logs: base64 image blobs are replaced.
    pub fn sanitized(&self) -> Value {
        let mut root = Map::new();
        root.insert(
            "kind".to_string(),
            Value::String(self.kind.endpoint().to_string()),
        );
        root.insert("draft_id".to_string(), Value::String(self.draft_id.clone()));
        root.insert(
            "payload".to_string(),
            sanitize_payload(&Value::Object(self.payload.clone())),
        );
        Value::Object(root)
    }
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "init_images" | "image" | "input_image" | "mask"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}
