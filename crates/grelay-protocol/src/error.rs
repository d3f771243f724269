use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Canonical `{ "error": { ... } }` envelope, same shape the Gemini API returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<JsonValue>,
}

impl ErrorEnvelope {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
                status: status_label(code).to_string(),
                details: Vec::new(),
            },
        }
    }

    pub fn with_detail(mut self, detail: JsonValue) -> Self {
        self.error.details.push(detail);
        self
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

pub fn status_label(code: u16) -> &'static str {
    match code {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        409 => "ABORTED",
        429 => "RESOURCE_EXHAUSTED",
        499 => "CANCELLED",
        500 => "INTERNAL",
        501 => "UNIMPLEMENTED",
        502 | 503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "UNKNOWN",
    }
}

/// True when `value` already looks like `{ "error": { "code": <number > 0>, ... } }`.
pub fn is_canonical_error(value: &JsonValue) -> bool {
    value
        .get("error")
        .filter(|error| error.is_object())
        .and_then(|error| error.get("code"))
        .and_then(JsonValue::as_f64)
        .is_some_and(|code| code > 0.0)
}
