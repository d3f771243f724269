use serde_json::{Value as JsonValue, json};

/// Top-level camelCase fields and their snake_case spellings. The upstream rejects a
/// body that carries both.
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("systemInstruction", "system_instruction"),
    ("generationConfig", "generation_config"),
    ("safetySettings", "safety_settings"),
    ("toolConfig", "tool_config"),
    ("cachedContent", "cached_content"),
];

/// Builds the body for the next attempt: a deep copy of the original request with the
/// partial answer (as a `model` turn) and a continuation instruction (as a `user` turn)
/// inserted right after the last pre-existing `user` turn.
pub(crate) fn build_retry_body(
    original: &JsonValue,
    accumulated: &str,
    continuation_prompt: &str,
) -> JsonValue {
    let mut body = original.clone();
    strip_alias_fields(&mut body);

    let partial = sanitize_text(accumulated);
    if partial.trim().is_empty() {
        return body;
    }
    let Some(object) = body.as_object_mut() else {
        return body;
    };

    let contents = object
        .entry("contents")
        .or_insert_with(|| JsonValue::Array(Vec::new()));
    if !contents.is_array() {
        *contents = JsonValue::Array(Vec::new());
    }
    if let JsonValue::Array(turns) = contents {
        let insert_at = turns
            .iter()
            .rposition(|turn| turn.get("role").and_then(JsonValue::as_str) == Some("user"))
            .map(|idx| idx + 1)
            .unwrap_or(turns.len());
        let synthetic = [
            json!({ "role": "model", "parts": [{ "text": partial }] }),
            json!({ "role": "user", "parts": [{ "text": continuation_prompt }] }),
        ];
        turns.splice(insert_at..insert_at, synthetic);
    }

    body
}

pub(crate) fn strip_alias_fields(body: &mut JsonValue) {
    let Some(object) = body.as_object_mut() else {
        return;
    };
    for (canonical, alias) in FIELD_ALIASES {
        if object.contains_key(*canonical) {
            object.remove(*alias);
        }
    }
}

/// Drops control characters other than line breaks and tabs. Quotes and backslashes
/// are kept; `serde_json` escapes them when the body is serialized.
pub(crate) fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|ch| !ch.is_control() || matches!(ch, '\n' | '\r' | '\t'))
        .collect()
}
