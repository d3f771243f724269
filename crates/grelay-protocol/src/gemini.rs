//! Gemini `streamGenerateContent` chunk shapes, read leniently.
//!
//! Upstream chunks carry many more fields than the recovery engine looks at; those are
//! left in the raw JSON that is forwarded verbatim and are not modelled here.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Not part of the documented candidate shape, but some upstream revisions put it here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Kept raw: only a literal `true` marks a thought part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<JsonValue>,
}

impl Part {
    pub fn is_thought(&self) -> bool {
        matches!(self.thought, Some(JsonValue::Bool(true)))
    }
}

/// Why generation stopped. Unknown upstream values are kept as [`FinishReason::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Recitation,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "STOP",
            FinishReason::MaxTokens => "MAX_TOKENS",
            FinishReason::Safety => "SAFETY",
            FinishReason::Recitation => "RECITATION",
            FinishReason::Other(value) => value.as_str(),
        }
    }
}

impl From<String> for FinishReason {
    fn from(value: String) -> Self {
        match value.as_str() {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::MaxTokens,
            "SAFETY" => FinishReason::Safety,
            "RECITATION" => FinishReason::Recitation,
            _ => FinishReason::Other(value),
        }
    }
}

impl From<FinishReason> for String {
    fn from(value: FinishReason) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_parses_thought_and_finish() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hm","thought":true}]},"finishReason":"STOP","index":0}],"usageMetadata":{"totalTokenCount":3}}"#,
        )
        .unwrap();
        let candidate = &chunk.candidates[0];
        assert_eq!(candidate.finish_reason, Some(FinishReason::Stop));
        let part = &candidate.content.as_ref().unwrap().parts[0];
        assert!(part.is_thought());
        assert_eq!(part.text.as_deref(), Some("hm"));
    }

    #[test]
    fn unknown_finish_reason_is_kept() {
        let reason: FinishReason = serde_json::from_str("\"MALFORMED_FUNCTION_CALL\"").unwrap();
        assert_eq!(
            reason,
            FinishReason::Other("MALFORMED_FUNCTION_CALL".to_string())
        );
        assert_eq!(reason.as_str(), "MALFORMED_FUNCTION_CALL");
    }

    #[test]
    fn thought_must_be_literal_true() {
        let part: Part = serde_json::from_str(r#"{"text":"a","thought":false}"#).unwrap();
        assert!(!part.is_thought());
        let part: Part = serde_json::from_str(r#"{"text":"a"}"#).unwrap();
        assert!(!part.is_thought());
        let part: Part = serde_json::from_str(r#"{"text":"a","thought":"true"}"#).unwrap();
        assert!(!part.is_thought());
    }
}
