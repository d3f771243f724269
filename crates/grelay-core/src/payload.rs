use grelay_protocol::gemini::{FinishReason, StreamChunk};
use grelay_protocol::sse::DATA_PREFIX;

/// What one protocol line means to the recovery logic.
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    /// Not a `data: ` line (comment, heartbeat, `event:` header). Forwarded, otherwise ignored.
    Passthrough,
    /// A `data: ` line whose JSON could not be read. Forwarded, never touches state.
    Malformed(String),
    Data(Payload),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartView {
    pub text: String,
    pub thought: bool,
    pub function_call: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// Text of the first content part, empty when absent.
    pub text: String,
    /// Whether the first content part is explicitly marked `thought: true`.
    pub is_thought: bool,
    pub parts: Vec<PartView>,
    pub finish_reason: Option<FinishReason>,
    pub blocked: bool,
}

impl Payload {
    /// Non-thought text of every part, in order.
    pub fn answer_text(&self) -> String {
        self.parts
            .iter()
            .filter(|part| !part.thought)
            .map(|part| part.text.as_str())
            .collect()
    }

    pub fn thought_chars(&self) -> usize {
        self.parts
            .iter()
            .filter(|part| part.thought)
            .map(|part| part.text.chars().count())
            .sum()
    }

    /// Carries parts, and every one of them is a thought.
    pub fn is_thought_only(&self) -> bool {
        !self.parts.is_empty() && self.parts.iter().all(|part| part.thought)
    }
}

pub fn classify_line(line: &str) -> LineKind {
    let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
        return LineKind::Passthrough;
    };
    let Some(start) = rest.find('{') else {
        return LineKind::Malformed("no json object in data line".to_string());
    };
    match serde_json::from_str::<StreamChunk>(&rest[start..]) {
        Ok(chunk) => LineKind::Data(payload_from_chunk(chunk)),
        Err(err) => LineKind::Malformed(err.to_string()),
    }
}

fn payload_from_chunk(chunk: StreamChunk) -> Payload {
    let blocked = chunk
        .prompt_feedback
        .as_ref()
        .is_some_and(|feedback| feedback.block_reason.is_some())
        || chunk
            .candidates
            .iter()
            .any(|candidate| candidate.block_reason.is_some());

    let first = chunk.candidates.into_iter().next();
    let finish_reason = first
        .as_ref()
        .and_then(|candidate| candidate.finish_reason.clone());
    let parts = first
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .map(|part| PartView {
                    thought: part.is_thought(),
                    function_call: part.function_call.is_some(),
                    text: part.text.unwrap_or_default(),
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let (text, is_thought) = parts
        .first()
        .map(|part| (part.text.clone(), part.thought))
        .unwrap_or_default();

    Payload {
        text,
        is_thought,
        parts,
        finish_reason,
        blocked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(line: &str) -> Payload {
        match classify_line(line) {
            LineKind::Data(payload) => payload,
            other => panic!("expected data line, got {other:?}"),
        }
    }

    #[test]
    fn non_data_lines_pass_through() {
        assert_eq!(classify_line(": keep-alive"), LineKind::Passthrough);
        assert_eq!(classify_line("event: message"), LineKind::Passthrough);
        assert_eq!(classify_line("data:{\"a\":1}"), LineKind::Passthrough);
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(matches!(
            classify_line("data: {\"candidates\": [}"),
            LineKind::Malformed(_)
        ));
        assert!(matches!(classify_line("data: [DONE]"), LineKind::Malformed(_)));
        assert!(matches!(
            classify_line("data: {\"candidates\": 7}"),
            LineKind::Malformed(_)
        ));
    }

    #[test]
    fn extracts_text_and_finish_reason() {
        let payload = data(
            r#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"Hello"}]},"finishReason":"STOP"}]}"#,
        );
        assert_eq!(payload.text, "Hello");
        assert!(!payload.is_thought);
        assert_eq!(payload.finish_reason, Some(FinishReason::Stop));
        assert!(!payload.blocked);
        assert_eq!(payload.answer_text(), "Hello");
    }

    #[test]
    fn thought_parts_are_not_answer_text() {
        let payload = data(
            r#"data: {"candidates":[{"content":{"parts":[{"text":"thinking...","thought":true}]}}]}"#,
        );
        assert!(payload.is_thought);
        assert!(payload.is_thought_only());
        assert_eq!(payload.answer_text(), "");
        assert_eq!(payload.thought_chars(), 11);
    }

    #[test]
    fn leading_garbage_before_object_is_skipped() {
        let payload = data(r#"data: x{"candidates":[{"content":{"parts":[{"text":"a"}]}}]}"#);
        assert_eq!(payload.text, "a");
    }

    #[test]
    fn block_reason_anywhere_marks_blocked() {
        let payload = data(r#"data: {"promptFeedback":{"blockReason":"SAFETY"}}"#);
        assert!(payload.blocked);
        assert!(payload.parts.is_empty());

        let payload = data(
            r#"data: {"candidates":[{"content":{"parts":[]}},{"blockReason":"OTHER","content":{"parts":[]}}]}"#,
        );
        assert!(payload.blocked);
    }

    #[test]
    fn empty_payload_is_still_data() {
        let payload = data(r#"data: {"usageMetadata":{"totalTokenCount":12}}"#);
        assert_eq!(payload.text, "");
        assert_eq!(payload.finish_reason, None);
        assert!(!payload.is_thought_only());
    }

    #[test]
    fn function_call_parts_are_flagged() {
        let payload = data(
            r#"data: {"candidates":[{"content":{"parts":[{"functionCall":{"name":"f","args":{}}}]}}]}"#,
        );
        assert!(payload.parts[0].function_call);
        assert!(!payload.is_thought_only());
    }
}
