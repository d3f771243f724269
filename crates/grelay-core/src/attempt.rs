use std::time::Instant;

use serde::Serialize;

use crate::payload::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    Pending,
    Reasoning,
    /// Terminal for the attempt: later thought-only parts do not revert it.
    Answering,
}

/// One physical upstream connection within a session.
#[derive(Debug)]
pub struct Attempt {
    pub index: u32,
    pub started_at: Instant,
    pub state: AttemptState,
    pub lines: u64,
    pub text: String,
}

impl Attempt {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            started_at: Instant::now(),
            state: AttemptState::Pending,
            lines: 0,
            text: String::new(),
        }
    }

    /// Applies one payload to the state machine and records its answer text.
    pub fn observe(&mut self, payload: &Payload) {
        let answers = payload
            .parts
            .iter()
            .any(|part| !part.thought && !part.text.is_empty());
        let reasons = payload
            .parts
            .iter()
            .any(|part| part.thought || part.function_call);

        if answers {
            self.state = AttemptState::Answering;
        } else if reasons && self.state == AttemptState::Pending {
            self.state = AttemptState::Reasoning;
        }

        self.text.push_str(&payload.answer_text());
    }

    pub fn is_answering(&self) -> bool {
        self.state == AttemptState::Answering
    }
}
