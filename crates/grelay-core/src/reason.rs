use std::fmt;

use serde::Serialize;

/// Why an attempt ended without a usable, complete answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptReason {
    /// `STOP` arrived before the session produced any formal text.
    StopWithoutAnswer,
    /// `STOP` arrived but the accumulated text fails the completion judge.
    FinishIncomplete,
    FinishSafety,
    FinishRecitation,
    /// Any other non-`MAX_TOKENS` finish reason.
    FinishAbnormal,
    /// Explicit block signal, regardless of finish reason.
    Block,
    DropDuringReasoning,
    DropUnexpected,
    FetchError,
}

impl InterruptReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptReason::StopWithoutAnswer => "STOP_WITHOUT_ANSWER",
            InterruptReason::FinishIncomplete => "FINISH_INCOMPLETE",
            InterruptReason::FinishSafety => "FINISH_SAFETY",
            InterruptReason::FinishRecitation => "FINISH_RECITATION",
            InterruptReason::FinishAbnormal => "FINISH_ABNORMAL",
            InterruptReason::Block => "BLOCK",
            InterruptReason::DropDuringReasoning => "DROP_DURING_REASONING",
            InterruptReason::DropUnexpected => "DROP_UNEXPECTED",
            InterruptReason::FetchError => "FETCH_ERROR",
        }
    }

    /// Policy-triggered stops: safety, recitation, and explicit blocks.
    pub fn is_policy_signal(&self) -> bool {
        matches!(
            self,
            InterruptReason::FinishSafety | InterruptReason::FinishRecitation | InterruptReason::Block
        )
    }
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
