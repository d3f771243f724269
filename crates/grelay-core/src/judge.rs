use grelay_common::RecoveryConfig;

/// Decides whether accumulated answer text looks finished.
///
/// Advisory only: it turns an upstream `STOP` into either acceptance or a forced retry
/// when the output looks cut off mid-sentence.
#[derive(Debug, Clone)]
pub struct CompletionJudge {
    finish_token: String,
    terminal_chars: Vec<char>,
}

impl CompletionJudge {
    pub fn new(finish_token: impl Into<String>, terminal_chars: &str) -> Self {
        Self {
            finish_token: finish_token.into(),
            terminal_chars: terminal_chars.chars().collect(),
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(config.finish_token.clone(), &config.terminal_chars)
    }

    pub fn is_complete(&self, text: &str) -> bool {
        let trimmed = text.trim_end();
        if trimmed.is_empty() {
            return true;
        }
        if !self.finish_token.is_empty() && trimmed.ends_with(self.finish_token.as_str()) {
            return true;
        }
        trimmed
            .chars()
            .next_back()
            .is_some_and(|last| self.terminal_chars.contains(&last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn judge() -> CompletionJudge {
        CompletionJudge::from_config(&RecoveryConfig::default())
    }

    #[test]
    fn terminal_punctuation_is_complete() {
        let judge = judge();
        for text in [
            "Done.",
            "Really?",
            "Wow!",
            "完成了。",
            "是吗？",
            "好！",
            "(see above)",
            "list [a]",
            "map {}",
            "he said \"yes\"",
            "```rust\nfn main() {}\n```",
            "trailing spaces.   \n\n",
        ] {
            assert!(judge.is_complete(text), "{text:?} should be complete");
        }
    }

    #[test]
    fn mid_word_is_incomplete() {
        let judge = judge();
        assert!(!judge.is_complete("The answer is defin"));
        assert!(!judge.is_complete("Step 1, then"));
        assert!(!judge.is_complete("中文没有结束"));
    }

    #[test]
    fn empty_text_has_nothing_to_judge() {
        assert!(judge().is_complete(""));
        assert!(judge().is_complete("  \n\t"));
    }

    #[test]
    fn finish_token_overrides_punctuation() {
        let judge = judge();
        assert!(judge.is_complete("all good [done]"));
        assert!(judge.is_complete("all good [done]\n"));
        assert!(!judge.is_complete("all good [don"));
    }

    #[test]
    fn custom_configuration() {
        let judge = CompletionJudge::new("<END>", ";");
        assert!(judge.is_complete("x = 1;"));
        assert!(judge.is_complete("bye<END>"));
        assert!(!judge.is_complete("Sentence."));
    }
}
