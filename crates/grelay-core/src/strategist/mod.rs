//! Cross-attempt memory and the retry/give-up decision.

mod rebuild;
mod threshold;

use std::sync::Arc;
use std::time::{Duration, Instant};

use grelay_common::RecoveryConfig;
use rand::Rng;
use serde::Serialize;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::attempt::AttemptState;
use crate::reason::InterruptReason;

use self::threshold::AdaptiveThreshold;

/// Backoff growth factor of 1.8, kept in integer tenths.
const DELAY_GROWTH_TENTHS: u64 = 18;
const UNIFORM_GAP_TOLERANCE: f64 = 0.25;
const UNIFORM_GAP_WIDENING: f64 = 1.5;

/// One interruption of the session. Never mutated after it is recorded.
#[derive(Debug, Clone, Serialize)]
pub struct InterruptionRecord {
    pub reason: InterruptReason,
    /// Accumulated answer length (chars) when the attempt ended.
    pub text_len: usize,
    /// Chars gained since the previous record.
    pub progress: usize,
    pub state: AttemptState,
    #[serde(skip)]
    pub at: Instant,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub retries: u32,
    pub max_retries: u32,
    pub final_state: Option<AttemptState>,
    pub produced_answer: bool,
    pub accumulated_chars: usize,
    pub content_issue: bool,
    pub progress_threshold: f64,
    pub interruptions: Vec<InterruptionRecord>,
}

#[derive(Debug, Clone)]
pub enum RetryAction {
    Retry {
        delay: Duration,
        body: JsonValue,
        content_issue: bool,
    },
    GiveUp {
        report: RecoveryReport,
    },
}

#[derive(Debug)]
pub struct Strategist {
    config: Arc<RecoveryConfig>,
    original_body: JsonValue,
    records: Vec<InterruptionRecord>,
    consecutive_retries: u32,
    previous_delay: Option<Duration>,
    threshold: AdaptiveThreshold,
    accumulated_chars: usize,
    thought_chars: usize,
    answer_chars: usize,
}

impl Strategist {
    pub fn new(config: Arc<RecoveryConfig>, original_body: JsonValue) -> Self {
        let threshold = AdaptiveThreshold::new(config.progress_threshold_chars);
        Self {
            config,
            original_body,
            records: Vec::new(),
            consecutive_retries: 0,
            previous_delay: None,
            threshold,
            accumulated_chars: 0,
            thought_chars: 0,
            answer_chars: 0,
        }
    }

    pub fn record_interruption(
        &mut self,
        reason: InterruptReason,
        accumulated_text: &str,
        state: AttemptState,
    ) -> &InterruptionRecord {
        let text_len = accumulated_text.chars().count();
        let previous_len = self.records.last().map_or(0, |record| record.text_len);
        let progress = text_len.saturating_sub(previous_len);

        self.accumulated_chars = text_len;
        self.consecutive_retries = self.consecutive_retries.saturating_add(1);
        self.threshold.observe(progress);

        self.records.push(InterruptionRecord {
            reason,
            text_len,
            progress,
            state,
            at: Instant::now(),
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        });
        &self.records[self.records.len() - 1]
    }

    /// Thought and answer chars forwarded so far, used by the reasoning-ratio rule.
    pub fn note_output(&mut self, thought_chars: usize, answer_chars: usize) {
        self.thought_chars = self.thought_chars.saturating_add(thought_chars);
        self.answer_chars = self.answer_chars.saturating_add(answer_chars);
    }

    /// True when any single heuristic says the model keeps failing for content reasons
    /// rather than transient network trouble.
    pub fn is_likely_content_issue(&self) -> bool {
        self.policy_signal()
            || self.stalled_progress()
            || self.stuck_at_same_point()
            || self.repeated_empty_stops()
            || self.reasoning_dominates()
    }

    fn policy_signal(&self) -> bool {
        self.records
            .last()
            .is_some_and(|record| record.reason.is_policy_signal())
    }

    fn stalled_progress(&self) -> bool {
        let Some(last_two) = self.records.last_chunk::<2>() else {
            return false;
        };
        let threshold = self.threshold.current();
        last_two
            .iter()
            .all(|record| (record.progress as f64) < threshold)
    }

    fn stuck_at_same_point(&self) -> bool {
        let Some(last_three) = self.records.last_chunk::<3>() else {
            return false;
        };
        let lengths = last_three.iter().map(|record| record.text_len);
        let spread = lengths.clone().max().unwrap_or(0) - lengths.min().unwrap_or(0);

        let mut threshold = self.config.variance_threshold_chars as f64;
        if gaps_are_uniform(last_three) {
            threshold *= UNIFORM_GAP_WIDENING;
        }
        (spread as f64) < threshold
    }

    fn repeated_empty_stops(&self) -> bool {
        self.records.last_chunk::<2>().is_some_and(|last_two| {
            last_two
                .iter()
                .all(|record| record.reason == InterruptReason::StopWithoutAnswer)
        })
    }

    fn reasoning_dominates(&self) -> bool {
        if self.records.len() < 2 || self.thought_chars == 0 {
            return false;
        }
        if self.answer_chars == 0 {
            return true;
        }
        self.thought_chars as f64 / self.answer_chars as f64 > self.config.thought_answer_ratio
    }

    /// Decides what follows the interruption just recorded.
    pub fn next_action(&mut self, accumulated_text: &str) -> RetryAction {
        let content_issue = self.is_likely_content_issue();
        if self.consecutive_retries > self.config.max_retries
            || (content_issue && self.config.give_up_on_content_issue)
        {
            return RetryAction::GiveUp {
                report: self.report_with(content_issue),
            };
        }

        let delay = self.next_delay();
        self.previous_delay = Some(delay);
        RetryAction::Retry {
            delay,
            body: self.build_retry_body(accumulated_text),
            content_issue,
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = if self.config.jitter_max_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.config.jitter_max_ms)
        };
        let grown_ms = match self.previous_delay {
            Some(previous) => {
                let previous_ms = u64::try_from(previous.as_millis()).unwrap_or(u64::MAX);
                previous_ms.saturating_mul(DELAY_GROWTH_TENTHS) / 10
            }
            None => self.config.base_delay_ms,
        };
        Duration::from_millis(grown_ms.saturating_add(jitter_ms)).min(self.config.max_delay())
    }

    /// Called after an upstream stream is re-established.
    pub fn reset_delay(&mut self) {
        self.previous_delay = None;
    }

    pub fn build_retry_body(&self, accumulated_text: &str) -> JsonValue {
        rebuild::build_retry_body(
            &self.original_body,
            accumulated_text,
            &self.config.continuation_prompt,
        )
    }

    pub fn report(&self) -> RecoveryReport {
        self.report_with(self.is_likely_content_issue())
    }

    fn report_with(&self, content_issue: bool) -> RecoveryReport {
        RecoveryReport {
            retries: self.consecutive_retries,
            max_retries: self.config.max_retries,
            final_state: self.records.last().map(|record| record.state),
            produced_answer: self.answer_chars > 0,
            accumulated_chars: self.accumulated_chars,
            content_issue,
            progress_threshold: self.threshold.current(),
            interruptions: self.records.clone(),
        }
    }

    pub fn retries(&self) -> u32 {
        self.consecutive_retries
    }
}

fn gaps_are_uniform(records: &[InterruptionRecord; 3]) -> bool {
    let first = records[1].at.saturating_duration_since(records[0].at);
    let second = records[2].at.saturating_duration_since(records[1].at);
    let mean = (first + second).as_secs_f64() / 2.0;
    if mean <= 0.0 {
        return false;
    }
    let spread = (first.as_secs_f64() - second.as_secs_f64()).abs();
    spread <= mean * UNIFORM_GAP_TOLERANCE
}
