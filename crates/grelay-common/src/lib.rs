use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid global config field {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

pub const DEFAULT_TERMINAL_CHARS: &str = ".?!。？！…)]}）】」』》\"'”’`\n";
pub const DEFAULT_FINISH_TOKEN: &str = "[done]";
pub const DEFAULT_CONTINUATION_PROMPT: &str = "Continue exactly where you left off. Do not repeat any previous text, do not add a preamble, and do not restart the answer.";

/// Knobs of the streaming recovery engine. Passed explicitly to every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Retries after the first attempt; a session never opens more than `max_retries + 1`
    /// upstream connections.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_max_ms: u64,
    /// Hide thought-only chunks of a resumed attempt once the session has answered.
    pub swallow_thoughts_after_retry: bool,
    pub finish_token: String,
    pub terminal_chars: String,
    pub continuation_prompt: String,
    pub progress_threshold_chars: usize,
    pub variance_threshold_chars: usize,
    pub thought_answer_ratio: f64,
    /// Stop retrying as soon as an interruption is classified as content related.
    pub give_up_on_content_issue: bool,
    /// Treat a STOP after function calls but without answer text as a finished turn.
    pub accept_tool_call_stop: bool,
    pub non_retryable_statuses: Vec<u16>,
    pub error_body_timeout_ms: u64,
    pub output_buffer: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 20,
            base_delay_ms: 750,
            max_delay_ms: 8_000,
            jitter_max_ms: 200,
            swallow_thoughts_after_retry: true,
            finish_token: DEFAULT_FINISH_TOKEN.to_string(),
            terminal_chars: DEFAULT_TERMINAL_CHARS.to_string(),
            continuation_prompt: DEFAULT_CONTINUATION_PROMPT.to_string(),
            progress_threshold_chars: 50,
            variance_threshold_chars: 50,
            thought_answer_ratio: 5.0,
            give_up_on_content_issue: false,
            accept_tool_call_stop: false,
            non_retryable_statuses: vec![400, 401, 403, 404, 429],
            error_body_timeout_ms: 5_000,
            output_buffer: 32,
        }
    }
}

impl RecoveryConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn error_body_timeout(&self) -> Duration {
        Duration::from_millis(self.error_body_timeout_ms)
    }

    pub fn is_non_retryable(&self, status: u16) -> bool {
        self.non_retryable_statuses.contains(&status)
    }

    pub fn validate(&self) -> Result<(), GlobalConfigError> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(GlobalConfigError::Invalid {
                field: "max_delay_ms",
                message: "must not be smaller than base_delay_ms".to_string(),
            });
        }
        if self.output_buffer == 0 {
            return Err(GlobalConfigError::Invalid {
                field: "output_buffer",
                message: "must be at least 1".to_string(),
            });
        }
        if !self.thought_answer_ratio.is_finite() || self.thought_answer_ratio <= 0.0 {
            return Err(GlobalConfigError::Invalid {
                field: "thought_answer_ratio",
                message: "must be a positive number".to_string(),
            });
        }
        Ok(())
    }
}

/// Final, merged configuration used by the running process.
///
/// Merge order: CLI/ENV > config file > defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Base URL of the generation API, e.g. `https://generativelanguage.googleapis.com`.
    pub upstream_base_url: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub recovery: RecoveryConfig,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub upstream_base_url: Option<String>,
    pub proxy: Option<String>,
    pub recovery: Option<RecoveryConfig>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub swallow_thoughts_after_retry: Option<bool>,
    pub finish_token: Option<String>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.upstream_base_url.is_some() {
            self.upstream_base_url = other.upstream_base_url;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.recovery.is_some() {
            self.recovery = other.recovery;
        }
        if other.max_retries.is_some() {
            self.max_retries = other.max_retries;
        }
        if other.base_delay_ms.is_some() {
            self.base_delay_ms = other.base_delay_ms;
        }
        if other.swallow_thoughts_after_retry.is_some() {
            self.swallow_thoughts_after_retry = other.swallow_thoughts_after_retry;
        }
        if other.finish_token.is_some() {
            self.finish_token = other.finish_token;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let mut recovery = self.recovery.unwrap_or_default();
        if let Some(max_retries) = self.max_retries {
            recovery.max_retries = max_retries;
        }
        if let Some(base_delay_ms) = self.base_delay_ms {
            recovery.base_delay_ms = base_delay_ms;
        }
        if let Some(swallow) = self.swallow_thoughts_after_retry {
            recovery.swallow_thoughts_after_retry = swallow;
        }
        if let Some(finish_token) = self.finish_token {
            recovery.finish_token = finish_token;
        }
        recovery.validate()?;

        let upstream_base_url = self
            .upstream_base_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or(GlobalConfigError::MissingField("upstream_base_url"))?;

        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(8788),
            upstream_base_url,
            proxy: self
                .proxy
                .map(|proxy| proxy.trim().to_string())
                .filter(|proxy| !proxy.is_empty()),
            recovery,
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            upstream_base_url: Some(value.upstream_base_url),
            proxy: value.proxy,
            recovery: Some(value.recovery),
            max_retries: None,
            base_delay_ms: None,
            swallow_thoughts_after_retry: None,
            finish_token: None,
        }
    }
}
