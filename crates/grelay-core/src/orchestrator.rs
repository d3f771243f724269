//! Drives one session: forwards upstream lines, detects interruptions, and re-requests
//! the model until the answer is complete or recovery gives up.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{future, stream};
use grelay_common::RecoveryConfig;
use grelay_protocol::gemini::FinishReason;
use grelay_protocol::sse::frame_line;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::attempt::{Attempt, AttemptState};
use crate::error::ClientClosed;
use crate::judge::CompletionJudge;
use crate::payload::{LineKind, classify_line};
use crate::reader::LineReader;
use crate::reason::InterruptReason;
use crate::standardize::{normalize_failed_response, recovery_exhausted_error};
use crate::strategist::{RetryAction, Strategist};
use crate::upstream::{ByteStream, UpstreamBody, UpstreamHttpRequest};
use crate::upstream_client::UpstreamClient;

/// Client-visible side of a session. Dropping it cancels the session.
pub type OutputStream = mpsc::Receiver<Bytes>;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { retries: u32 },
    GaveUp { retries: u32 },
    /// A retry was answered with a non-retryable status.
    Rejected { status: u16 },
    ClientClosed,
}

enum AttemptEnd {
    Complete,
    Interrupted(InterruptReason),
}

pub struct StreamOrchestrator {
    config: Arc<RecoveryConfig>,
    client: Arc<dyn UpstreamClient>,
    /// Method, url, and headers reused by every retry.
    template: UpstreamHttpRequest,
    trace_id: String,
}

impl StreamOrchestrator {
    pub fn new(
        config: Arc<RecoveryConfig>,
        client: Arc<dyn UpstreamClient>,
        template: UpstreamHttpRequest,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            client,
            template,
            trace_id: trace_id.into(),
        }
    }

    /// Runs the session on its own task and returns the client-visible stream.
    pub fn spawn(self, original_body: JsonValue, upstream: ByteStream) -> OutputStream {
        let (tx, rx) = mpsc::channel(self.config.output_buffer.max(1));
        tokio::spawn(self.run(original_body, upstream, tx));
        rx
    }

    pub async fn run(
        self,
        original_body: JsonValue,
        upstream: ByteStream,
        tx: mpsc::Sender<Bytes>,
    ) -> SessionOutcome {
        let mut session = Session {
            judge: CompletionJudge::from_config(&self.config),
            strategist: Strategist::new(self.config.clone(), original_body),
            accumulated: String::new(),
            has_answered: false,
            has_called_tool: false,
            accept_tool_call_stop: self.config.accept_tool_call_stop,
            swallow: false,
            tx,
        };
        let mut reader = LineReader::new(upstream);
        let mut index = 0u32;

        loop {
            let mut attempt = Attempt::new(index);
            debug!(event = "recovery.attempt_start", trace_id = %self.trace_id, attempt = index);

            let end = match session.run_attempt(&mut attempt, &mut reader).await {
                Ok(end) => end,
                Err(ClientClosed) => return self.client_closed(index),
            };
            debug!(
                event = "recovery.attempt_end",
                trace_id = %self.trace_id,
                attempt = index,
                lines = attempt.lines,
                elapsed_ms = attempt.started_at.elapsed().as_millis() as u64,
            );
            let reason = match end {
                AttemptEnd::Complete => {
                    let retries = session.strategist.retries();
                    info!(
                        event = "recovery.completed",
                        trace_id = %self.trace_id,
                        attempts = index + 1,
                        retries,
                        chars = session.accumulated.chars().count(),
                    );
                    return SessionOutcome::Completed { retries };
                }
                AttemptEnd::Interrupted(reason) => reason,
            };
            session.interrupt(&self.trace_id, reason, attempt.state);

            // Re-fetch until a stream is re-established or recovery ends.
            reader = loop {
                let (delay, body, content_issue) =
                    match session.strategist.next_action(&session.accumulated) {
                        RetryAction::Retry {
                            delay,
                            body,
                            content_issue,
                        } => (delay, body, content_issue),
                        RetryAction::GiveUp { report } => {
                            warn!(
                                event = "recovery.give_up",
                                trace_id = %self.trace_id,
                                retries = report.retries,
                                content_issue = report.content_issue,
                                produced_answer = report.produced_answer,
                            );
                            let error = recovery_exhausted_error(&report);
                            let _ = session.send(error.to_sse_event()).await;
                            return SessionOutcome::GaveUp {
                                retries: report.retries,
                            };
                        }
                    };

                if self.config.swallow_thoughts_after_retry && session.has_answered {
                    session.swallow = true;
                }
                index += 1;
                info!(
                    event = "recovery.retry",
                    trace_id = %self.trace_id,
                    attempt = index,
                    delay_ms = delay.as_millis() as u64,
                    content_issue,
                    swallow = session.swallow,
                );

                tokio::select! {
                    biased;
                    _ = session.tx.closed() => return self.client_closed(index),
                    _ = tokio::time::sleep(delay) => {}
                }

                let request = self
                    .template
                    .with_body(Bytes::from(serde_json::to_vec(&body).unwrap_or_default()));
                let sent = tokio::select! {
                    biased;
                    _ = session.tx.closed() => return self.client_closed(index),
                    sent = self.client.send(request) => sent,
                };

                match sent {
                    Ok(response) if response.is_success() => {
                        session.strategist.reset_delay();
                        break LineReader::new(body_stream(response.body));
                    }
                    Ok(response) if self.config.is_non_retryable(response.status) => {
                        let status = response.status;
                        let error =
                            normalize_failed_response(response, self.config.error_body_timeout())
                                .await;
                        warn!(
                            event = "recovery.rejected",
                            trace_id = %self.trace_id,
                            attempt = index,
                            status,
                        );
                        let _ = session.send(error.to_sse_event()).await;
                        return SessionOutcome::Rejected { status };
                    }
                    Ok(response) => {
                        warn!(
                            event = "recovery.fetch_failed",
                            trace_id = %self.trace_id,
                            attempt = index,
                            status = response.status,
                        );
                    }
                    Err(failure) => {
                        warn!(
                            event = "recovery.fetch_failed",
                            trace_id = %self.trace_id,
                            attempt = index,
                            kind = ?failure.kind,
                            error = %failure.message,
                        );
                    }
                }
                session.interrupt(
                    &self.trace_id,
                    InterruptReason::FetchError,
                    AttemptState::Pending,
                );
            };
        }
    }

    fn client_closed(&self, attempt: u32) -> SessionOutcome {
        info!(event = "recovery.client_closed", trace_id = %self.trace_id, attempt);
        SessionOutcome::ClientClosed
    }
}

/// Starts a recovering session over an upstream stream that already returned 2xx.
pub fn recover_stream(
    config: Arc<RecoveryConfig>,
    client: Arc<dyn UpstreamClient>,
    template: UpstreamHttpRequest,
    original_body: JsonValue,
    upstream: ByteStream,
    trace_id: impl Into<String>,
) -> OutputStream {
    StreamOrchestrator::new(config, client, template, trace_id).spawn(original_body, upstream)
}

struct Session {
    judge: CompletionJudge,
    strategist: Strategist,
    /// Formal answer text across all attempts. Only ever appended to.
    accumulated: String,
    /// Set once any attempt produced formal text; never reset.
    has_answered: bool,
    /// Set once any attempt emitted a function call; never reset.
    has_called_tool: bool,
    accept_tool_call_stop: bool,
    swallow: bool,
    tx: mpsc::Sender<Bytes>,
}

impl Session {
    async fn run_attempt(
        &mut self,
        attempt: &mut Attempt,
        reader: &mut LineReader,
    ) -> Result<AttemptEnd, ClientClosed> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.tx.closed() => return Err(ClientClosed),
                next = reader.next_line() => next,
            };
            let line = match next {
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    warn!(event = "recovery.read_error", attempt = attempt.index, error = %err);
                    return Ok(AttemptEnd::Interrupted(InterruptReason::FetchError));
                }
                None => {
                    let reason = if attempt.state == AttemptState::Reasoning {
                        InterruptReason::DropDuringReasoning
                    } else {
                        InterruptReason::DropUnexpected
                    };
                    return Ok(AttemptEnd::Interrupted(reason));
                }
            };

            let kind = classify_line(&line);
            if self.swallow
                && let LineKind::Data(payload) = &kind
            {
                // Finish and block signals must still reach the checks below.
                if payload.is_thought_only() && payload.finish_reason.is_none() && !payload.blocked
                {
                    continue;
                }
                self.swallow = false;
            }

            attempt.lines += 1;
            self.send(frame_line(&line)).await?;

            let payload = match kind {
                LineKind::Passthrough => continue,
                LineKind::Malformed(err) => {
                    warn!(event = "payload.malformed", attempt = attempt.index, error = %err);
                    continue;
                }
                LineKind::Data(payload) => payload,
            };

            attempt.observe(&payload);
            let answer = payload.answer_text();
            self.accumulated.push_str(&answer);
            if attempt.is_answering() {
                self.has_answered = true;
            }
            if payload.parts.iter().any(|part| part.function_call) {
                self.has_called_tool = true;
            }
            self.strategist
                .note_output(payload.thought_chars(), answer.chars().count());

            if payload.blocked {
                return Ok(AttemptEnd::Interrupted(InterruptReason::Block));
            }
            if let Some(finish_reason) = &payload.finish_reason {
                return Ok(match self.judge_finish(finish_reason) {
                    None => AttemptEnd::Complete,
                    Some(reason) => AttemptEnd::Interrupted(reason),
                });
            }
        }
    }

    /// `None` when the finish is accepted as the end of the answer.
    fn judge_finish(&self, finish_reason: &FinishReason) -> Option<InterruptReason> {
        match finish_reason {
            FinishReason::Stop if !self.has_answered => {
                if self.accept_tool_call_stop && self.has_called_tool {
                    None
                } else {
                    Some(InterruptReason::StopWithoutAnswer)
                }
            }
            FinishReason::Stop if self.judge.is_complete(&self.accumulated) => None,
            FinishReason::Stop => Some(InterruptReason::FinishIncomplete),
            FinishReason::MaxTokens => None,
            FinishReason::Safety => Some(InterruptReason::FinishSafety),
            FinishReason::Recitation => Some(InterruptReason::FinishRecitation),
            FinishReason::Other(_) => Some(InterruptReason::FinishAbnormal),
        }
    }

    fn interrupt(&mut self, trace_id: &str, reason: InterruptReason, state: AttemptState) {
        let record = self
            .strategist
            .record_interruption(reason, &self.accumulated, state);
        warn!(
            event = "recovery.interrupted",
            trace_id = %trace_id,
            reason = %reason,
            state = ?state,
            text_len = record.text_len,
            progress = record.progress,
        );
    }

    async fn send(&self, bytes: Bytes) -> Result<(), ClientClosed> {
        self.tx.send(bytes).await.map_err(|_| ClientClosed)
    }
}

fn body_stream(body: UpstreamBody) -> ByteStream {
    match body {
        UpstreamBody::Stream(stream) => stream,
        UpstreamBody::Bytes(bytes) => Box::pin(stream::once(future::ready(Ok(bytes)))),
    }
}
