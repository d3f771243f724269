//! Streaming recovery engine.
//!
//! A session consumes one upstream Gemini SSE stream, detects interruptions, and keeps
//! re-requesting the model with the text produced so far until the answer is complete
//! or the retry budget runs out. The client sees one continuous stream.

pub mod attempt;
pub mod error;
pub mod headers;
pub mod judge;
pub mod orchestrator;
pub mod payload;
pub mod reader;
pub mod reason;
pub mod standardize;
pub mod strategist;
pub mod upstream;
pub mod upstream_client;

pub use attempt::{Attempt, AttemptState};
pub use error::ClientClosed;
pub use headers::{Headers, header_get, header_set};
pub use judge::CompletionJudge;
pub use orchestrator::{OutputStream, SessionOutcome, StreamOrchestrator, recover_stream};
pub use payload::{LineKind, Payload, classify_line};
pub use reason::InterruptReason;
pub use standardize::{
    StandardizedError, normalize_failed_response, recovery_exhausted_error,
    transport_failure_error,
};
pub use strategist::{InterruptionRecord, RecoveryReport, RetryAction, Strategist};
pub use upstream::{
    ByteStream, HttpMethod, TransportErrorKind, UpstreamBody, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse,
};
pub use upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
