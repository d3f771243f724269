use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use grelay_protocol::error::{ErrorEnvelope, is_canonical_error};
use grelay_protocol::sse::encode_sse;
use serde_json::{Value as JsonValue, json};
use tracing::warn;

use crate::headers::{Headers, header_get, header_set};
use crate::strategist::RecoveryReport;
use crate::upstream::{UpstreamBody, UpstreamFailure, UpstreamHttpResponse};

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;
const MAX_DETAIL_CHARS: usize = 512;
const BODY_UNAVAILABLE: &str = "<upstream error body unavailable>";

const DEBUG_INFO_TYPE: &str = "type.googleapis.com/google.rpc.DebugInfo";
const RETRY_INFO_TYPE: &str = "type.googleapis.com/google.rpc.RetryInfo";
const ERROR_INFO_TYPE: &str = "type.googleapis.com/google.rpc.ErrorInfo";

/// An upstream failure in the canonical `{ "error": { ... } }` shape.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardizedError {
    pub status: u16,
    pub headers: Headers,
    pub body: JsonValue,
}

impl StandardizedError {
    fn from_envelope(envelope: ErrorEnvelope, retry_after: Option<&str>) -> Self {
        Self::new(envelope.error.code, envelope.to_json(), retry_after)
    }

    fn new(status: u16, body: JsonValue, retry_after: Option<&str>) -> Self {
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        if let Some(retry_after) = retry_after {
            header_set(&mut headers, "retry-after", retry_after);
        }
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn retry_after(&self) -> Option<&str> {
        header_get(&self.headers, "retry-after")
    }

    pub fn body_bytes(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(&self.body).unwrap_or_default())
    }

    /// Terminal `event: error` frame for a stream that is already open.
    pub fn to_sse_event(&self) -> Bytes {
        encode_sse(Some("error"), &self.body.to_string())
    }

    pub fn into_response(self) -> UpstreamHttpResponse {
        let body = UpstreamBody::Bytes(self.body_bytes());
        UpstreamHttpResponse {
            status: self.status,
            headers: self.headers,
            body,
        }
    }
}

/// Reads a failed response's body (bounded in time and size) and returns it in the
/// canonical error shape. Native upstream errors are kept as they are.
pub async fn normalize_failed_response(
    response: UpstreamHttpResponse,
    body_timeout: Duration,
) -> StandardizedError {
    let UpstreamHttpResponse {
        status,
        headers,
        body,
    } = response;
    let retry_after = header_get(&headers, "retry-after")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let raw = match read_error_body(body, body_timeout).await {
        Some(raw) => raw,
        None => {
            warn!(event = "upstream_error_body_unavailable", status);
            Bytes::from_static(BODY_UNAVAILABLE.as_bytes())
        }
    };

    if let Ok(value) = serde_json::from_slice::<JsonValue>(&raw)
        && is_canonical_error(&value)
    {
        return StandardizedError::new(status, value, retry_after.as_deref());
    }

    let mut envelope = ErrorEnvelope::new(status, synthesized_message(status)).with_detail(json!({
        "@type": DEBUG_INFO_TYPE,
        "detail": error_body_detail(&raw),
    }));
    if let Some(retry_after) = retry_after.as_deref() {
        envelope = envelope.with_detail(retry_info_detail(retry_after));
    }
    StandardizedError::from_envelope(envelope, retry_after.as_deref())
}

/// No HTTP response at all: reported as a bad gateway.
pub fn transport_failure_error(failure: &UpstreamFailure) -> StandardizedError {
    let envelope = ErrorEnvelope::new(502, format!("upstream transport error: {}", failure.message))
        .with_detail(json!({
            "@type": ERROR_INFO_TYPE,
            "reason": failure.kind,
            "domain": "grelay",
        }));
    StandardizedError::from_envelope(envelope, None)
}

/// Emitted once when a session runs out of retries.
pub fn recovery_exhausted_error(report: &RecoveryReport) -> StandardizedError {
    let message = format!(
        "stream recovery gave up after {} retries (max {})",
        report.retries.saturating_sub(1),
        report.max_retries
    );
    let envelope = ErrorEnvelope::new(503, message).with_detail(json!({
        "@type": DEBUG_INFO_TYPE,
        "detail": "recovery_report",
        "report": report,
    }));
    StandardizedError::from_envelope(envelope, None)
}

async fn read_error_body(body: UpstreamBody, body_timeout: Duration) -> Option<Bytes> {
    match body {
        UpstreamBody::Bytes(bytes) => Some(bytes),
        UpstreamBody::Stream(mut stream) => {
            let read = async move {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.ok()?;
                    let room = MAX_ERROR_BODY_BYTES.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
                    if buf.len() >= MAX_ERROR_BODY_BYTES {
                        break;
                    }
                }
                Some(buf.freeze())
            };
            tokio::time::timeout(body_timeout, read).await.ok().flatten()
        }
    }
}

fn synthesized_message(status: u16) -> String {
    match status {
        429 => "upstream quota exhausted (HTTP 429)".to_string(),
        401 | 403 => format!("upstream rejected the credentials (HTTP {status})"),
        _ => format!("upstream returned HTTP {status}"),
    }
}

fn retry_info_detail(retry_after: &str) -> JsonValue {
    match retry_after.parse::<u64>() {
        Ok(seconds) => json!({
            "@type": RETRY_INFO_TYPE,
            "retryDelay": format!("{seconds}s"),
        }),
        // HTTP-date form.
        Err(_) => json!({
            "@type": RETRY_INFO_TYPE,
            "retryAfter": retry_after,
        }),
    }
}

fn error_body_detail(body: &Bytes) -> String {
    let text = String::from_utf8_lossy(body);
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.is_empty() {
        return "upstream returned an empty error body".to_string();
    }
    let mut out = compact.chars().take(MAX_DETAIL_CHARS).collect::<String>();
    if compact.chars().count() > MAX_DETAIL_CHARS {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::TransportErrorKind;

    fn response(status: u16, headers: Headers, body: &'static str) -> UpstreamHttpResponse {
        UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(Bytes::from_static(body.as_bytes())),
        }
    }

    #[tokio::test]
    async fn quota_error_with_retry_after_and_html_body() {
        let headers = vec![("Retry-After".to_string(), "30".to_string())];
        let err = normalize_failed_response(
            response(429, headers, "<html><body>Too   Many\nRequests</body></html>"),
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(err.status, 429);
        assert_eq!(err.retry_after(), Some("30"));
        assert_eq!(err.body["error"]["code"], 429);
        assert_eq!(err.body["error"]["status"], "RESOURCE_EXHAUSTED");
        assert!(err.body["error"]["message"].as_str().unwrap().contains("429"));

        let details = err.body["error"]["details"].as_array().unwrap();
        assert_eq!(
            details[0]["detail"],
            "<html><body>Too Many Requests</body></html>"
        );
        assert_eq!(details[1]["@type"], RETRY_INFO_TYPE);
        assert_eq!(details[1]["retryDelay"], "30s");
    }

    #[tokio::test]
    async fn canonical_upstream_error_is_kept() {
        let body = r#"{"error":{"code":400,"message":"bad field","status":"INVALID_ARGUMENT"}}"#;
        let err = normalize_failed_response(response(400, Vec::new(), body), Duration::from_secs(1))
            .await;
        assert_eq!(err.body, serde_json::from_str::<JsonValue>(body).unwrap());
        assert!(err.retry_after().is_none());
    }

    #[tokio::test]
    async fn non_canonical_json_is_wrapped() {
        let err = normalize_failed_response(
            response(500, Vec::new(), r#"{"error":"boom"}"#),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(err.body["error"]["code"], 500);
        assert_eq!(err.body["error"]["status"], "INTERNAL");
    }

    #[tokio::test]
    async fn long_bodies_are_truncated() {
        let long: &'static str = Box::leak("a".repeat(2_000).into_boxed_str());
        let err =
            normalize_failed_response(response(502, Vec::new(), long), Duration::from_secs(1))
                .await;
        let detail = err.body["error"]["details"][0]["detail"].as_str().unwrap();
        assert_eq!(detail.chars().count(), MAX_DETAIL_CHARS + 3);
        assert!(detail.ends_with("..."));
    }

    #[tokio::test]
    async fn stalled_body_uses_placeholder() {
        let stream = futures_util::stream::pending::<Result<Bytes, std::io::Error>>();
        let err = normalize_failed_response(
            UpstreamHttpResponse {
                status: 503,
                headers: Vec::new(),
                body: UpstreamBody::Stream(Box::pin(stream)),
            },
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(err.body["error"]["status"], "UNAVAILABLE");
        assert_eq!(err.body["error"]["details"][0]["detail"], BODY_UNAVAILABLE);
    }

    #[test]
    fn transport_failures_are_bad_gateway() {
        let err = transport_failure_error(&UpstreamFailure {
            kind: TransportErrorKind::Connect,
            message: "connection refused".to_string(),
        });
        assert_eq!(err.status, 502);
        assert_eq!(err.body["error"]["status"], "UNAVAILABLE");
        assert_eq!(err.body["error"]["details"][0]["reason"], "connect");
    }

    #[test]
    fn sse_event_is_error_typed() {
        let err = transport_failure_error(&UpstreamFailure {
            kind: TransportErrorKind::Timeout,
            message: "timed out".to_string(),
        });
        let frame = err.to_sse_event();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("event: error\ndata: {"));
        assert!(text.ends_with("\n\n"));
    }
}
