use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use bytes::Bytes;
use futures_util::{StreamExt, future, stream};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use grelay_common::{GlobalConfig, RecoveryConfig};
use grelay_core::{
    ByteStream, Headers, HttpMethod, OutputStream, StandardizedError, UpstreamBody,
    UpstreamClient, UpstreamHttpRequest, UpstreamHttpResponse, header_get, header_set,
    normalize_failed_response, recover_stream, transport_failure_error,
};
use grelay_protocol::error::ErrorEnvelope;

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";
const STREAM_ACTION: &str = ":streamGenerateContent";

#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<RecoveryConfig>,
    pub client: Arc<dyn UpstreamClient>,
    pub upstream_base_url: Arc<str>,
}

impl ProxyState {
    pub fn new(global: &GlobalConfig, client: Arc<dyn UpstreamClient>) -> Self {
        Self {
            config: Arc::new(global.recovery.clone()),
            client,
            upstream_base_url: Arc::from(global.upstream_base_url.as_str()),
        }
    }
}

#[derive(Clone)]
struct RequestTraceId(String);

/// Downstream request problems caught before anything is sent upstream.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("request body is not valid JSON: {0}")]
    InvalidBody(#[from] serde_json::Error),
    #[error("method {0} is not supported")]
    UnsupportedMethod(Method),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::UnsupportedMethod(_) => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorEnvelope::new(status.as_u16(), self.to_string()).to_json();
        (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

/// `POST .../models/{model}:streamGenerateContent` is recovered; every other request
/// under `/v1beta` and `/v1` is forwarded as is.
pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1beta/{*rest}", any(forward))
        .route("/v1/{*rest}", any(forward))
        .layer(middleware::from_fn(trace_request))
        .with_state(state)
}

async fn trace_request(mut req: axum::http::Request<Body>, next: Next) -> Response {
    let trace_id = uuid::Uuid::now_v7().to_string();
    let started_at = Instant::now();
    info!(
        event = "downstream_request",
        trace_id = %trace_id,
        method = %req.method(),
        path = %req.uri().path(),
        query = redact_query(req.uri().query()).as_deref().unwrap_or(""),
    );
    req.extensions_mut()
        .insert(RequestTraceId(trace_id.clone()));

    let resp = next.run(req).await;
    info!(
        event = "downstream_response",
        trace_id = %trace_id,
        status = resp.status().as_u16(),
        elapsed_ms = started_at.elapsed().as_millis() as u64,
    );
    resp
}

async fn forward(
    State(state): State<ProxyState>,
    Extension(trace_id): Extension<RequestTraceId>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(upstream_method) = upstream_method(&method) else {
        return ProxyError::UnsupportedMethod(method).into_response();
    };
    let headers = forwarded_headers(&headers);
    let path = uri.path();

    if upstream_method == HttpMethod::Post && is_stream_generate(path) {
        return stream_generate(state, trace_id.0, path, uri.query(), headers, body).await;
    }
    passthrough(state, upstream_method, path, uri.query(), headers, body).await
}

async fn stream_generate(
    state: ProxyState,
    trace_id: String,
    path: &str,
    query: Option<&str>,
    headers: Headers,
    body: Bytes,
) -> Response {
    let original_body = match serde_json::from_slice::<JsonValue>(&body) {
        Ok(value) => value,
        Err(err) => return ProxyError::from(err).into_response(),
    };
    let template = UpstreamHttpRequest {
        method: HttpMethod::Post,
        url: upstream_url(&state.upstream_base_url, path, Some(&force_sse_query(query))),
        headers,
        body: Some(body),
        is_stream: true,
    };

    let response = match state.client.send(template.clone()).await {
        Ok(response) => response,
        Err(failure) => return standardized_response(transport_failure_error(&failure)),
    };
    if !response.is_success() {
        let error = normalize_failed_response(response, state.config.error_body_timeout()).await;
        return standardized_response(error);
    }

    let upstream: ByteStream = match response.body {
        UpstreamBody::Stream(stream) => stream,
        UpstreamBody::Bytes(bytes) => Box::pin(stream::once(future::ready(Ok(bytes)))),
    };
    let output = recover_stream(
        state.config.clone(),
        state.client.clone(),
        template,
        original_body,
        upstream,
        trace_id,
    );
    sse_response(output)
}

async fn passthrough(
    state: ProxyState,
    method: HttpMethod,
    path: &str,
    query: Option<&str>,
    headers: Headers,
    body: Bytes,
) -> Response {
    let request = UpstreamHttpRequest {
        method,
        url: upstream_url(&state.upstream_base_url, path, query),
        headers,
        body: (!body.is_empty()).then_some(body),
        is_stream: wants_sse(query),
    };
    match state.client.send(request).await {
        Ok(response) if response.is_success() => to_axum_response(response),
        Ok(response) => standardized_response(
            normalize_failed_response(response, state.config.error_body_timeout()).await,
        ),
        Err(failure) => standardized_response(transport_failure_error(&failure)),
    }
}

// ---- Helpers ----

fn sse_response(output: OutputStream) -> Response {
    let mut headers: Headers = Vec::new();
    header_set(&mut headers, "content-type", "text/event-stream");
    to_axum_response(UpstreamHttpResponse {
        status: 200,
        headers,
        body: UpstreamBody::Stream(Box::pin(
            ReceiverStream::new(output).map(Ok::<_, std::io::Error>),
        )),
    })
}

fn standardized_response(error: StandardizedError) -> Response {
    to_axum_response(error.into_response())
}

fn to_axum_response(resp: UpstreamHttpResponse) -> Response {
    let sse_stream =
        has_sse_content_type(&resp.headers) && matches!(&resp.body, UpstreamBody::Stream(_));
    let mut builder = Response::builder().status(resp.status);
    if let Some(h) = builder.headers_mut() {
        for (k, v) in resp.headers {
            // Hyper sets framing itself.
            if is_hop_by_hop_or_framing_header(&k) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(&v),
            ) {
                h.append(name, value);
            }
        }
        if sse_stream {
            // Hint common reverse proxies to avoid buffering SSE responses.
            h.entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
            h.entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
        }
    }

    let body = match resp.body {
        UpstreamBody::Bytes(bytes) => Body::from(bytes),
        UpstreamBody::Stream(stream) if sse_stream => {
            let rx = wrap_sse_stream_with_heartbeat(stream);
            Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
        }
        UpstreamBody::Stream(stream) => Body::from_stream(stream),
    };

    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

fn has_sse_content_type(headers: &Headers) -> bool {
    header_get(headers, "content-type")
        .is_some_and(|value| value.to_ascii_lowercase().contains("text/event-stream"))
}

fn wrap_sse_stream_with_heartbeat(mut upstream: ByteStream) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate tick; first heartbeat should be sent after the interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                // Dropping `upstream` here is what cancels a recovering session.
                _ = tx.closed() => break,
                maybe_chunk = upstream.next() => {
                    let chunk = match maybe_chunk {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(err)) => {
                            warn!(event = "downstream_stream_error", error = %err);
                            break;
                        }
                        None => break,
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

fn upstream_method(method: &Method) -> Option<HttpMethod> {
    match *method {
        Method::GET => Some(HttpMethod::Get),
        Method::POST => Some(HttpMethod::Post),
        Method::PUT => Some(HttpMethod::Put),
        Method::PATCH => Some(HttpMethod::Patch),
        Method::DELETE => Some(HttpMethod::Delete),
        _ => None,
    }
}

fn is_stream_generate(path: &str) -> bool {
    let Some(rest) = path
        .strip_prefix("/v1beta/models/")
        .or_else(|| path.strip_prefix("/v1/models/"))
    else {
        return false;
    };
    rest.strip_suffix(STREAM_ACTION)
        .is_some_and(|model| !model.is_empty() && !model.contains('/'))
}

fn upstream_url(base: &str, path: &str, query: Option<&str>) -> String {
    match query.filter(|query| !query.is_empty()) {
        Some(query) => format!("{base}{path}?{query}"),
        None => format!("{base}{path}"),
    }
}

/// Recovery reads line-framed SSE, so `alt=sse` is always requested.
fn force_sse_query(query: Option<&str>) -> String {
    let query = query.unwrap_or("");
    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query) else {
        return "alt=sse".to_string();
    };
    let mut pairs = pairs
        .into_iter()
        .filter(|(k, _)| k != "alt")
        .collect::<Vec<_>>();
    pairs.push(("alt".to_string(), "sse".to_string()));
    serde_urlencoded::to_string(pairs).unwrap_or_else(|_| "alt=sse".to_string())
}

fn wants_sse(query: Option<&str>) -> bool {
    query
        .and_then(|query| serde_urlencoded::from_str::<Vec<(String, String)>>(query).ok())
        .is_some_and(|pairs| pairs.iter().any(|(k, v)| k == "alt" && v == "sse"))
}

fn forwarded_headers(headers: &HeaderMap) -> Headers {
    let mut out: Headers = Vec::new();
    for (name, value) in headers {
        let name = name.as_str();
        if is_hop_by_hop_or_framing_header(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("accept-encoding")
        {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.push((name.to_string(), v.to_string()));
        }
    }
    out
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

fn redact_query(query: Option<&str>) -> Option<String> {
    let q = query?;
    let Ok(mut pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(q) else {
        return Some("***".to_string());
    };
    for (k, v) in &mut pairs {
        if k.eq_ignore_ascii_case("key") {
            *v = "***".to_string();
        }
    }
    serde_urlencoded::to_string(pairs).ok()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use grelay_core::{TransportErrorKind, UpstreamFailure};
    use serde_json::json;

    use super::*;

    struct FakeClient {
        responses: Mutex<VecDeque<UpstreamHttpResponse>>,
        urls: Mutex<Vec<String>>,
    }

    impl FakeClient {
        fn new(responses: Vec<UpstreamHttpResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                urls: Mutex::new(Vec::new()),
            })
        }
    }

    impl UpstreamClient for FakeClient {
        fn send<'a>(
            &'a self,
            req: UpstreamHttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
        {
            Box::pin(async move {
                self.urls.lock().unwrap().push(req.url);
                self.responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .ok_or_else(|| UpstreamFailure {
                        kind: TransportErrorKind::Connect,
                        message: "no scripted response".to_string(),
                    })
            })
        }
    }

    fn state(client: Arc<FakeClient>) -> ProxyState {
        ProxyState {
            config: Arc::new(RecoveryConfig {
                base_delay_ms: 1,
                jitter_max_ms: 0,
                ..RecoveryConfig::default()
            }),
            client,
            upstream_base_url: Arc::from("http://upstream.test"),
        }
    }

    fn sse_ok(lines: &[&str]) -> UpstreamHttpResponse {
        let chunks = lines
            .iter()
            .map(|line| Ok(Bytes::from(format!("{line}\n\n"))))
            .collect::<Vec<Result<Bytes, std::io::Error>>>();
        UpstreamHttpResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "text/event-stream".to_string())],
            body: UpstreamBody::Stream(Box::pin(stream::iter(chunks))),
        }
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn stream_generate_paths() {
        assert!(is_stream_generate("/v1beta/models/gemini-2.5-pro:streamGenerateContent"));
        assert!(is_stream_generate("/v1/models/gemini-pro:streamGenerateContent"));
        assert!(!is_stream_generate("/v1beta/models/gemini-pro:generateContent"));
        assert!(!is_stream_generate("/v1beta/models/:streamGenerateContent"));
        assert!(!is_stream_generate("/v1beta/tunedModels/x:streamGenerateContent"));
    }

    #[test]
    fn alt_sse_is_forced_and_other_params_kept() {
        assert_eq!(force_sse_query(None), "alt=sse");
        assert_eq!(force_sse_query(Some("key=abc&alt=json")), "key=abc&alt=sse");
        assert!(wants_sse(Some("alt=sse&key=1")));
        assert!(!wants_sse(Some("alt=json")));
        assert!(!wants_sse(None));
    }

    #[test]
    fn forwarded_headers_drop_framing_and_host() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("localhost:8788"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-goog-api-key", HeaderValue::from_static("secret"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let out = forwarded_headers(&headers);
        assert_eq!(header_get(&out, "x-goog-api-key"), Some("secret"));
        assert_eq!(header_get(&out, "content-type"), Some("application/json"));
        assert!(header_get(&out, "host").is_none());
        assert!(header_get(&out, "content-length").is_none());
        assert!(header_get(&out, "connection").is_none());
    }

    #[test]
    fn query_key_is_redacted() {
        assert_eq!(
            redact_query(Some("alt=sse&key=secret")).as_deref(),
            Some("alt=sse&key=***")
        );
        assert_eq!(redact_query(None), None);
    }

    #[tokio::test]
    async fn recovered_stream_is_sse_with_buffering_hints() {
        let line = r#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"Hi."}]},"finishReason":"STOP"}]}"#;
        let client = FakeClient::new(vec![sse_ok(&[line])]);
        let resp = stream_generate(
            state(client.clone()),
            "trace".to_string(),
            "/v1beta/models/gemini-pro:streamGenerateContent",
            Some("key=abc"),
            Vec::new(),
            Bytes::from(json!({"contents": []}).to_string()),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(resp.headers()["x-accel-buffering"], "no");
        assert_eq!(body_text(resp).await, format!("{line}\n\n"));
        assert_eq!(
            client.urls.lock().unwrap()[0],
            "http://upstream.test/v1beta/models/gemini-pro:streamGenerateContent?key=abc&alt=sse"
        );
    }

    #[tokio::test]
    async fn initial_failure_is_standardized() {
        let client = FakeClient::new(vec![UpstreamHttpResponse {
            status: 429,
            headers: vec![("retry-after".to_string(), "30".to_string())],
            body: UpstreamBody::Bytes(Bytes::from_static(b"slow down")),
        }]);
        let resp = stream_generate(
            state(client),
            "trace".to_string(),
            "/v1beta/models/gemini-pro:streamGenerateContent",
            None,
            Vec::new(),
            Bytes::from_static(b"{}"),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "30");
        let body: JsonValue = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body["error"]["status"], "RESOURCE_EXHAUSTED");
    }

    #[tokio::test]
    async fn invalid_json_body_is_rejected_locally() {
        let client = FakeClient::new(Vec::new());
        let resp = stream_generate(
            state(client.clone()),
            "trace".to_string(),
            "/v1beta/models/gemini-pro:streamGenerateContent",
            None,
            Vec::new(),
            Bytes::from_static(b"not json"),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(client.urls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_requests_pass_through() {
        let client = FakeClient::new(vec![UpstreamHttpResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: UpstreamBody::Bytes(Bytes::from_static(br#"{"models":[]}"#)),
        }]);
        let resp = passthrough(
            state(client.clone()),
            HttpMethod::Get,
            "/v1beta/models",
            Some("key=abc"),
            Vec::new(),
            Bytes::new(),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, r#"{"models":[]}"#);
        assert_eq!(
            client.urls.lock().unwrap()[0],
            "http://upstream.test/v1beta/models?key=abc"
        );
    }

    #[tokio::test]
    async fn transport_failure_is_bad_gateway() {
        let client = FakeClient::new(Vec::new());
        let resp = passthrough(
            state(client),
            HttpMethod::Get,
            "/v1beta/models",
            None,
            Vec::new(),
            Bytes::new(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
