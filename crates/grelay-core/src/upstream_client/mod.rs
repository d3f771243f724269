use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tracing::{info, warn};
use wreq::{Client, Method, Proxy};

use grelay_common::GlobalConfig;

use crate::headers::Headers;
use crate::upstream::{
    HttpMethod, TransportErrorKind, UpstreamBody, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse,
};

/// Performs the literal HTTP call. Any HTTP status is a successful `send`; only
/// transport problems are reported as [`UpstreamFailure`].
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            proxy: global.proxy.clone(),
            ..Self::default()
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct WreqUpstreamClient {
    client: Client,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let proxy = config
            .proxy
            .as_deref()
            .map(str::trim)
            .filter(|proxy| !proxy.is_empty());
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout);
        if let Some(proxy) = proxy {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let started_at = Instant::now();
            info!(
                event = "upstream_request",
                method = %req.method.as_str(),
                url = %redact_url(&req.url),
                is_stream = req.is_stream
            );

            let mut builder = self.client.request(http_method_to_wreq(req.method), &req.url);
            for (k, v) in &req.headers {
                builder = builder.header(k, v);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            let resp = match builder.send().await {
                Ok(resp) => resp,
                Err(err) => {
                    let failure = map_wreq_error(err);
                    warn!(
                        event = "upstream_response",
                        status = "error",
                        elapsed_ms = started_at.elapsed().as_millis(),
                        error = %failure
                    );
                    return Err(failure);
                }
            };
            info!(
                event = "upstream_response",
                status = resp.status().as_u16(),
                elapsed_ms = started_at.elapsed().as_millis(),
                is_stream = req.is_stream
            );
            convert_response(resp, req.is_stream).await
        })
    }
}

fn http_method_to_wreq(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let stream = resp
        .bytes_stream()
        .map(|item| item.map_err(|err| io::Error::other(err.to_string())));
    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Stream(Box::pin(stream)),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (k, v) in map {
        if let Ok(s) = v.to_str() {
            out.push((k.as_str().to_string(), s.to_string()));
        }
    }
    out
}

/// Drops the query string so `key=` never reaches the logs.
fn redact_url(url: &str) -> &str {
    url.split_once('?').map(|(path, _)| path).unwrap_or(url)
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    let kind = classify_wreq_error(&err);
    UpstreamFailure {
        kind,
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> TransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return TransportErrorKind::ReadTimeout;
        }
        return TransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return TransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }
    if err.is_connection_reset() {
        return TransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return TransportErrorKind::Tls;
    }
    TransportErrorKind::Other
}

#[cfg(test)]
mod tests {
    use super::redact_url;

    #[test]
    fn query_is_not_logged() {
        assert_eq!(
            redact_url("https://g.example/v1beta/models/m:streamGenerateContent?alt=sse&key=abc"),
            "https://g.example/v1beta/models/m:streamGenerateContent"
        );
        assert_eq!(redact_url("https://g.example/x"), "https://g.example/x");
    }
}
