use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;

use crate::headers::Headers;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            UpstreamBody::Stream(_) => f.write_str("Stream(<opaque>)"),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

impl UpstreamHttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A request to the generation API. Retries reuse the method, url, and headers of the
/// original request and only swap the body.
#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

impl UpstreamHttpRequest {
    pub fn with_body(&self, body: Bytes) -> Self {
        Self {
            method: self.method,
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: Some(body),
            is_stream: self.is_stream,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

/// Transport-level failure: no HTTP response was obtained.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream transport error ({kind:?}): {message}")]
pub struct UpstreamFailure {
    pub kind: TransportErrorKind,
    pub message: String,
}
