//! HTTP transport module.
//!
//! The resilience layer never constructs sockets itself; it drives a
//! [`Transport`] supplied by the caller. [`ReqwestTransport`] is the default
//! implementation.

mod http_transport;

pub use http_transport::ReqwestTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET request.
    Get,
    /// HEAD request.
    Head,
    /// POST request.
    Post,
    /// PUT request.
    Put,
    /// PATCH request.
    Patch,
    /// DELETE request.
    Delete,
}

impl Method {
    /// Method name as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// An outbound HTTP request, relative to the client's base URL.
///
/// Cloned once per attempt; the body is reference counted.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Path (and query) relative to the base URL.
    pub path: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Request body.
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// Creates a request without headers or body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Creates a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Creates a POST request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets a JSON body and content type.
    pub fn json<B: serde::Serialize>(self, body: &B) -> Result<Self, TransportError> {
        let bytes = serde_json::to_vec(body).map_err(|e| TransportError::Request {
            message: format!("Failed to serialize body: {}", e),
        })?;
        Ok(self
            .header("content-type", "application/json")
            .body(bytes))
    }
}

/// HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, names lower-cased.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body).map_err(|e| TransportError::Decode {
            message: e.to_string(),
        })
    }

    /// Converts a non-2xx response into [`TransportError::Status`].
    pub fn error_for_status(self) -> Result<Self, TransportError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(TransportError::Status {
            status: self.status,
            retry_after: parse_retry_after(&self.headers),
            body: String::from_utf8_lossy(&self.body).into_owned(),
        })
    }
}

/// Extracts a `Retry-After` delay given in whole seconds.
pub fn parse_retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Transport-layer failure of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, lossily decoded.
        body: String,
        /// Server-requested delay from `Retry-After`.
        retry_after: Option<Duration>,
    },

    /// The attempt exceeded its timeout.
    #[error("Request timeout: {message}")]
    Timeout {
        /// Error message.
        message: String,
    },

    /// Connection could not be established or was reset.
    #[error("Connection error: {message}")]
    Connection {
        /// Error message.
        message: String,
    },

    /// Host name resolution failed.
    #[error("DNS resolution failed: {message}")]
    Dns {
        /// Error message.
        message: String,
    },

    /// The request could not be built or sent.
    #[error("Request error: {message}")]
    Request {
        /// Error message.
        message: String,
    },

    /// The response body could not be read or decoded.
    #[error("Decode error: {message}")]
    Decode {
        /// Error message.
        message: String,
    },

    /// The operation was cancelled or its deadline passed.
    #[error("Request cancelled")]
    Cancelled,
}

impl TransportError {
    /// HTTP status for [`TransportError::Status`].
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Server-requested delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let message = err.to_string();
        if err.is_timeout() {
            TransportError::Timeout { message }
        } else if err.is_connect() {
            if looks_like_dns_failure(&err) {
                TransportError::Dns { message }
            } else {
                TransportError::Connection { message }
            }
        } else if err.is_body() || err.is_decode() {
            TransportError::Decode { message }
        } else if err.is_builder() {
            TransportError::Request { message }
        } else if let Some(status) = err.status() {
            TransportError::Status {
                status: status.as_u16(),
                body: message,
                retry_after: None,
            }
        } else {
            TransportError::Connection { message }
        }
    }
}

fn looks_like_dns_failure(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("dns") || text.contains("failed to lookup address") {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Sends one HTTP request. Implementations perform no retries.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the request and returns the raw response, whatever its status.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Absolute URL the request targets, for tracing.
    fn url_for(&self, request: &HttpRequest) -> String;
}
