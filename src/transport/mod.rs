//! HTTP transport
//!
//! A single [`Transport`] is created at startup and shared (behind an `Arc`)
//! by every client and worker. It owns the reqwest connection pool and the
//! timeouts, executes exactly one request per call and classifies the result
//! into an [`Outcome`]:
//!
//! | Result | Outcome |
//! |--------|---------|
//! | 2xx | `Success` |
//! | timeout, connection reset, truncated body | `RetryableFailure` |
//! | 429, 500, 502, 503, 504 (or `SlowDown`, `InternalError`, ...) | `RetryableFailure` |
//! | other 4xx, signature mismatch, unparseable response | `FatalFailure` |
//!
//! Retrying is left to [`retry::RetryPolicy`].

use crate::metrics;
use crate::s3::xml::ErrorDocument;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Method, Url};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

pub mod retry;

pub use retry::RetryPolicy;

/// Transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// Applies to the whole exchange, body included
    pub request_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            pool_max_idle_per_host: 16,
            user_agent: format!("s3-cli/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Failure classes used for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Timeout,
    Connection,
    Throttled,
    ServerError,
    Authentication,
    Rejected,
    InvalidResponse,
    InvalidRequest,
}

impl FailureKind {
    /// Kinds that are worth another attempt
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::Connection
                | FailureKind::Throttled
                | FailureKind::ServerError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Connection => "connection",
            FailureKind::Throttled => "throttled",
            FailureKind::ServerError => "server_error",
            FailureKind::Authentication => "authentication",
            FailureKind::Rejected => "rejected",
            FailureKind::InvalidResponse => "invalid_response",
            FailureKind::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP {status}{}: {message}", code_suffix(.code))]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Response body truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Build an HTTP error from a status and the parsed `<Error>` document
    pub fn from_status(
        status: u16,
        document: Option<ErrorDocument>,
        retry_after: Option<Duration>,
    ) -> Self {
        let (code, message) = match document {
            Some(doc) => (Some(doc.code), doc.message),
            None => (None, default_reason(status)),
        };
        TransportError::Http {
            status,
            code,
            message,
            retry_after,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Timeout(_) => FailureKind::Timeout,
            TransportError::Connection(_) | TransportError::Truncated { .. } => {
                FailureKind::Connection
            }
            TransportError::Http { status, code, .. } => classify_status(*status, code.as_deref()),
            TransportError::InvalidResponse(_) => FailureKind::InvalidResponse,
            TransportError::InvalidRequest(_) => FailureKind::InvalidRequest,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_transient()
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// S3 error code (`NoSuchKey`, `SlowDown`, ...)
    pub fn code(&self) -> Option<&str> {
        match self {
            TransportError::Http { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Server-requested delay from a `Retry-After` header
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else {
            // connect, request, body and decode errors all mean the exchange broke off
            TransportError::Connection(err.to_string())
        }
    }
}

/// Map a status code, refined by the S3 error code, to a failure kind
pub fn classify_status(status: u16, code: Option<&str>) -> FailureKind {
    match code {
        Some("SlowDown") | Some("Throttling") | Some("ThrottlingException") => {
            return FailureKind::Throttled
        }
        Some("RequestTimeout") => return FailureKind::Timeout,
        Some("InternalError") | Some("ServiceUnavailable") => return FailureKind::ServerError,
        Some("SignatureDoesNotMatch")
        | Some("InvalidAccessKeyId")
        | Some("ExpiredToken")
        | Some("InvalidToken")
        | Some("AccessDenied") => return FailureKind::Authentication,
        _ => {}
    }

    match status {
        408 => FailureKind::Timeout,
        429 => FailureKind::Throttled,
        500 | 502 | 503 | 504 => FailureKind::ServerError,
        401 | 403 => FailureKind::Authentication,
        _ => FailureKind::Rejected,
    }
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" {}", c)).unwrap_or_default()
}

fn default_reason(status: u16) -> String {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("unexpected status")
        .to_string()
}

/// An outgoing request. Headers are usually the output of the signer.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }
}

/// A fully received response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    /// Header value as a string, if present and valid
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Typed result of one request
#[derive(Debug)]
pub enum Outcome {
    Success(HttpResponse),
    RetryableFailure(TransportError),
    FatalFailure(TransportError),
}

impl Outcome {
    pub fn from_error(err: TransportError) -> Self {
        if err.is_retryable() {
            Outcome::RetryableFailure(err)
        } else {
            Outcome::FatalFailure(err)
        }
    }

    pub fn into_result(self) -> Result<HttpResponse, TransportError> {
        match self {
            Outcome::Success(response) => Ok(response),
            Outcome::RetryableFailure(err) | Outcome::FatalFailure(err) => Err(err),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::RetryableFailure(_) => "retryable",
            Outcome::FatalFailure(_) => "fatal",
        }
    }
}

/// Shared HTTP transport
#[derive(Debug, Clone)]
pub struct Transport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl Transport {
    /// Build the connection pool
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Execute one request and classify the result
    pub async fn execute(&self, request: HttpRequest) -> Outcome {
        let method = request.method.clone();
        let started = Instant::now();
        let outcome = match self.exchange(request).await {
            Ok(response) if (200..300).contains(&response.status) => Outcome::Success(response),
            Ok(response) => {
                let document = ErrorDocument::parse(&response.body);
                let retry_after = parse_retry_after(&response.headers);
                Outcome::from_error(TransportError::from_status(
                    response.status,
                    document,
                    retry_after,
                ))
            }
            Err(err) => Outcome::from_error(err),
        };

        metrics::record_http_request(
            method.as_str(),
            outcome.label(),
            started.elapsed().as_secs_f64(),
        );
        if let Outcome::RetryableFailure(ref err) | Outcome::FatalFailure(ref err) = outcome {
            tracing::debug!(
                method = %method,
                kind = %err.kind(),
                error = %err,
                "HTTP request failed"
            );
        }
        outcome
    }

    /// Execute one request, collapsing the outcome into a `Result`
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.execute(request).await.into_result()
    }

    async fn exchange(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            // reqwest derives Host from the URL
            if name == "host" {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            headers.insert(name, value);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), request.url)
            .headers(headers);
        if request.method == Method::PUT || request.method == Method::POST {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(TransportError::from_reqwest)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// `Retry-After` as delta-seconds or an HTTP date
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}
