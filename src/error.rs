//! Upstream error types with retry classification.
//!
//! Distinguishes between retryable failures (another provider may succeed)
//! and non-retryable ones (the client request itself is at fault).

use std::time::Duration;

/// Classification of upstream failures.
///
/// The classifier runs exactly once, at the dispatcher boundary; everything
/// downstream branches on this enum and never re-inspects messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum ErrorKind {
    /// Client-side cancellation
    ClientAborted,
    /// Deadline exceeded at any stage (first byte, idle, overall)
    Timeout,
    /// TLS failure: altname mismatch, self-signed, expired, handshake
    Ssl,
    /// Connection refused / reset, DNS failure, socket timeout
    Network,
    /// HTTP 5xx
    Upstream5xx,
    /// HTTP 429
    RateLimit,
    /// HTTP 401/403
    Auth,
    /// HTTP 400
    BadRequest,
    /// HTTP 4xx other than 400/401/403/429
    Other4xx,
    /// SSE/NDJSON framing or chunk-merge failure
    StreamParse,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed on an alternate provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Network
                | ErrorKind::Ssl
                | ErrorKind::Upstream5xx
                | ErrorKind::RateLimit
        )
    }

    /// Whether this kind counts as a failure for the circuit breaker.
    ///
    /// 4xx other than 429 reflect the request, not provider health.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Network
                | ErrorKind::Ssl
                | ErrorKind::Upstream5xx
                | ErrorKind::RateLimit
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClientAborted => "client_aborted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Ssl => "ssl",
            ErrorKind::Network => "network",
            ErrorKind::Upstream5xx => "upstream_5xx",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Other4xx => "other_4xx",
            ErrorKind::StreamParse => "stream_parse",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified upstream failure.
#[derive(Debug)]
pub struct UpstreamError {
    pub kind: ErrorKind,
    /// HTTP status code, if the failure had one
    pub status_code: Option<u16>,
    /// Redacted message suitable for logs and the usage row
    pub message: String,
    /// Suggested delay from a Retry-After header, if present
    pub retry_after: Option<Duration>,
    /// The upstream response body, preserved for non-retryable passthrough
    pub body: Option<bytes::Bytes>,
    /// Gateway-style status carrying Cloudflare edge markers; feeds the
    /// dispatcher's direct-fallback decision
    pub cloudflare_gateway: bool,
}

impl UpstreamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
            retry_after: None,
            body: None,
            cloudflare_gateway: false,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn with_body(mut self, body: bytes::Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_cloudflare_gateway(mut self, flag: bool) -> Self {
        self.cloudflare_gateway = flag;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Classify an HTTP status code.
pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimit,
        401 | 403 => ErrorKind::Auth,
        400 => ErrorKind::BadRequest,
        402..=499 => ErrorKind::Other4xx,
        500..=599 => ErrorKind::Upstream5xx,
        _ => ErrorKind::Upstream5xx,
    }
}

/// Classify a transport-level `reqwest` failure.
///
/// TLS problems surface as connect errors whose source chain mentions the
/// certificate; we match on the rendered chain since reqwest does not expose
/// a structured TLS error.
pub fn classify_transport_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }
    let rendered = format!("{:?}", err).to_ascii_lowercase();
    if rendered.contains("certificate")
        || rendered.contains("self-signed")
        || rendered.contains("self signed")
        || rendered.contains("handshake")
        || rendered.contains("altname")
        || rendered.contains("unable to verify")
        || rendered.contains("tls")
    {
        return ErrorKind::Ssl;
    }
    ErrorKind::Network
}
