//! Proxy-aware HTTP dispatch.
//!
//! Executes one upstream attempt from a [`DispatchPlan`]: optional egress
//! proxy, first-byte / overall deadlines, and a Cloudflare-aware direct
//! fallback when a proxied attempt dies at the gateway. Failures are
//! classified here, once; everything downstream works with [`ErrorKind`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::chain::FallbackReason;
use crate::error::{classify_http_status, classify_transport_error, ErrorKind, UpstreamError};
use crate::providers::{EgressPolicy, Provider};
use crate::redact::redact;

/// Default first-byte timeout for streaming requests.
const DEFAULT_FIRST_BYTE: Duration = Duration::from_secs(30);
/// Default idle timeout between streamed chunks.
const DEFAULT_IDLE: Duration = Duration::from_secs(30);
/// Default overall deadline for non-streaming requests.
const DEFAULT_NON_STREAMING: Duration = Duration::from_secs(300);

/// Gateway-style statuses eligible for the direct fallback.
const GATEWAY_STATUSES: &[u16] = &[502, 504, 520, 521, 522, 523, 524, 525, 526, 527, 530];

/// Cap on how much of an error body is read back.
const MAX_ERROR_BODY: usize = 1024 * 1024;

/// Deadlines for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutProfile {
    pub first_byte: Duration,
    pub idle: Duration,
    pub overall_non_streaming: Duration,
}

impl TimeoutProfile {
    pub fn for_provider(provider: &Provider) -> Self {
        Self {
            first_byte: provider
                .timeouts
                .first_byte_streaming_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_FIRST_BYTE),
            idle: provider
                .timeouts
                .streaming_idle_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_IDLE),
            overall_non_streaming: provider
                .timeouts
                .request_non_streaming_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_NON_STREAMING),
        }
    }
}

/// Everything one upstream attempt needs. The dispatcher is pure with
/// respect to this value.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub streaming: bool,
    pub timeouts: TimeoutProfile,
    pub proxy: EgressPolicy,
}

/// Body bytes as they arrive from the upstream.
pub type UpstreamByteStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// A successful (2xx) upstream response, body not yet consumed.
pub struct DispatchOutcome {
    pub status: u16,
    pub headers: HeaderMap,
    /// Time until response headers arrived
    pub ttfb_ms: u64,
    /// Set when the direct fallback produced this response
    pub fallback: Option<FallbackReason>,
    pub body: UpstreamByteStream,
}

/// The dispatcher seam: pipeline tests script upstream behavior through it.
#[async_trait]
pub trait UpstreamCall: Send + Sync {
    async fn execute(&self, plan: DispatchPlan) -> Result<DispatchOutcome, UpstreamError>;
}

/// Shared dispatcher type.
pub type SharedDispatcher = Arc<dyn UpstreamCall>;

pub struct HttpDispatcher {
    direct: reqwest::Client,
    /// Per-proxy-URL clients, built on demand
    proxied: RwLock<HashMap<String, reqwest::Client>>,
}

fn looks_like_cloudflare(headers: &HeaderMap) -> bool {
    if headers.contains_key("cf-ray") || headers.contains_key("cf-cache-status") {
        return true;
    }
    let header_mentions = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("cloudflare"))
    };
    header_mentions("server") || header_mentions("via")
}

fn is_gateway_status(status: u16) -> bool {
    GATEWAY_STATUSES.contains(&status)
}

/// Parse a numeric `Retry-After` header.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

impl HttpDispatcher {
    pub fn new(direct: reqwest::Client) -> Arc<Self> {
        Arc::new(Self {
            direct,
            proxied: RwLock::new(HashMap::new()),
        })
    }

    async fn client_for(&self, proxy_url: &str) -> Result<reqwest::Client, UpstreamError> {
        {
            let proxied = self.proxied.read().await;
            if let Some(client) = proxied.get(proxy_url) {
                return Ok(client.clone());
            }
        }
        let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
            UpstreamError::new(
                ErrorKind::Network,
                redact(&format!("invalid egress proxy url: {}", e)),
            )
        })?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .build()
            .map_err(|e| {
                UpstreamError::new(
                    ErrorKind::Network,
                    redact(&format!("failed to build proxied client: {}", e)),
                )
            })?;
        let mut proxied = self.proxied.write().await;
        proxied.insert(proxy_url.to_string(), client.clone());
        Ok(client)
    }

    /// One attempt against one client, with its own timers.
    async fn attempt(
        &self,
        client: &reqwest::Client,
        plan: &DispatchPlan,
    ) -> Result<DispatchOutcome, UpstreamError> {
        let started = Instant::now();
        let mut request = client
            .request(plan.method.clone(), &plan.url)
            .headers(plan.headers.clone());
        if !plan.body.is_empty() {
            request = request.body(plan.body.clone());
        }

        let send = if plan.streaming {
            // reqwest resolves send() when response headers arrive; the
            // first-byte deadline wraps exactly that
            match tokio::time::timeout(plan.timeouts.first_byte, request.send()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(UpstreamError::new(
                        ErrorKind::Timeout,
                        format!(
                            "no first byte within {} ms",
                            plan.timeouts.first_byte.as_millis()
                        ),
                    ))
                }
            }
        } else {
            request
                .timeout(plan.timeouts.overall_non_streaming)
                .send()
                .await
        };

        let response = send.map_err(|e| {
            UpstreamError::new(classify_transport_error(&e), redact(&e.to_string()))
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let ttfb_ms = started.elapsed().as_millis() as u64;

        if (200..300).contains(&status) {
            return Ok(DispatchOutcome {
                status,
                headers,
                ttfb_ms,
                fallback: None,
                body: response.bytes_stream().boxed(),
            });
        }

        let retry_after = parse_retry_after(&headers);
        let cloudflare_gateway = is_gateway_status(status) && looks_like_cloudflare(&headers);
        let body = read_bounded_body(response).await;
        let snippet = String::from_utf8_lossy(&body[..body.len().min(512)]).to_string();
        Err(UpstreamError::new(
            classify_http_status(status),
            redact(&format!("upstream status {}: {}", status, snippet)),
        )
        .with_status(status)
        .with_retry_after(retry_after)
        .with_cloudflare_gateway(cloudflare_gateway)
        .with_body(body))
    }
}

async fn read_bounded_body(response: reqwest::Response) -> Bytes {
    let mut collected = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                if collected.len() + chunk.len() > MAX_ERROR_BODY {
                    collected.extend_from_slice(&chunk[..MAX_ERROR_BODY - collected.len()]);
                    break;
                }
                collected.extend_from_slice(&chunk);
            }
            Err(_) => break,
        }
    }
    Bytes::from(collected)
}

#[async_trait]
impl UpstreamCall for HttpDispatcher {
    async fn execute(&self, plan: DispatchPlan) -> Result<DispatchOutcome, UpstreamError> {
        let Some(proxy_url) = plan.proxy.proxy_url.clone() else {
            return self.attempt(&self.direct, &plan).await;
        };

        let client = self.client_for(&proxy_url).await?;
        let proxied_result = self.attempt(&client, &plan).await;

        if !plan.proxy.proxy_fallback_to_direct {
            return proxied_result;
        }

        match proxied_result {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.cloudflare_gateway => {
                tracing::info!(
                    proxy = %proxy_url,
                    status = ?err.status_code,
                    "Cloudflare gateway error through egress proxy, retrying direct"
                );
                let mut outcome = self.attempt(&self.direct, &plan).await?;
                outcome.fallback = Some(FallbackReason::Cloudflare);
                Ok(outcome)
            }
            Err(err)
                if matches!(
                    err.kind,
                    ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Ssl
                ) =>
            {
                tracing::info!(
                    proxy = %proxy_url,
                    error = %err,
                    "Proxied attempt failed at transport level, retrying direct"
                );
                let mut outcome = self.attempt(&self.direct, &plan).await?;
                outcome.fallback = Some(FallbackReason::ProxyError);
                Ok(outcome)
            }
            Err(err) => Err(err),
        }
    }
}
