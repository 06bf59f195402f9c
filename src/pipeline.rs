//! The per-request coordinator: guard, select, dispatch, stream, retry,
//! record.
//!
//! Each inbound request runs this pipeline once. Retryable failures
//! re-enter the selector with already-tried providers excluded; every
//! attempt appends a provider-chain item; the recorder runs on every exit
//! path, including blocked and aborted requests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Method;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::breaker::SharedBreaker;
use crate::chain::{ChainItem, ChainReason, DecisionContext};
use crate::dispatch::{DispatchOutcome, DispatchPlan, SharedDispatcher, TimeoutProfile};
use crate::error::{ErrorKind, UpstreamError};
use crate::limiter::{LimitType, LimitViolation, SharedLimiter};
use crate::providers::{Provider, TargetProtocol};
use crate::redact::redact;
use crate::registry::SharedRegistry;
use crate::selector::{SelectionInput, SharedSelector};
use crate::sessions::{SharedSessions, DEFAULT_SESSION_TTL};
use crate::stream::{self, MergedResponse, TAP_CAPACITY};
use crate::tenants::{ApiKey, User};
use crate::upstream_auth::SharedAuthResolver;
use crate::usage::{RecordInput, SharedRecorder};

/// Default retry budget when the provider does not configure one.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Best-effort deadline for persisting partial usage after an abort.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(2);

/// One authenticated inbound request, protocol envelope already parsed.
pub struct RelayRequest {
    pub target: TargetProtocol,
    /// Ingress endpoint string, recorded on the log row
    pub endpoint: String,
    /// Client-requested model ("" for model-less passthrough like /models)
    pub model: String,
    pub method: Method,
    pub body: Bytes,
    pub streaming: bool,
    pub session_id: Option<String>,
    /// count_tokens requests are dispatched but never billed
    pub count_tokens: bool,
    pub key: ApiKey,
    pub user: User,
}

/// What goes back to the client.
pub enum RelayResponse {
    Full {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
    },
    Stream {
        status: u16,
        content_type: String,
        body: BoxStream<'static, Result<Bytes, std::io::Error>>,
    },
}

/// Local failures, mapped onto the client error taxonomy by the API layer.
pub enum RelayFailure {
    RateLimited(LimitViolation),
    NoAvailableProvider,
    UpstreamExhausted { message: String },
    Internal(String),
}

/// Shared pipeline type.
pub type SharedPipeline = Arc<Pipeline>;

pub struct Pipeline {
    registry: SharedRegistry,
    selector: SharedSelector,
    breaker: SharedBreaker,
    limiter: SharedLimiter,
    sessions: SharedSessions,
    auth: SharedAuthResolver,
    dispatcher: SharedDispatcher,
    recorder: SharedRecorder,
    /// Client used for credential resolution side calls
    http: reqwest::Client,
}

enum StreamEnd {
    Clean,
    Failed(String),
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: SharedRegistry,
        selector: SharedSelector,
        breaker: SharedBreaker,
        limiter: SharedLimiter,
        sessions: SharedSessions,
        auth: SharedAuthResolver,
        dispatcher: SharedDispatcher,
        recorder: SharedRecorder,
        http: reqwest::Client,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            selector,
            breaker,
            limiter,
            sessions,
            auth,
            dispatcher,
            recorder,
            http,
        })
    }

    /// Run one request through the pipeline.
    pub async fn handle(&self, req: RelayRequest) -> Result<RelayResponse, RelayFailure> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let now = Utc::now();

        // entry guard
        let key_active = self.sessions.count_by_key(req.key.id, now).await;
        let guard = crate::limiter::GuardInput {
            key: &req.key,
            user: &req.user,
            key_active_sessions: key_active,
        };
        if let Err(violation) = self.limiter.guard(&guard, now).await {
            let mut chain = Vec::new();
            if violation.limit_type == LimitType::ConcurrentSessions {
                chain.push(ChainItem {
                    provider_id: Uuid::nil(),
                    provider_name: String::new(),
                    reason: ChainReason::ConcurrentLimitFailed,
                    status_code: None,
                    cost_multiplier: 1.0,
                    priority: 0,
                    decision_context: None,
                    fallback_reason: None,
                });
            }
            self.record_blocked(
                request_id,
                &req,
                chain,
                "rate_limit",
                violation.limit_type.as_str(),
                started,
            )
            .await;
            return Err(RelayFailure::RateLimited(violation));
        }

        let providers = match self.registry.all().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let message = redact(&e.to_string());
                self.record_blocked(request_id, &req, Vec::new(), "system_error", &message, started)
                    .await;
                return Err(RelayFailure::Internal(message));
            }
        };

        let mut tried: HashSet<Uuid> = HashSet::new();
        let mut chain: Vec<ChainItem> = Vec::new();
        let mut attempts: u32 = 0;
        let mut max_attempts: Option<u32> = None;
        let mut last_error: Option<UpstreamError> = None;

        loop {
            let now = Utc::now();
            let selection_input = SelectionInput {
                target: req.target,
                model: &req.model,
                key_scope: &req.key.provider_groups,
                user_scope: &req.user.provider_groups,
                session_id: req.session_id.as_deref(),
                exclude: &tried,
            };
            let selection = match self
                .selector
                .select(&providers, &selection_input, now)
                .await
            {
                Ok(selection) => selection,
                Err(_) if chain.is_empty() => {
                    self.record_blocked(
                        request_id,
                        &req,
                        chain,
                        "no_available_provider",
                        "no provider passed the selection funnel",
                        started,
                    )
                    .await;
                    return Err(RelayFailure::NoAvailableProvider);
                }
                Err(_) => {
                    return self
                        .finish_exhausted(request_id, &req, chain, last_error, started)
                        .await;
                }
            };

            let provider = selection.provider.clone();
            let budget = *max_attempts.get_or_insert_with(|| {
                provider
                    .max_retry_attempts
                    .unwrap_or(DEFAULT_MAX_ATTEMPTS)
                    .min(selection.context.funnel.after_limits as u32)
                    .max(1)
            });

            // the first selection gets its own chain item; later ones ride
            // on their outcome item
            let pending_context = if attempts == 0 {
                chain.push(ChainItem {
                    provider_id: provider.id,
                    provider_name: provider.name.clone(),
                    reason: selection.reason,
                    status_code: None,
                    cost_multiplier: provider.cost_multiplier,
                    priority: provider.priority,
                    decision_context: Some(selection.context.clone()),
                    fallback_reason: None,
                });
                None
            } else {
                Some(selection.context.clone())
            };

            tried.insert(provider.id);
            attempts += 1;

            match self
                .attempt_provider(&req, &provider, request_id, started, &mut chain, pending_context, attempts)
                .await
            {
                AttemptOutcome::Done(result) => return result,
                AttemptOutcome::Retry(err) => {
                    last_error = Some(err);
                    if attempts >= budget {
                        return self
                            .finish_exhausted(request_id, &req, chain, last_error, started)
                            .await;
                    }
                }
            }
        }
    }

    /// Dispatch one attempt against one provider and translate the result.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_provider(
        &self,
        req: &RelayRequest,
        provider: &Provider,
        request_id: Uuid,
        started: Instant,
        chain: &mut Vec<ChainItem>,
        pending_context: Option<DecisionContext>,
        attempt: u32,
    ) -> AttemptOutcome {
        let now = Utc::now();
        let actual_model = provider.redirect_model(&req.model).to_string();
        let original_model =
            (actual_model != req.model && !req.model.is_empty()).then(|| req.model.clone());

        let auth = match self
            .auth
            .resolve(provider, req.target, &self.http, now)
            .await
        {
            Ok(auth) => auth,
            Err(e) => {
                tracing::warn!(
                    provider = %provider.name,
                    error = %e,
                    "Credential resolution failed, excluding provider"
                );
                chain.push(ChainItem {
                    provider_id: provider.id,
                    provider_name: provider.name.clone(),
                    reason: ChainReason::SystemError,
                    status_code: None,
                    cost_multiplier: provider.cost_multiplier,
                    priority: provider.priority,
                    decision_context: pending_context,
                    fallback_reason: None,
                });
                self.breaker.release_probe(provider.id).await;
                return AttemptOutcome::Retry(e);
            }
        };

        let body = if original_model.is_some() {
            match rewrite_model(&req.body, &actual_model) {
                Ok(body) => body,
                Err(message) => {
                    self.breaker.release_probe(provider.id).await;
                    return AttemptOutcome::Retry(UpstreamError::new(
                        ErrorKind::BadRequest,
                        message,
                    ));
                }
            }
        } else {
            req.body.clone()
        };

        let url = join_url(&provider.url, &req.endpoint);
        let mut plan = DispatchPlan {
            method: req.method.clone(),
            url,
            headers: auth.headers.clone(),
            body,
            streaming: req.streaming,
            timeouts: TimeoutProfile::for_provider(provider),
            proxy: provider.egress.clone(),
        };

        let mut outcome = self.dispatcher.execute(plan.clone()).await;

        // Gemini header-only auth rejected: retry the same provider once
        // with the key in the query string
        if let (Err(err), Some(key)) = (&outcome, &auth.query_key_fallback) {
            if err.kind == ErrorKind::Auth {
                plan.url = append_query_key(&plan.url, key);
                tracing::debug!(provider = %provider.name, "Retrying Gemini auth with query key");
                outcome = self.dispatcher.execute(plan).await;
            }
        }

        match outcome {
            Err(err) => {
                if err.kind.counts_as_breaker_failure() {
                    self.breaker
                        .on_failure(provider.id, &provider.breaker, Utc::now(), err.retry_after)
                        .await;
                } else {
                    self.breaker.release_probe(provider.id).await;
                }

                if err.is_retryable() {
                    chain.push(ChainItem {
                        provider_id: provider.id,
                        provider_name: provider.name.clone(),
                        reason: ChainReason::RetryFailed,
                        status_code: err.status_code,
                        cost_multiplier: provider.cost_multiplier,
                        priority: provider.priority,
                        decision_context: pending_context,
                        fallback_reason: None,
                    });
                    tracing::warn!(
                        provider = %provider.name,
                        kind = %err.kind,
                        status = ?err.status_code,
                        "Attempt failed, will retry on an alternate provider"
                    );
                    AttemptOutcome::Retry(err)
                } else {
                    // non-retryable: pass the upstream body through untouched
                    chain.push(ChainItem {
                        provider_id: provider.id,
                        provider_name: provider.name.clone(),
                        reason: ChainReason::ClientErrorNonRetryable,
                        status_code: err.status_code,
                        cost_multiplier: provider.cost_multiplier,
                        priority: provider.priority,
                        decision_context: pending_context,
                        fallback_reason: None,
                    });
                    let status = err.status_code.unwrap_or(502);
                    let body = err.body.clone().unwrap_or_default();
                    self.recorder
                        .record(RecordInput {
                            request_id,
                            key: req.key.clone(),
                            user: req.user.clone(),
                            provider: Some(provider.clone()),
                            model: actual_model,
                            original_model,
                            endpoint: req.endpoint.clone(),
                            status: Some(status),
                            merged: MergedResponse::default(),
                            chain: std::mem::take(chain),
                            duration_ms: Some(started.elapsed().as_millis() as u64),
                            ttfb_ms: None,
                            blocked_by: None,
                            blocked_reason: None,
                            error_message: Some(err.message.clone()),
                            count_tokens: req.count_tokens,
                        })
                        .await;
                    AttemptOutcome::Done(Ok(RelayResponse::Full {
                        status,
                        content_type: Some("application/json".to_string()),
                        body,
                    }))
                }
            }
            Ok(dispatched) => {
                let success_reason = if attempt > 1 {
                    ChainReason::RetrySuccess
                } else {
                    ChainReason::RequestSuccess
                };
                chain.push(ChainItem {
                    provider_id: provider.id,
                    provider_name: provider.name.clone(),
                    reason: success_reason,
                    status_code: Some(dispatched.status),
                    cost_multiplier: provider.cost_multiplier,
                    priority: provider.priority,
                    decision_context: pending_context,
                    fallback_reason: dispatched.fallback,
                });

                if let Some(session_id) = &req.session_id {
                    self.sessions
                        .open_session(
                            provider.id,
                            req.key.id,
                            session_id,
                            DEFAULT_SESSION_TTL,
                            Utc::now(),
                        )
                        .await;
                }

                let result = self
                    .finish_success(
                        req,
                        provider,
                        request_id,
                        started,
                        std::mem::take(chain),
                        actual_model,
                        original_model,
                        dispatched,
                    )
                    .await;
                AttemptOutcome::Done(result)
            }
        }
    }

    /// A 2xx upstream response: stream it through or collect it whole,
    /// then account for it.
    #[allow(clippy::too_many_arguments)]
    async fn finish_success(
        &self,
        req: &RelayRequest,
        provider: &Provider,
        request_id: Uuid,
        started: Instant,
        chain: Vec<ChainItem>,
        actual_model: String,
        original_model: Option<String>,
        dispatched: DispatchOutcome,
    ) -> Result<RelayResponse, RelayFailure> {
        let content_type = dispatched
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let ttfb_ms = dispatched.ttfb_ms;
        let status = dispatched.status;
        let timeouts = TimeoutProfile::for_provider(provider);

        // peek the first body chunk so body-sniffing stream detection works;
        // non-streaming requests stay under their overall deadline
        let peek_deadline = if req.streaming {
            timeouts.first_byte
        } else {
            timeouts.overall_non_streaming
        };
        let mut body_stream = dispatched.body;
        let first_chunk = match tokio::time::timeout(peek_deadline, body_stream.next()).await {
            Ok(Some(Ok(chunk))) => Some(chunk),
            Ok(Some(Err(e))) => {
                let message = redact(&e.to_string());
                return Err(self
                    .fail_after_headers(req, provider, request_id, started, chain, actual_model, original_model, message)
                    .await);
            }
            Ok(None) => None,
            Err(_) => {
                let message = "upstream produced no body before the deadline".to_string();
                return Err(self
                    .fail_after_headers(req, provider, request_id, started, chain, actual_model, original_model, message)
                    .await);
            }
        };

        let is_stream = req.streaming
            && stream::is_stream_response(
                content_type.as_deref(),
                first_chunk.as_deref().unwrap_or(&[]),
            );

        if is_stream {
            let rejoined: BoxStream<'static, Result<Bytes, reqwest::Error>> = match first_chunk {
                Some(chunk) => futures::stream::once(async move { Ok(chunk) })
                    .chain(body_stream)
                    .boxed(),
                None => body_stream,
            };

            let (tap_tx, tap_rx) = mpsc::channel(TAP_CAPACITY);
            let merge_task = tokio::spawn(stream::collect_merge(req.target, tap_rx));
            let forwarded = stream::forward_with_tap(rejoined, timeouts.idle, tap_tx);

            let (done_tx, done_rx) = oneshot::channel::<StreamEnd>();
            let monitored = async_stream::stream! {
                let mut inner = std::pin::pin!(forwarded);
                let mut done_tx = Some(done_tx);
                while let Some(item) = inner.next().await {
                    match item {
                        Ok(chunk) => yield Ok(chunk),
                        Err(e) => {
                            if let Some(tx) = done_tx.take() {
                                let _ = tx.send(StreamEnd::Failed(e.to_string()));
                            }
                            yield Err(e);
                            return;
                        }
                    }
                }
                if let Some(tx) = done_tx.take() {
                    let _ = tx.send(StreamEnd::Clean);
                }
            };

            // finalize detached so client cancellation cannot skip the
            // recorder; bounded by the best-effort deadline
            let pipeline = PipelineFinalizer {
                breaker: Arc::clone(&self.breaker),
                recorder: Arc::clone(&self.recorder),
            };
            let provider = provider.clone();
            let req_key = req.key.clone();
            let req_user = req.user.clone();
            let endpoint = req.endpoint.clone();
            let count_tokens = req.count_tokens;
            tokio::spawn(async move {
                let end = done_rx.await;
                let merged = match tokio::time::timeout(FINALIZE_TIMEOUT, merge_task).await {
                    Ok(Ok(merged)) => merged,
                    _ => MergedResponse::default(),
                };
                match end {
                    Ok(StreamEnd::Clean) => {
                        pipeline
                            .breaker
                            .on_success(provider.id, &provider.breaker, Utc::now())
                            .await;
                    }
                    Ok(StreamEnd::Failed(_)) => {
                        pipeline
                            .breaker
                            .on_failure(provider.id, &provider.breaker, Utc::now(), None)
                            .await;
                    }
                    // client went away; the provider did nothing wrong
                    Err(_) => pipeline.breaker.release_probe(provider.id).await,
                }
                let error_message = match end {
                    Ok(StreamEnd::Clean) => None,
                    Ok(StreamEnd::Failed(message)) => Some(message),
                    Err(_) => Some("client aborted".to_string()),
                };
                pipeline
                    .recorder
                    .record(RecordInput {
                        request_id,
                        key: req_key,
                        user: req_user,
                        provider: Some(provider),
                        model: actual_model,
                        original_model,
                        endpoint,
                        status: Some(status),
                        merged,
                        chain,
                        duration_ms: Some(started.elapsed().as_millis() as u64),
                        ttfb_ms: Some(ttfb_ms),
                        blocked_by: None,
                        blocked_reason: None,
                        error_message,
                        count_tokens,
                    })
                    .await;
            });

            return Ok(RelayResponse::Stream {
                status,
                content_type: content_type
                    .unwrap_or_else(|| "text/event-stream".to_string()),
                body: monitored.boxed(),
            });
        }

        // non-streaming: collect the body, merge in place
        let mut collected = Vec::new();
        if let Some(chunk) = first_chunk {
            collected.extend_from_slice(&chunk);
        }
        loop {
            match tokio::time::timeout(timeouts.overall_non_streaming, body_stream.next()).await {
                Ok(Some(Ok(chunk))) => collected.extend_from_slice(&chunk),
                Ok(Some(Err(e))) => {
                    let message = redact(&e.to_string());
                    return Err(self
                        .fail_after_headers(req, provider, request_id, started, chain, actual_model, original_model, message)
                        .await);
                }
                Ok(None) => break,
                Err(_) => {
                    let message = "upstream body read exceeded the deadline".to_string();
                    return Err(self
                        .fail_after_headers(req, provider, request_id, started, chain, actual_model, original_model, message)
                        .await);
                }
            }
        }
        let body = Bytes::from(collected);

        self.breaker
            .on_success(provider.id, &provider.breaker, Utc::now())
            .await;

        let merged = match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(value) => stream::merge_chunks(req.target, [value]),
            Err(_) => MergedResponse::default(),
        };

        self.recorder
            .record(RecordInput {
                request_id,
                key: req.key.clone(),
                user: req.user.clone(),
                provider: Some(provider.clone()),
                model: actual_model,
                original_model,
                endpoint: req.endpoint.clone(),
                status: Some(status),
                merged,
                chain,
                duration_ms: Some(started.elapsed().as_millis() as u64),
                ttfb_ms: Some(ttfb_ms),
                blocked_by: None,
                blocked_reason: None,
                error_message: None,
                count_tokens: req.count_tokens,
            })
            .await;

        Ok(RelayResponse::Full {
            status,
            content_type,
            body,
        })
    }

    /// The response headers were fine but the body never made it: mark the
    /// provider, record what we know, and surface 502.
    #[allow(clippy::too_many_arguments)]
    async fn fail_after_headers(
        &self,
        req: &RelayRequest,
        provider: &Provider,
        request_id: Uuid,
        started: Instant,
        chain: Vec<ChainItem>,
        actual_model: String,
        original_model: Option<String>,
        message: String,
    ) -> RelayFailure {
        self.breaker
            .on_failure(provider.id, &provider.breaker, Utc::now(), None)
            .await;
        self.recorder
            .record(RecordInput {
                request_id,
                key: req.key.clone(),
                user: req.user.clone(),
                provider: Some(provider.clone()),
                model: actual_model,
                original_model,
                endpoint: req.endpoint.clone(),
                status: None,
                merged: MergedResponse::default(),
                chain,
                duration_ms: Some(started.elapsed().as_millis() as u64),
                ttfb_ms: None,
                blocked_by: None,
                blocked_reason: None,
                error_message: Some(message.clone()),
                count_tokens: req.count_tokens,
            })
            .await;
        RelayFailure::UpstreamExhausted { message }
    }

    /// Retryable attempts ran out: record and surface 502.
    async fn finish_exhausted(
        &self,
        request_id: Uuid,
        req: &RelayRequest,
        chain: Vec<ChainItem>,
        last_error: Option<UpstreamError>,
        started: Instant,
    ) -> Result<RelayResponse, RelayFailure> {
        let message = last_error
            .map(|e| redact(&e.to_string()))
            .unwrap_or_else(|| "all candidate providers failed".to_string());
        let provider_id = chain.last().map(|item| item.provider_id);
        let provider = match provider_id {
            Some(id) => self.registry.by_id(id).await.ok().flatten(),
            None => None,
        };
        self.recorder
            .record(RecordInput {
                request_id,
                key: req.key.clone(),
                user: req.user.clone(),
                provider,
                model: req.model.clone(),
                original_model: None,
                endpoint: req.endpoint.clone(),
                status: None,
                merged: MergedResponse::default(),
                chain,
                duration_ms: Some(started.elapsed().as_millis() as u64),
                ttfb_ms: None,
                blocked_by: None,
                blocked_reason: None,
                error_message: Some(message.clone()),
                count_tokens: req.count_tokens,
            })
            .await;
        Err(RelayFailure::UpstreamExhausted { message })
    }

    /// A failure before any dispatch: record the row with its block reason.
    async fn record_blocked(
        &self,
        request_id: Uuid,
        req: &RelayRequest,
        chain: Vec<ChainItem>,
        blocked_by: &str,
        blocked_reason: &str,
        started: Instant,
    ) {
        self.recorder
            .record(RecordInput {
                request_id,
                key: req.key.clone(),
                user: req.user.clone(),
                provider: None,
                model: req.model.clone(),
                original_model: None,
                endpoint: req.endpoint.clone(),
                status: None,
                merged: MergedResponse::default(),
                chain,
                duration_ms: Some(started.elapsed().as_millis() as u64),
                ttfb_ms: None,
                blocked_by: Some(blocked_by.to_string()),
                blocked_reason: Some(redact(blocked_reason)),
                error_message: None,
                count_tokens: req.count_tokens,
            })
            .await;
    }
}

enum AttemptOutcome {
    Done(Result<RelayResponse, RelayFailure>),
    Retry(UpstreamError),
}

struct PipelineFinalizer {
    breaker: SharedBreaker,
    recorder: SharedRecorder,
}

/// Swap the `model` field inside the JSON request body.
fn rewrite_model(body: &[u8], new_model: &str) -> Result<Bytes, String> {
    if body.is_empty() {
        return Ok(Bytes::new());
    }
    let mut value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {}", e))?;
    value["model"] = serde_json::Value::String(new_model.to_string());
    serde_json::to_vec(&value)
        .map(Bytes::from)
        .map_err(|e| format!("failed to serialize body: {}", e))
}

fn join_url(base: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

fn append_query_key(url: &str, key: &str) -> String {
    if url.contains('?') {
        format!("{}&key={}", url, key)
    } else {
        format!("{}?key={}", url, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::chain::FallbackReason;
    use crate::config::CacheTier;
    use crate::counters::{CounterStore, Subject};
    use crate::dispatch::UpstreamCall;
    use crate::limiter::RateLimiter;
    use crate::pricing::{test_price, usd_to_nanos};
    use crate::providers::{test_provider, ProviderType};
    use crate::registry::ProviderRegistry;
    use crate::selector::ProviderSelector;
    use crate::sessions::SessionTracker;
    use crate::store::{SharedStore, Store};
    use crate::tenants::{test_key, test_user};
    use crate::upstream_auth::AuthResolver;
    use crate::usage::UsageRecorder;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted upstream: pops the next step per call, records the URLs hit.
    struct MockUpstream {
        steps: Mutex<Vec<MockStep>>,
        calls: Mutex<Vec<String>>,
    }

    enum MockStep {
        Ok {
            status: u16,
            body: &'static str,
            fallback: Option<FallbackReason>,
        },
        Err {
            kind: ErrorKind,
            status: Option<u16>,
        },
    }

    impl MockUpstream {
        fn new(steps: Vec<MockStep>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamCall for MockUpstream {
        async fn execute(&self, plan: DispatchPlan) -> Result<DispatchOutcome, UpstreamError> {
            self.calls.lock().unwrap().push(plan.url.clone());
            let step = {
                let mut steps = self.steps.lock().unwrap();
                if steps.is_empty() {
                    MockStep::Ok {
                        status: 200,
                        body: r#"{"model":"claude-sonnet-4","content":[],"usage":{"input_tokens":1,"output_tokens":1}}"#,
                        fallback: None,
                    }
                } else {
                    steps.remove(0)
                }
            };
            match step {
                MockStep::Ok {
                    status,
                    body,
                    fallback,
                } => {
                    let mut headers = reqwest::header::HeaderMap::new();
                    headers.insert("content-type", "application/json".parse().unwrap());
                    let chunk: Result<Bytes, reqwest::Error> = Ok(Bytes::from(body));
                    Ok(DispatchOutcome {
                        status,
                        headers,
                        ttfb_ms: 5,
                        fallback,
                        body: futures::stream::iter(vec![chunk]).boxed(),
                    })
                }
                MockStep::Err { kind, status } => {
                    let mut err = UpstreamError::new(kind, "scripted failure");
                    if let Some(status) = status {
                        err = err
                            .with_status(status)
                            .with_body(Bytes::from_static(b"{\"error\":\"scripted\"}"));
                    }
                    Err(err)
                }
            }
        }
    }

    struct Fixture {
        pipeline: SharedPipeline,
        store: SharedStore,
        breaker: crate::breaker::SharedBreaker,
        limiter: SharedLimiter,
        mock: Arc<MockUpstream>,
    }

    async fn fixture(providers: Vec<Provider>, steps: Vec<MockStep>) -> Fixture {
        let store = Arc::new(Store::open_in_memory().expect("open"));
        for p in &providers {
            store.upsert_provider(p).await.expect("provider");
        }
        store
            .upsert_price(&test_price("claude-sonnet-4"))
            .await
            .expect("price");

        let registry = ProviderRegistry::new(Arc::clone(&store), Duration::from_secs(60));
        let breaker = CircuitBreaker::new(Arc::clone(&store));
        let limiter = RateLimiter::new(CounterStore::new(), 0);
        let sessions = SessionTracker::new();
        let selector = ProviderSelector::new(
            Arc::clone(&breaker),
            Arc::clone(&limiter),
            Arc::clone(&sessions),
        );
        let recorder = UsageRecorder::new(
            Arc::clone(&store),
            Arc::clone(&limiter),
            CacheTier::FiveMinute,
        );
        let mock = MockUpstream::new(steps);
        let pipeline = Pipeline::new(
            registry,
            selector,
            Arc::clone(&breaker),
            Arc::clone(&limiter),
            sessions,
            AuthResolver::new(),
            Arc::clone(&mock) as SharedDispatcher,
            recorder,
            reqwest::Client::new(),
        );
        Fixture {
            pipeline,
            store,
            breaker,
            limiter,
            mock,
        }
    }

    fn request(key: ApiKey, user: User) -> RelayRequest {
        RelayRequest {
            target: TargetProtocol::Anthropic,
            endpoint: "/v1/messages".to_string(),
            model: "claude-sonnet-4".to_string(),
            method: Method::POST,
            body: Bytes::from_static(b"{\"model\":\"claude-sonnet-4\",\"messages\":[]}"),
            streaming: false,
            session_id: None,
            count_tokens: false,
            key,
            user,
        }
    }

    const SUCCESS_BODY: &str = r#"{"model":"claude-sonnet-4","content":[{"type":"text","text":"ok"}],"usage":{"input_tokens":1000,"output_tokens":500}}"#;

    #[tokio::test]
    async fn happy_path_chain_and_counters() {
        let mut p1 = test_provider("p1", ProviderType::Claude);
        p1.weight = 100;
        let mut p2 = test_provider("p2", ProviderType::Claude);
        p2.priority = 1;
        let fx = fixture(
            vec![p1.clone(), p2],
            vec![MockStep::Ok {
                status: 200,
                body: SUCCESS_BODY,
                fallback: None,
            }],
        )
        .await;
        let user = test_user();
        let key = test_key(user.id);

        let got = fx
            .pipeline
            .handle(request(key.clone(), user.clone()))
            .await;
        let Ok(RelayResponse::Full { status, .. }) = got else {
            panic!("expected full response");
        };
        assert_eq!(status, 200);

        // counters increased by exactly the cost
        let snapshot = fx
            .limiter
            .cost_snapshot(&Subject::key(key.id), key.total_cost_reset_at, Utc::now())
            .await;
        // 1000 * 3000 + 500 * 15000 = 10_500_000 nanos = $0.0105
        assert!((snapshot.total_usd - 0.0105).abs() < 1e-9);

        // the chain on the persisted row: initial_selection then
        // request_success at p1
        let row = latest_row(&fx.store).await;
        assert_eq!(row.provider_chain.len(), 2);
        assert_eq!(row.provider_chain[0].reason, ChainReason::InitialSelection);
        assert_eq!(row.provider_chain[0].provider_id, p1.id);
        let ctx = row.provider_chain[0]
            .decision_context
            .as_ref()
            .expect("context");
        assert!((ctx.candidates[0].probability - 1.0).abs() < 1e-9);
        assert_eq!(row.provider_chain[1].reason, ChainReason::RequestSuccess);
        assert_eq!(row.provider_chain[1].status_code, Some(200));
    }

    /// Read the single usage row the scenario wrote.
    async fn latest_row(store: &SharedStore) -> crate::store::UsageLogRow {
        // scenarios write exactly one row; fetch it through a tiny scan
        let ids = store.usage_ids_for_tests().await;
        assert_eq!(ids.len(), 1, "expected exactly one usage row");
        store.get_usage(ids[0]).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn retry_then_succeed_records_chain_and_breaker() {
        let mut p1 = test_provider("p1", ProviderType::Claude);
        p1.priority = 0;
        let mut p2 = test_provider("p2", ProviderType::Claude);
        p2.priority = 1;
        let fx = fixture(
            vec![p1.clone(), p2.clone()],
            vec![
                MockStep::Err {
                    kind: ErrorKind::Upstream5xx,
                    status: Some(502),
                },
                MockStep::Ok {
                    status: 200,
                    body: SUCCESS_BODY,
                    fallback: None,
                },
            ],
        )
        .await;
        let user = test_user();
        let key = test_key(user.id);

        let got = fx.pipeline.handle(request(key, user)).await;
        assert!(matches!(got, Ok(RelayResponse::Full { status: 200, .. })));

        let row = latest_row(&fx.store).await;
        let reasons: Vec<ChainReason> =
            row.provider_chain.iter().map(|item| item.reason).collect();
        assert_eq!(
            reasons,
            vec![
                ChainReason::InitialSelection,
                ChainReason::RetryFailed,
                ChainReason::RetrySuccess
            ]
        );
        assert_eq!(row.provider_chain[1].provider_id, p1.id);
        assert_eq!(row.provider_chain[1].status_code, Some(502));
        assert_eq!(row.provider_chain[2].provider_id, p2.id);

        // p1 took one breaker failure; p2 is untouched
        let health = fx.breaker.health_snapshot(&[p1.id, p2.id], Utc::now()).await;
        assert_eq!(health[0].failure_count, 1);
        assert_eq!(health[1].failure_count, 0);
    }

    #[tokio::test]
    async fn three_500s_open_the_breaker_and_fourth_routes_elsewhere() {
        let mut p1 = test_provider("p1", ProviderType::Claude);
        p1.breaker.failure_threshold = 3;
        p1.max_retry_attempts = Some(1);
        let mut p2 = test_provider("p2", ProviderType::Claude);
        p2.priority = 1;
        let fx = fixture(
            vec![p1.clone(), p2.clone()],
            vec![
                MockStep::Err { kind: ErrorKind::Upstream5xx, status: Some(500) },
                MockStep::Err { kind: ErrorKind::Upstream5xx, status: Some(500) },
                MockStep::Err { kind: ErrorKind::Upstream5xx, status: Some(500) },
                MockStep::Ok { status: 200, body: SUCCESS_BODY, fallback: None },
            ],
        )
        .await;
        let user = test_user();
        let key = test_key(user.id);

        for _ in 0..3 {
            let _ = fx
                .pipeline
                .handle(request(key.clone(), user.clone()))
                .await;
        }
        assert_eq!(
            fx.breaker.state_of(p1.id, Utc::now()).await,
            crate::breaker::CircuitState::Open
        );

        // the fourth request goes straight to p2 without touching p1
        let calls_before = fx.mock.calls().len();
        let got = fx.pipeline.handle(request(key, user)).await;
        assert!(matches!(got, Ok(RelayResponse::Full { status: 200, .. })));
        let calls = fx.mock.calls();
        assert_eq!(calls.len(), calls_before + 1);
        assert!(calls.last().unwrap().contains("api.example.com"));
    }

    #[tokio::test]
    async fn daily_limit_blocks_without_upstream_call() {
        let p1 = test_provider("p1", ProviderType::Claude);
        let fx = fixture(vec![p1], vec![]).await;
        let user = test_user();
        let mut key = test_key(user.id);
        key.limits.limit_daily_usd = Some(10.0);

        fx.limiter
            .commit(
                &Subject::key(key.id),
                usd_to_nanos(10.0),
                1,
                key.total_cost_reset_at,
                Utc::now(),
            )
            .await;

        let got = fx.pipeline.handle(request(key, user)).await;
        let Err(RelayFailure::RateLimited(violation)) = got else {
            panic!("expected rate limit");
        };
        assert_eq!(violation.limit_type.as_str(), "rate_limit_usd_daily");
        assert!(fx.mock.calls().is_empty(), "no upstream call may happen");

        let row = latest_row(&fx.store).await;
        assert_eq!(row.blocked_by.as_deref(), Some("rate_limit"));
        assert_eq!(row.blocked_reason.as_deref(), Some("rate_limit_usd_daily"));
    }

    #[tokio::test]
    async fn no_provider_yields_503_failure() {
        let fx = fixture(vec![], vec![]).await;
        let user = test_user();
        let key = test_key(user.id);
        let got = fx.pipeline.handle(request(key, user)).await;
        assert!(matches!(got, Err(RelayFailure::NoAvailableProvider)));
        let row = latest_row(&fx.store).await;
        assert_eq!(row.blocked_by.as_deref(), Some("no_available_provider"));
    }

    #[tokio::test]
    async fn non_retryable_error_passes_upstream_body_through() {
        let p1 = test_provider("p1", ProviderType::Claude);
        let p2 = test_provider("p2", ProviderType::Claude);
        let fx = fixture(
            vec![p1, p2],
            vec![MockStep::Err {
                kind: ErrorKind::BadRequest,
                status: Some(400),
            }],
        )
        .await;
        let user = test_user();
        let key = test_key(user.id);

        let got = fx.pipeline.handle(request(key, user)).await;
        let Ok(RelayResponse::Full { status, body, .. }) = got else {
            panic!("expected passthrough");
        };
        assert_eq!(status, 400);
        assert_eq!(&body[..], b"{\"error\":\"scripted\"}");
        // only one upstream call: 400 is not retried
        assert_eq!(fx.mock.calls().len(), 1);

        let row = latest_row(&fx.store).await;
        assert_eq!(
            row.provider_chain.last().unwrap().reason,
            ChainReason::ClientErrorNonRetryable
        );
    }

    #[tokio::test]
    async fn exhausted_retries_surface_upstream_unreachable() {
        let p1 = test_provider("p1", ProviderType::Claude);
        let mut p2 = test_provider("p2", ProviderType::Claude);
        p2.priority = 1;
        let fx = fixture(
            vec![p1, p2],
            vec![
                MockStep::Err { kind: ErrorKind::Upstream5xx, status: Some(502) },
                MockStep::Err { kind: ErrorKind::Upstream5xx, status: Some(502) },
            ],
        )
        .await;
        let user = test_user();
        let key = test_key(user.id);

        let got = fx.pipeline.handle(request(key, user)).await;
        assert!(matches!(got, Err(RelayFailure::UpstreamExhausted { .. })));
        assert_eq!(fx.mock.calls().len(), 2);
    }

    #[tokio::test]
    async fn model_redirect_rewrites_body_and_keeps_original() {
        let mut p1 = test_provider("p1", ProviderType::Claude);
        p1.model_redirects.insert(
            "claude-sonnet-4".to_string(),
            "claude-sonnet-4-backend".to_string(),
        );
        let fx = fixture(
            vec![p1],
            vec![MockStep::Ok {
                status: 200,
                body: SUCCESS_BODY,
                fallback: None,
            }],
        )
        .await;
        fx.store
            .upsert_price(&test_price("claude-sonnet-4-backend"))
            .await
            .expect("price");
        let user = test_user();
        let key = test_key(user.id);

        let got = fx.pipeline.handle(request(key, user)).await;
        assert!(matches!(got, Ok(RelayResponse::Full { status: 200, .. })));
        let row = latest_row(&fx.store).await;
        assert_eq!(row.model, "claude-sonnet-4-backend");
        assert_eq!(row.original_model.as_deref(), Some("claude-sonnet-4"));
    }

    #[tokio::test]
    async fn cloudflare_fallback_reason_lands_on_chain() {
        let p1 = test_provider("p1", ProviderType::Claude);
        let fx = fixture(
            vec![p1],
            vec![MockStep::Ok {
                status: 200,
                body: SUCCESS_BODY,
                fallback: Some(FallbackReason::Cloudflare),
            }],
        )
        .await;
        let user = test_user();
        let key = test_key(user.id);

        let got = fx.pipeline.handle(request(key, user)).await;
        assert!(matches!(got, Ok(RelayResponse::Full { status: 200, .. })));
        let row = latest_row(&fx.store).await;
        assert_eq!(
            row.provider_chain.last().unwrap().fallback_reason,
            Some(FallbackReason::Cloudflare)
        );
    }

    #[tokio::test]
    async fn count_tokens_records_zero_cost() {
        let p1 = test_provider("p1", ProviderType::Claude);
        let fx = fixture(
            vec![p1],
            vec![MockStep::Ok {
                status: 200,
                body: r#"{"input_tokens": 4242}"#,
                fallback: None,
            }],
        )
        .await;
        let user = test_user();
        let key = test_key(user.id);
        let mut req = request(key.clone(), user);
        req.endpoint = "/v1/messages/count_tokens".to_string();
        req.count_tokens = true;

        let got = fx.pipeline.handle(req).await;
        assert!(matches!(got, Ok(RelayResponse::Full { status: 200, .. })));
        let row = latest_row(&fx.store).await;
        assert_eq!(row.cost_nanos, 0);
        assert!(!row.billed);

        let snapshot = fx
            .limiter
            .cost_snapshot(&Subject::key(key.id), key.total_cost_reset_at, Utc::now())
            .await;
        assert_eq!(snapshot.total_usd, 0.0);
    }

    #[tokio::test]
    async fn streaming_passthrough_and_deferred_accounting() {
        let p1 = test_provider("p1", ProviderType::Claude);
        let stream_body = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4\",\"usage\":{\"input_tokens\":1000}}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":500}}\n\n\
data: [DONE]\n\n";
        let fx = fixture(vec![p1.clone()], vec![]).await;
        {
            // hand the mock a streaming step with SSE content type
            let mut steps = fx.mock.steps.lock().unwrap();
            steps.push(MockStep::Ok {
                status: 200,
                body: Box::leak(stream_body.to_string().into_boxed_str()),
                fallback: None,
            });
        }
        let user = test_user();
        let key = test_key(user.id);
        let mut req = request(key.clone(), user);
        req.streaming = true;

        let got = fx.pipeline.handle(req).await;
        let Ok(RelayResponse::Stream { status, body, .. }) = got else {
            panic!("expected stream");
        };
        assert_eq!(status, 200);

        let chunks: Vec<Bytes> = body.map(|r| r.expect("chunk")).collect().await;
        let raw: Vec<u8> = chunks.concat();
        assert_eq!(raw, stream_body.as_bytes(), "passthrough must be verbatim");

        // the detached finalizer needs a moment to run
        tokio::time::sleep(Duration::from_millis(200)).await;
        let row = latest_row(&fx.store).await;
        assert_eq!(row.input_tokens, 1000);
        assert_eq!(row.output_tokens, 500);
        assert_eq!(row.cost_nanos, 10_500_000);
        assert_eq!(
            fx.breaker.state_of(p1.id, Utc::now()).await,
            crate::breaker::CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn concurrent_half_open_probes_admit_exactly_one() {
        let mut p1 = test_provider("p1", ProviderType::Claude);
        p1.breaker.failure_threshold = 1;
        p1.breaker.open_duration_secs = 0;
        p1.breaker.half_open_success_threshold = 1;
        let mut p2 = test_provider("p2", ProviderType::Claude);
        p2.priority = 1;
        let fx = fixture(
            vec![p1.clone(), p2.clone()],
            vec![MockStep::Err {
                kind: ErrorKind::Upstream5xx,
                status: Some(500),
            }],
        )
        .await;

        // trip p1 (it retries onto p2, which serves the default 200)
        let user = test_user();
        let key = test_key(user.id);
        let _ = fx
            .pipeline
            .handle(request(key.clone(), user.clone()))
            .await;

        // with open_duration 0 the breaker is instantly probe-eligible;
        // two concurrent selections may admit only one probe at p1
        let now = Utc::now();
        let first = fx.breaker.admit(p1.id, now).await;
        let second = fx.breaker.admit(p1.id, now).await;
        assert_eq!(first, crate::breaker::Admission::Probe);
        assert_eq!(second, crate::breaker::Admission::Skip);

        // probe success closes the circuit with failures reset
        fx.breaker.on_success(p1.id, &p1.breaker, now).await;
        assert_eq!(
            fx.breaker.state_of(p1.id, now).await,
            crate::breaker::CircuitState::Closed
        );
        let health = fx.breaker.health_snapshot(&[p1.id], now).await;
        assert_eq!(health[0].failure_count, 0);
    }

    #[test]
    fn url_join_and_query_key() {
        assert_eq!(
            join_url("https://api.example.com/", "/v1/messages"),
            "https://api.example.com/v1/messages"
        );
        assert_eq!(
            append_query_key("https://g.example.com/v1beta/models/m:generateContent", "k"),
            "https://g.example.com/v1beta/models/m:generateContent?key=k"
        );
        assert_eq!(
            append_query_key("https://g.example.com/x?alt=sse", "k"),
            "https://g.example.com/x?alt=sse&key=k"
        );
    }

    #[test]
    fn rewrite_model_swaps_in_place() {
        let body = br#"{"model":"a","messages":[{"role":"user"}]}"#;
        let out = rewrite_model(body, "b").expect("rewrite");
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "b");
        assert!(value["messages"].is_array());
    }
}
