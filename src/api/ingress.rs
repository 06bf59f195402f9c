//! Ingress protocol endpoints.
//!
//! The four protocol families are preserved verbatim: the body passes
//! through untouched except for model redirection, which happens inside
//! the pipeline. Handlers only snoop the envelope fields the proxy needs
//! (model, stream flag, session id) before handing off.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::auth::{authenticate, AuthFailure};
use super::routes::AppState;
use crate::limiter::LimitViolation;
use crate::pipeline::{RelayFailure, RelayRequest, RelayResponse};
use crate::providers::TargetProtocol;

// ─────────────────────────────────────────────────────────────────────────────
// Error envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    r#type: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_value: Option<f64>,
}

fn error_response(status: StatusCode, error_type: &str, message: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                r#type: error_type.to_string(),
                message,
                current_usage: None,
                limit_value: None,
            },
        }),
    )
        .into_response()
}

fn rate_limit_response(violation: &LimitViolation) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorResponse {
            error: ErrorBody {
                r#type: violation.limit_type.as_str().to_string(),
                message: format!(
                    "{} limit exceeded for {}",
                    violation.limit_type.as_str(),
                    match violation.scope {
                        crate::counters::SubjectKind::Key => "this key",
                        crate::counters::SubjectKind::User => "this user",
                        crate::counters::SubjectKind::Provider => "this provider",
                    }
                ),
                current_usage: Some(violation.current),
                limit_value: Some(violation.limit),
            },
        }),
    )
        .into_response()
}

fn failure_response(failure: RelayFailure) -> Response {
    match failure {
        RelayFailure::RateLimited(violation) => rate_limit_response(&violation),
        RelayFailure::NoAvailableProvider => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no_available_provider",
            "no healthy provider can serve this request".to_string(),
        ),
        RelayFailure::UpstreamExhausted { message } => error_response(
            StatusCode::BAD_GATEWAY,
            "upstream_unreachable",
            message,
        ),
        RelayFailure::Internal(message) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
        }
    }
}

fn auth_failure_response(failure: AuthFailure) -> Response {
    let message = match failure {
        AuthFailure::MissingCredentials => "missing API key",
        AuthFailure::UnknownKey => "invalid API key",
        AuthFailure::DisabledUser => "account disabled",
    };
    error_response(StatusCode::UNAUTHORIZED, "unauthorized", message.to_string())
}

fn relay_response(response: RelayResponse) -> Response {
    match response {
        RelayResponse::Full {
            status,
            content_type,
            body,
        } => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
            if let Some(ct) = content_type {
                builder = builder.header(header::CONTENT_TYPE, ct);
            }
            builder.body(Body::from(body)).unwrap_or_else(|_| {
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "failed to build response".to_string(),
                )
            })
        }
        RelayResponse::Stream {
            status,
            content_type,
            body,
        } => {
            let mut headers = HeaderMap::new();
            if let Ok(ct) = content_type.parse() {
                headers.insert(header::CONTENT_TYPE, ct);
            }
            headers.insert(header::CACHE_CONTROL, "no-cache".parse().expect("static"));
            (
                StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                headers,
                Body::from_stream(body),
            )
                .into_response()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope snooping
// ─────────────────────────────────────────────────────────────────────────────

/// The envelope fields the proxy inspects; everything else passes through.
#[derive(Debug, Default, Deserialize)]
struct RequestEnvelope {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    metadata: Option<EnvelopeMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeMetadata {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

fn parse_envelope(body: &[u8]) -> RequestEnvelope {
    serde_json::from_slice(body).unwrap_or_default()
}

/// Session id: explicit header first, then the body metadata the Anthropic
/// clients send.
fn session_id(headers: &HeaderMap, envelope: &RequestEnvelope) -> Option<String> {
    if let Some(id) = headers.get("x-session-id").and_then(|v| v.to_str().ok()) {
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    envelope.metadata.as_ref().and_then(|m| {
        m.session_id
            .clone()
            .or_else(|| m.user_id.clone())
            .filter(|v| !v.is_empty())
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Routes
// ─────────────────────────────────────────────────────────────────────────────

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/messages/count_tokens", post(anthropic_count_tokens))
        .route("/v1/chat/completions", post(openai_chat))
        .route("/v1/responses", post(openai_responses))
        .route("/v1beta/models/:model_action", post(gemini_generate))
        .route("/v1/models", get(list_models))
        .route("/v1beta/models", get(list_models_gemini))
}

#[allow(clippy::too_many_arguments)]
async fn relay(
    state: Arc<AppState>,
    headers: HeaderMap,
    target: TargetProtocol,
    endpoint: String,
    model: String,
    method: Method,
    body: Bytes,
    streaming: bool,
    session_id: Option<String>,
    count_tokens: bool,
) -> Response {
    let (key, user) = match authenticate(&headers, &state.store).await {
        Ok(pair) => pair,
        Err(failure) => return auth_failure_response(failure),
    };

    let request = RelayRequest {
        target,
        endpoint,
        model,
        method,
        body,
        streaming,
        session_id,
        count_tokens,
        key,
        user,
    };
    match state.pipeline.handle(request).await {
        Ok(response) => relay_response(response),
        Err(failure) => failure_response(failure),
    }
}

async fn anthropic_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope = parse_envelope(&body);
    let session = session_id(&headers, &envelope);
    relay(
        state,
        headers,
        TargetProtocol::Anthropic,
        "/v1/messages".to_string(),
        envelope.model.clone().unwrap_or_default(),
        Method::POST,
        body,
        envelope.stream.unwrap_or(false),
        session,
        false,
    )
    .await
}

async fn anthropic_count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope = parse_envelope(&body);
    let session = session_id(&headers, &envelope);
    relay(
        state,
        headers,
        TargetProtocol::Anthropic,
        "/v1/messages/count_tokens".to_string(),
        envelope.model.clone().unwrap_or_default(),
        Method::POST,
        body,
        false,
        session,
        true,
    )
    .await
}

async fn openai_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope = parse_envelope(&body);
    let session = session_id(&headers, &envelope);
    relay(
        state,
        headers,
        TargetProtocol::OpenaiChat,
        "/v1/chat/completions".to_string(),
        envelope.model.clone().unwrap_or_default(),
        Method::POST,
        body,
        envelope.stream.unwrap_or(false),
        session,
        false,
    )
    .await
}

async fn openai_responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope = parse_envelope(&body);
    let session = session_id(&headers, &envelope);
    relay(
        state,
        headers,
        TargetProtocol::OpenaiResponses,
        "/v1/responses".to_string(),
        envelope.model.clone().unwrap_or_default(),
        Method::POST,
        body,
        envelope.stream.unwrap_or(false),
        session,
        false,
    )
    .await
}

#[derive(Deserialize)]
struct GeminiQuery {
    #[serde(default)]
    alt: Option<String>,
}

async fn gemini_generate(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    Query(query): Query<GeminiQuery>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("expected model:action, got '{}'", model_action),
        );
    };
    let streaming = match action {
        "streamGenerateContent" => true,
        "generateContent" => false,
        other => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("unsupported action '{}'", other),
            )
        }
    };
    // alt=sse is how Gemini clients ask for SSE framing
    let streaming = streaming || query.alt.as_deref() == Some("sse");

    let mut endpoint = format!("/v1beta/models/{}", model_action);
    if let Some(raw) = raw_query {
        if !raw.is_empty() {
            endpoint = format!("{}?{}", endpoint, raw);
        }
    }

    let envelope = parse_envelope(&body);
    let session = session_id(&headers, &envelope);
    relay(
        state,
        headers,
        TargetProtocol::Gemini,
        endpoint,
        model.to_string(),
        Method::POST,
        body,
        streaming,
        session,
        false,
    )
    .await
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    relay(
        state,
        headers,
        TargetProtocol::OpenaiChat,
        "/v1/models".to_string(),
        String::new(),
        Method::GET,
        Bytes::new(),
        false,
        None,
        false,
    )
    .await
}

async fn list_models_gemini(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    relay(
        state,
        headers,
        TargetProtocol::Gemini,
        "/v1beta/models".to_string(),
        String::new(),
        Method::GET,
        Bytes::new(),
        false,
        None,
        false,
    )
    .await
}
