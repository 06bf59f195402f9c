//! Upstream authentication: protocol-specific header construction.
//!
//! Anthropic-family keys are placed by hostname (first-party hosts take
//! `x-api-key`, relay-looking hosts take `Authorization: Bearer`, unknown
//! hosts get both). Gemini keys that are service-account JSON blobs are
//! resolved to OAuth bearer tokens and cached until expiry. Every request
//! carries the User-Agent of the protocol's canonical CLI, since some
//! relays gate on it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::sync::OnceLock;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ErrorKind, UpstreamError};
use crate::providers::{Provider, TargetProtocol};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const ANTHROPIC_CLI_USER_AGENT: &str = "claude-cli/1.0.119 (external, cli)";
const OPENAI_CLI_USER_AGENT: &str = "codex_cli_rs/0.21.0 (Ubuntu 22.04.5 LTS; x86_64)";
const GEMINI_CLI_USER_AGENT: &str = "GeminiCLI/0.4.1 (linux; x64)";

const TOKEN_SCOPE: &str =
    "https://www.googleapis.com/auth/generative-language https://www.googleapis.com/auth/cloud-platform";

/// Seconds of validity left below which a cached token is refreshed.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

fn relay_host_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)proxy|relay|gateway|router|worker|openai|openrouter|api2d|gpt")
            .expect("relay host pattern")
    })
}

/// Resolved auth material for one dispatch attempt.
#[derive(Debug, Clone)]
pub struct AuthHeaders {
    pub headers: HeaderMap,
    /// For Gemini header auth: the raw key to append as `?key=` if the
    /// header-only attempt comes back 401/403
    pub query_key_fallback: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Google service-account JSON blob, the fields token minting needs.
#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(serde::Serialize)]
struct TokenClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// Shared resolver type.
pub type SharedAuthResolver = Arc<AuthResolver>;

#[derive(Default)]
pub struct AuthResolver {
    /// provider id -> minted bearer token
    tokens: RwLock<HashMap<Uuid, CachedToken>>,
}

fn header_pair(map: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), UpstreamError> {
    let value = HeaderValue::from_str(value).map_err(|e| {
        UpstreamError::new(ErrorKind::BadRequest, format!("invalid header value: {}", e))
    })?;
    map.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// Whether the key looks like a service-account JSON blob rather than an
/// API key string.
fn is_service_account_json(key: &str) -> bool {
    let trimmed = key.trim_start();
    trimmed.starts_with('{') && trimmed.contains("private_key")
}

fn host_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

impl AuthResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build the auth headers for one provider and target protocol.
    pub async fn resolve(
        &self,
        provider: &Provider,
        target: TargetProtocol,
        http: &reqwest::Client,
        now: DateTime<Utc>,
    ) -> Result<AuthHeaders, UpstreamError> {
        let mut headers = HeaderMap::new();
        header_pair(&mut headers, "content-type", "application/json")?;
        let mut query_key_fallback = None;

        match target {
            TargetProtocol::Anthropic => {
                header_pair(&mut headers, "anthropic-version", ANTHROPIC_VERSION)?;
                header_pair(&mut headers, "user-agent", ANTHROPIC_CLI_USER_AGENT)?;
                let host = host_of(&provider.url).unwrap_or_default();
                let first_party =
                    host.ends_with("anthropic.com") || host.ends_with("claude.ai");
                if first_party {
                    header_pair(&mut headers, "x-api-key", &provider.api_key)?;
                } else if relay_host_pattern().is_match(&host) {
                    header_pair(
                        &mut headers,
                        "authorization",
                        &format!("Bearer {}", provider.api_key),
                    )?;
                } else {
                    header_pair(&mut headers, "x-api-key", &provider.api_key)?;
                    header_pair(
                        &mut headers,
                        "authorization",
                        &format!("Bearer {}", provider.api_key),
                    )?;
                }
            }
            TargetProtocol::OpenaiChat | TargetProtocol::OpenaiResponses => {
                header_pair(&mut headers, "user-agent", OPENAI_CLI_USER_AGENT)?;
                header_pair(
                    &mut headers,
                    "authorization",
                    &format!("Bearer {}", provider.api_key),
                )?;
            }
            TargetProtocol::Gemini => {
                header_pair(&mut headers, "user-agent", GEMINI_CLI_USER_AGENT)?;
                if is_service_account_json(&provider.api_key) {
                    let token = self.bearer_for(provider, http, now).await?;
                    header_pair(&mut headers, "authorization", &format!("Bearer {}", token))?;
                } else {
                    header_pair(&mut headers, "x-goog-api-key", &provider.api_key)?;
                    query_key_fallback = Some(provider.api_key.clone());
                }
            }
        }

        Ok(AuthHeaders {
            headers,
            query_key_fallback,
        })
    }

    /// Resolve a service-account JSON credential to a bearer token, cached
    /// per provider until shortly before expiry.
    async fn bearer_for(
        &self,
        provider: &Provider,
        http: &reqwest::Client,
        now: DateTime<Utc>,
    ) -> Result<String, UpstreamError> {
        {
            let tokens = self.tokens.read().await;
            if let Some(cached) = tokens.get(&provider.id) {
                if cached.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > now {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let sa: ServiceAccountKey = serde_json::from_str(&provider.api_key).map_err(|e| {
            UpstreamError::new(
                ErrorKind::Auth,
                format!("invalid service-account credential: {}", e),
            )
        })?;

        let claims = TokenClaims {
            iss: &sa.client_email,
            scope: TOKEN_SCOPE,
            aud: &sa.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + 3600,
        };
        let encoding_key =
            jsonwebtoken::EncodingKey::from_rsa_pem(sa.private_key.as_bytes()).map_err(|e| {
                UpstreamError::new(
                    ErrorKind::Auth,
                    format!("service-account private key rejected: {}", e),
                )
            })?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &encoding_key,
        )
        .map_err(|e| {
            UpstreamError::new(ErrorKind::Auth, format!("failed to sign token claim: {}", e))
        })?;

        let response = http
            .post(&sa.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                UpstreamError::new(
                    crate::error::classify_transport_error(&e),
                    format!("token endpoint unreachable: {}", e),
                )
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(UpstreamError::new(
                ErrorKind::Auth,
                format!("token endpoint returned {}", status.as_u16()),
            )
            .with_status(status.as_u16()));
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            UpstreamError::new(ErrorKind::Auth, format!("invalid token response: {}", e))
        })?;

        let cached = CachedToken {
            access_token: parsed.access_token.clone(),
            expires_at: now + chrono::Duration::seconds(parsed.expires_in),
        };
        let mut tokens = self.tokens.write().await;
        tokens.insert(provider.id, cached);
        tracing::debug!(provider_id = %provider.id, "Minted service-account bearer token");
        Ok(parsed.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{test_provider, ProviderType};

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[tokio::test]
    async fn anthropic_first_party_uses_x_api_key() {
        let resolver = AuthResolver::new();
        let mut p = test_provider("p", ProviderType::Claude);
        p.url = "https://api.anthropic.com/v1/messages".to_string();
        let got = resolver
            .resolve(&p, TargetProtocol::Anthropic, &client(), Utc::now())
            .await
            .expect("resolve");
        assert!(got.headers.contains_key("x-api-key"));
        assert!(!got.headers.contains_key("authorization"));
        assert_eq!(
            got.headers.get("anthropic-version").unwrap(),
            ANTHROPIC_VERSION
        );
        assert!(got
            .headers
            .get("user-agent")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("claude-cli/"));
    }

    #[tokio::test]
    async fn anthropic_relay_host_uses_bearer() {
        let resolver = AuthResolver::new();
        let mut p = test_provider("p", ProviderType::Claude);
        p.url = "https://my-claude-proxy.example.com/v1/messages".to_string();
        let got = resolver
            .resolve(&p, TargetProtocol::Anthropic, &client(), Utc::now())
            .await
            .expect("resolve");
        assert!(!got.headers.contains_key("x-api-key"));
        let auth = got.headers.get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("Bearer "));
    }

    #[tokio::test]
    async fn anthropic_unknown_host_sends_both() {
        let resolver = AuthResolver::new();
        let mut p = test_provider("p", ProviderType::Claude);
        p.url = "https://llm.internal.example.net/v1/messages".to_string();
        let got = resolver
            .resolve(&p, TargetProtocol::Anthropic, &client(), Utc::now())
            .await
            .expect("resolve");
        assert!(got.headers.contains_key("x-api-key"));
        assert!(got.headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn openai_uses_bearer_only() {
        let resolver = AuthResolver::new();
        let p = test_provider("p", ProviderType::OpenaiCompatible);
        let got = resolver
            .resolve(&p, TargetProtocol::OpenaiChat, &client(), Utc::now())
            .await
            .expect("resolve");
        assert!(got.headers.contains_key("authorization"));
        assert!(!got.headers.contains_key("x-api-key"));
        assert!(got.query_key_fallback.is_none());
    }

    #[tokio::test]
    async fn gemini_plain_key_offers_query_fallback() {
        let resolver = AuthResolver::new();
        let mut p = test_provider("p", ProviderType::Gemini);
        p.api_key = "AIzaSyTest123".to_string();
        let got = resolver
            .resolve(&p, TargetProtocol::Gemini, &client(), Utc::now())
            .await
            .expect("resolve");
        assert!(got.headers.contains_key("x-goog-api-key"));
        assert_eq!(got.query_key_fallback.as_deref(), Some("AIzaSyTest123"));
    }

    #[tokio::test]
    async fn gemini_service_account_blob_detected() {
        assert!(is_service_account_json(
            r#"{"type":"service_account","private_key":"-----BEGIN..."}"#
        ));
        assert!(!is_service_account_json("AIzaSyTest123"));

        // a malformed blob fails with an auth-kind error, not a panic
        let resolver = AuthResolver::new();
        let mut p = test_provider("p", ProviderType::Gemini);
        p.api_key = r#"{"private_key": 42}"#.to_string();
        let err = resolver
            .resolve(&p, TargetProtocol::Gemini, &client(), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
    }
}
