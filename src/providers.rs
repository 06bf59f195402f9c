//! Provider records: the upstream endpoints the proxy can dispatch to.
//!
//! A provider carries identity, credential, routing knobs, spend limits,
//! breaker configuration, egress policy, and timeout overrides. Records are
//! created and edited through the admin surface and cached by the registry.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The group tag every provider implicitly belongs to.
pub const DEFAULT_GROUP: &str = "default";

/// Wildcard access-scope entry that disables group filtering.
pub const GROUP_WILDCARD: &str = "all";

/// Kind of upstream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    Claude,
    ClaudeAuth,
    Codex,
    OpenaiCompatible,
    Gemini,
    GeminiCli,
}

impl ProviderType {
    pub fn id(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::ClaudeAuth => "claude-auth",
            Self::Codex => "codex",
            Self::OpenaiCompatible => "openai-compatible",
            Self::Gemini => "gemini",
            Self::GeminiCli => "gemini-cli",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "claude" => Some(Self::Claude),
            "claude-auth" => Some(Self::ClaudeAuth),
            "codex" => Some(Self::Codex),
            "openai-compatible" => Some(Self::OpenaiCompatible),
            "gemini" => Some(Self::Gemini),
            "gemini-cli" => Some(Self::GeminiCli),
            _ => None,
        }
    }
}

/// Ingress protocol family a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetProtocol {
    Anthropic,
    OpenaiChat,
    OpenaiResponses,
    Gemini,
}

impl TargetProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenaiChat => "openai-chat",
            Self::OpenaiResponses => "openai-responses",
            Self::Gemini => "gemini",
        }
    }
}

/// How the daily spend window is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyLimitMode {
    /// Calendar day boundary at the configured anchor time
    #[default]
    Fixed,
    /// Strict trailing 24 hours
    Rolling,
}

/// Per-provider prompt-cache tier preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTierPreference {
    #[default]
    Inherit,
    #[serde(rename = "5m")]
    FiveMinute,
    #[serde(rename = "1h")]
    OneHour,
}

/// USD spend and concurrency limits attached to a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderLimits {
    pub limit_5h_usd: Option<f64>,
    pub limit_daily_usd: Option<f64>,
    #[serde(default)]
    pub daily_mode: DailyLimitMode,
    /// "HH:MM" anchor for fixed daily windows; midnight when absent
    pub daily_reset_time: Option<String>,
    pub limit_weekly_usd: Option<f64>,
    pub limit_monthly_usd: Option<f64>,
    pub limit_total_usd: Option<f64>,
    pub limit_concurrent_sessions: Option<u32>,
}

/// Circuit breaker tuning for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the sliding window that trip the breaker
    pub failure_threshold: u32,
    /// Sliding window the failures are counted in
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    /// How long the breaker stays OPEN before admitting a probe
    pub open_duration_secs: u64,
    /// Successes in HALF_OPEN required to close again
    pub half_open_success_threshold: u32,
}

fn default_failure_window_secs() -> u64 {
    60
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: default_failure_window_secs(),
            open_duration_secs: 300,
            half_open_success_threshold: 1,
        }
    }
}

/// Egress proxy policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EgressPolicy {
    /// `http|https|socks4|socks5` URL; None means direct
    pub proxy_url: Option<String>,
    /// Retry once direct when the proxied attempt hits a Cloudflare gateway error
    #[serde(default)]
    pub proxy_fallback_to_direct: bool,
}

/// Per-provider timeout overrides in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutOverrides {
    pub first_byte_streaming_ms: Option<u64>,
    pub streaming_idle_ms: Option<u64>,
    pub request_non_streaming_ms: Option<u64>,
}

/// Throughput hints surfaced to the admin UI; not enforced on the hot path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThroughputHints {
    pub tpm: Option<u64>,
    pub rpm: Option<u64>,
    pub rpd: Option<u64>,
}

/// An upstream provider record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub provider_type: ProviderType,
    /// API key or, for `gemini`, possibly a service-account JSON blob
    pub api_key: String,
    /// Unified client id for claude-auth style credentials
    pub client_id: Option<String>,
    pub enabled: bool,

    // Routing knobs
    /// Lower wins
    pub priority: u32,
    pub weight: u32,
    pub cost_multiplier: f64,
    pub group_tags: HashSet<String>,

    // Policies
    /// Empty means every model is allowed
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub model_redirects: HashMap<String, String>,
    /// Opt this provider into serving Anthropic-protocol traffic
    #[serde(default)]
    pub join_claude_pool: bool,

    #[serde(default)]
    pub limits: ProviderLimits,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub egress: EgressPolicy,
    #[serde(default)]
    pub timeouts: TimeoutOverrides,
    #[serde(default)]
    pub hints: ThroughputHints,

    #[serde(default)]
    pub cache_tier: CacheTierPreference,
    pub max_retry_attempts: Option<u32>,

    pub total_cost_reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Provider {
    /// Whether this provider can serve requests for the given ingress protocol.
    ///
    /// `claude` providers serve both `claude` and `claude-auth` traffic; any
    /// provider that joined the Claude pool additionally becomes eligible for
    /// Anthropic-protocol requests. Pool membership widens only this filter;
    /// group filtering still applies afterwards.
    pub fn serves(&self, target: TargetProtocol) -> bool {
        match target {
            TargetProtocol::Anthropic => {
                matches!(
                    self.provider_type,
                    ProviderType::Claude | ProviderType::ClaudeAuth
                ) || self.join_claude_pool
            }
            TargetProtocol::OpenaiChat => self.provider_type == ProviderType::OpenaiCompatible,
            TargetProtocol::OpenaiResponses => self.provider_type == ProviderType::Codex,
            TargetProtocol::Gemini => matches!(
                self.provider_type,
                ProviderType::Gemini | ProviderType::GeminiCli
            ),
        }
    }

    /// Apply the provider's model redirect map.
    pub fn redirect_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_redirects
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }

    /// Whether `model` passes the allow-list. An empty list allows every
    /// model; model-less requests (list endpoints) always pass.
    pub fn allows_model(&self, model: &str) -> bool {
        model.is_empty()
            || self.allowed_models.is_empty()
            || self.allowed_models.iter().any(|m| m == model)
    }

    /// Whether this provider is reachable from the given access scope.
    ///
    /// A wildcard `all` in the scope disables group filtering entirely.
    pub fn in_scope(&self, scope: &HashSet<String>) -> bool {
        scope.contains(GROUP_WILDCARD) || self.group_tags.iter().any(|g| scope.contains(g))
    }

    /// Validate the record's invariants.
    ///
    /// `limit_5h <= daily <= weekly <= monthly` whenever both sides of a pair
    /// are set.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("provider name must not be empty".to_string());
        }
        if self.url.trim().is_empty() {
            return Err("provider url must not be empty".to_string());
        }
        if self.cost_multiplier < 0.0 {
            return Err("cost_multiplier must be non-negative".to_string());
        }
        let ladder = [
            ("limit_5h_usd", self.limits.limit_5h_usd),
            ("limit_daily_usd", self.limits.limit_daily_usd),
            ("limit_weekly_usd", self.limits.limit_weekly_usd),
            ("limit_monthly_usd", self.limits.limit_monthly_usd),
        ];
        for pair in ladder.windows(2) {
            if let (Some(lower), Some(upper)) = (pair[0].1, pair[1].1) {
                if lower > upper {
                    return Err(format!(
                        "{} ({}) must not exceed {} ({})",
                        pair[0].0, lower, pair[1].0, upper
                    ));
                }
            }
        }
        if let Some(t) = &self.limits.daily_reset_time {
            if parse_reset_time(t).is_none() {
                return Err(format!("daily_reset_time '{}' is not HH:MM", t));
            }
        }
        Ok(())
    }
}

/// Parse an "HH:MM" anchor into minutes from midnight.
pub fn parse_reset_time(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h < 24 && m < 60 {
        Some(h * 60 + m)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) fn test_provider(name: &str, provider_type: ProviderType) -> Provider {
    let now = Utc::now();
    Provider {
        id: Uuid::new_v4(),
        name: name.to_string(),
        url: "https://api.example.com".to_string(),
        provider_type,
        api_key: "sk-test".to_string(),
        client_id: None,
        enabled: true,
        priority: 0,
        weight: 1,
        cost_multiplier: 1.0,
        group_tags: std::iter::once(DEFAULT_GROUP.to_string()).collect(),
        allowed_models: Vec::new(),
        model_redirects: HashMap::new(),
        join_claude_pool: false,
        limits: ProviderLimits::default(),
        breaker: BreakerConfig::default(),
        egress: EgressPolicy::default(),
        timeouts: TimeoutOverrides::default(),
        hints: ThroughputHints::default(),
        cache_tier: CacheTierPreference::Inherit,
        max_retry_attempts: None,
        total_cost_reset_at: now,
        created_at: now,
        updated_at: now,
    }
}
