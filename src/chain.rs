//! The provider chain: the ordered decision record attached to a request.
//!
//! Every selection, retry, and terminal outcome appends one item, in
//! happens-before order within the request. The chain is serialized onto the
//! usage log row.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a chain item was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainReason {
    InitialSelection,
    SessionReuse,
    RetryFailed,
    RetrySuccess,
    RequestSuccess,
    SystemError,
    ConcurrentLimitFailed,
    ClientErrorNonRetryable,
}

impl ChainReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitialSelection => "initial_selection",
            Self::SessionReuse => "session_reuse",
            Self::RetryFailed => "retry_failed",
            Self::RetrySuccess => "retry_success",
            Self::RequestSuccess => "request_success",
            Self::SystemError => "system_error",
            Self::ConcurrentLimitFailed => "concurrent_limit_failed",
            Self::ClientErrorNonRetryable => "client_error_non_retryable",
        }
    }
}

/// A candidate considered by the weighted pick, with its selection
/// probability in `[0, 1]`. Formatting to percent is the UI's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSnapshot {
    pub provider_id: Uuid,
    pub provider_name: String,
    pub weight: u32,
    pub probability: f64,
}

/// Funnel sizes after each selection filter, for the decision record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SelectionFunnel {
    pub total: usize,
    pub after_protocol: usize,
    pub after_enabled: usize,
    pub after_group: usize,
    pub after_allow_list: usize,
    pub after_exclusions: usize,
    pub after_health: usize,
    pub after_limits: usize,
}

/// Context captured when the selector made its decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    /// Candidates at the chosen priority with their probabilities
    pub candidates: Vec<CandidateSnapshot>,
    pub funnel: SelectionFunnel,
    /// Priority bucket that was drawn from
    pub priority: u32,
}

/// One step of the selection/attempt record for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainItem {
    pub provider_id: Uuid,
    pub provider_name: String,
    pub reason: ChainReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub cost_multiplier: f64,
    pub priority: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_context: Option<DecisionContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
}

/// Why the dispatcher fell back from the egress proxy to a direct attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackReason {
    Cloudflare,
    ProxyError,
}
