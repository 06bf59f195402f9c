//! # llm-relay
//!
//! Multi-tenant reverse proxy for LLM provider APIs. Client requests
//! addressed to the Anthropic, OpenAI Chat, OpenAI Responses, or Gemini
//! protocols are authenticated, rate-limited, routed to one of many
//! configured upstream providers, dispatched, streamed back, and recorded
//! for billing. The proxy is protocol-preserving: bodies pass through
//! unchanged apart from model redirection.
//!
//! ## Request flow
//!
//! ```text
//! authenticate -> limiter guard -> selector -> auth headers
//!     -> dispatch (egress proxy, fallback) -> stream passthrough
//!     -> (on failure) retry across alternates -> usage recorder
//! ```
//!
//! ## Modules
//! - `api`: HTTP surface (ingress protocols, client auth, admin contracts)
//! - `pipeline`: the per-request coordinator and retry driver
//! - `selector`: provider filtering, affinity, and the weighted pick
//! - `breaker`: per-provider CLOSED/OPEN/HALF_OPEN circuit breaker
//! - `limiter` / `counters`: multi-window USD and RPM accounting
//! - `dispatch` / `stream`: upstream HTTP execution and SSE passthrough
//! - `usage` / `pricing`: cost attribution and the usage log

pub mod api;
pub mod breaker;
pub mod bus;
pub mod chain;
pub mod config;
pub mod counters;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod pipeline;
pub mod pricing;
pub mod providers;
pub mod redact;
pub mod registry;
pub mod selector;
pub mod sessions;
pub mod store;
pub mod stream;
pub mod tenants;
pub mod upstream_auth;
pub mod usage;

pub use config::Config;
