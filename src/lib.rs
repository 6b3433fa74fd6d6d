//! Multi-tier sliding-window rate limiting for axum services.
//!
//! A [`SlidingWindowLimiter`](ratelimit::SlidingWindowLimiter) checks burst,
//! per-minute and per-hour windows per client. Counters live in process or in
//! Redis, with automatic per-call fallback to the in-process store when Redis
//! is unreachable. [`EndpointPolicyRegistry`](ratelimit::EndpointPolicyRegistry)
//! keeps one limiter per endpoint scope and
//! [`admission_guard`](middleware::admission_guard) mounts a limiter in front
//! of a router.

pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod middleware;
pub mod ratelimit;

pub use config::{BackendConfig, FailurePolicy, LimiterSettings, RateLimitConfig};
pub use error::{LimiterError, LimiterResult};
pub use identity::ClientIdentity;
pub use ratelimit::{
    AdmissionDecision,
    AdmitOutcome,
    CounterBackend,
    EndpointPolicyRegistry,
    QuotaSnapshot,
    SlidingWindowLimiter,
    WindowKind,
    WindowLimit,
    WindowUsage,
};
