use std::{
    sync::Arc,
    time::Duration,
};

use crate::{
    config::{FailurePolicy, RateLimitConfig},
    error::{LimiterError, LimiterResult},
    identity::ClientIdentity,
    ratelimit::{
        AdmissionDecision,
        AdmitOutcome,
        CounterBackend,
        QuotaSnapshot,
        WindowKind,
        WindowLimit,
        WindowUsage,
    },
};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

pub const BLOCKED_REASON: &str = "blocked";
pub const BURST_REASON: &str = "too many requests, slow down";
pub const UNAVAILABLE_REASON: &str = "rate limiter unavailable";

/// Burst, per-minute and per-hour windows evaluated against one backend.
///
/// A request is recorded in all three windows only when every window has room,
/// as one backend step, so rejected requests never consume quota and
/// concurrent requests never overshoot a threshold.
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    backend: Arc<dyn CounterBackend>,
    failure_policy: FailurePolicy,
}

impl SlidingWindowLimiter {
    pub fn new(
        config: RateLimitConfig,
        backend: Arc<dyn CounterBackend>,
        failure_policy: FailurePolicy,
    ) -> LimiterResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backend,
            failure_policy,
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn CounterBackend> {
        &self.backend
    }

    fn limit(&self, kind: WindowKind) -> u64 {
        match kind {
            WindowKind::Burst => self.config.burst_limit,
            WindowKind::Minute => self.config.requests_per_minute,
            WindowKind::Hour => self.config.requests_per_hour,
        }
    }

    fn window(&self, kind: WindowKind) -> Duration {
        match kind {
            WindowKind::Burst => self.config.burst_window(),
            WindowKind::Minute => MINUTE,
            WindowKind::Hour => HOUR,
        }
    }

    fn key(identity: &ClientIdentity, kind: WindowKind) -> String {
        format!("{}:{}", identity, kind)
    }

    fn rejection_message(&self, kind: WindowKind) -> String {
        match kind {
            WindowKind::Burst => BURST_REASON.to_string(),
            WindowKind::Minute => format!(
                "Rate limit exceeded. Maximum {} requests per minute.",
                self.config.requests_per_minute
            ),
            WindowKind::Hour => format!(
                "Hourly limit exceeded. Maximum {} requests per hour.",
                self.config.requests_per_hour
            ),
        }
    }

    pub async fn check(&self, identity: &ClientIdentity) -> AdmissionDecision {
        if self.config.whitelist.contains(identity.as_str()) {
            return AdmissionDecision::allow();
        }

        if self.config.blacklist.contains(identity.as_str()) {
            return AdmissionDecision::deny(BLOCKED_REASON, None);
        }

        match self.evaluate(identity).await {
            Ok(decision) => decision,
            Err(err) => self.on_backend_failure(identity, err),
        }
    }

    async fn evaluate(&self, identity: &ClientIdentity) -> LimiterResult<AdmissionDecision> {
        let limits = WindowKind::ALL.map(|kind| WindowLimit {
            key: Self::key(identity, kind),
            window: self.window(kind),
            limit: self.limit(kind),
        });

        let (index, usage) = match self.backend.try_admit(&limits).await? {
            AdmitOutcome::Admitted => return Ok(AdmissionDecision::allow()),
            AdmitOutcome::Exceeded { index, usage } => (index, usage),
        };

        let kind = WindowKind::ALL.get(index).copied().ok_or_else(|| {
            LimiterError::Internal(format!("backend reported unknown window {index}"))
        })?;
        let retry_after = self.retry_after(kind, usage);
        tracing::info!(
            identity = %identity,
            window = %kind,
            count = usage.count,
            limit = self.limit(kind),
            retry_after,
            "rate limit exceeded"
        );

        Ok(AdmissionDecision {
            window: Some(kind),
            ..AdmissionDecision::deny(self.rejection_message(kind), Some(retry_after))
        })
    }

    /// Seconds until the oldest event leaves the window, or the whole window
    /// when that can't be determined.
    fn retry_after(&self, kind: WindowKind, usage: WindowUsage) -> u64 {
        let window = self.window(kind);
        usage
            .oldest_age
            .map(|age| seconds_until_expiry(window, age))
            .unwrap_or(window.as_secs())
    }

    fn on_backend_failure(&self, identity: &ClientIdentity, err: LimiterError) -> AdmissionDecision {
        tracing::error!(
            identity = %identity,
            backend = self.backend.name(),
            policy = ?self.failure_policy,
            error = %err,
            "rate limit backend failed with no usable fallback"
        );

        match self.failure_policy {
            FailurePolicy::Open => AdmissionDecision::allow(),
            FailurePolicy::Closed => {
                AdmissionDecision::deny(UNAVAILABLE_REASON, Some(self.config.burst_window_seconds))
            }
        }
    }

    pub async fn get_remaining_requests(
        &self,
        identity: &ClientIdentity,
    ) -> LimiterResult<QuotaSnapshot> {
        let minute_key = Self::key(identity, WindowKind::Minute);
        let hour_key = Self::key(identity, WindowKind::Hour);

        let minute = self.backend.usage(&minute_key, MINUTE).await?;
        let hour = self.backend.usage(&hour_key, HOUR).await?;

        Ok(QuotaSnapshot {
            limit_per_minute: self.config.requests_per_minute,
            remaining_per_minute: self.config.requests_per_minute.saturating_sub(minute.count),
            remaining_per_hour: self.config.requests_per_hour.saturating_sub(hour.count),
            reset_minute_secs: self.retry_after(WindowKind::Minute, minute),
            reset_hour_secs: self.retry_after(WindowKind::Hour, hour),
        })
    }
}

fn seconds_until_expiry(window: Duration, age: Duration) -> u64 {
    (window.saturating_sub(age).as_secs_f64().ceil() as u64).max(1)
}
