use std::{
    sync::Arc,
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    config::{BackendConfig, FailurePolicy, LimiterSettings, RateLimitConfig},
    error::LimiterResult,
    ratelimit::{SlidingWindowLimiter, build_backend},
};

/// One limiter per logical scope, built on first request for that scope and
/// kept for the life of the process. Construct once at startup and share.
pub struct EndpointPolicyRegistry {
    backend: BackendConfig,
    failure_policy: FailurePolicy,
    sweep_interval: Option<Duration>,
    limiters: DashMap<String, Arc<SlidingWindowLimiter>>,
}

impl EndpointPolicyRegistry {
    pub fn new(
        backend: BackendConfig,
        failure_policy: FailurePolicy,
        sweep_interval: Option<Duration>,
    ) -> Self {
        Self {
            backend,
            failure_policy,
            sweep_interval,
            limiters: DashMap::new(),
        }
    }

    pub fn from_settings(settings: &LimiterSettings) -> Self {
        Self::new(
            settings.backend.clone(),
            settings.failure_policy,
            settings.sweep_interval,
        )
    }

    /// Returns the limiter for `scope`, creating it with `config` on first use.
    /// Later calls ignore `config` and hand back the existing instance.
    pub fn limiter(
        &self,
        scope: &str,
        config: RateLimitConfig,
    ) -> LimiterResult<Arc<SlidingWindowLimiter>> {
        match self.limiters.entry(scope.to_string()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let backend = build_backend(&self.backend, scope, self.sweep_interval)?;
                tracing::info!(
                    scope,
                    backend = backend.name(),
                    requests_per_minute = config.requests_per_minute,
                    requests_per_hour = config.requests_per_hour,
                    burst_limit = config.burst_limit,
                    burst_window_seconds = config.burst_window_seconds,
                    "registered rate limit scope"
                );
                let limiter = Arc::new(SlidingWindowLimiter::new(
                    config,
                    backend,
                    self.failure_policy,
                )?);
                slot.insert(limiter.clone());
                Ok(limiter)
            }
        }
    }

    pub fn get(&self, scope: &str) -> Option<Arc<SlidingWindowLimiter>> {
        self.limiters.get(scope).map(|l| l.clone())
    }

    pub fn scopes(&self) -> Vec<String> {
        let mut scopes = self
            .limiters
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        scopes.sort();
        scopes
    }

    /// Total calls answered by in-process fallbacks across all scopes.
    pub fn degraded_calls(&self) -> u64 {
        self.limiters
            .iter()
            .map(|entry| entry.value().backend().degraded_calls())
            .sum()
    }
}
