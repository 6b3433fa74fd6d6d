pub mod fallback;
pub mod in_memory;
pub mod limiter;
pub mod redis_backend;
pub mod registry;

use std::{
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    config::BackendConfig,
    error::LimiterResult,
    ratelimit::{
        fallback::FallbackBackend,
        in_memory::InMemoryBackend,
        redis_backend::RedisBackend,
    },
};

pub use limiter::SlidingWindowLimiter;
pub use registry::EndpointPolicyRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    Burst,
    Minute,
    Hour,
}

impl WindowKind {
    /// Evaluation order: tightest window first.
    pub const ALL: [WindowKind; 3] = [WindowKind::Burst, WindowKind::Minute, WindowKind::Hour];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Burst => "burst",
            Self::Minute => "minute",
            Self::Hour => "hour",
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub retry_after_secs: Option<u64>,
    pub window: Option<WindowKind>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            ..Self::default()
        }
    }

    pub fn deny(reason: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            retry_after_secs,
            window: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub limit_per_minute: u64,
    pub remaining_per_minute: u64,
    pub remaining_per_hour: u64,
    pub reset_minute_secs: u64,
    pub reset_hour_secs: u64,
}

/// One window an admission must fit in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowLimit {
    pub key: String,
    pub window: Duration,
    pub limit: u64,
}

/// Events currently inside one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowUsage {
    pub count: u64,
    /// Age of the oldest event still inside the window.
    pub oldest_age: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Every window had room and the event was recorded in all of them.
    Admitted,
    /// `limits[index]` was full. Nothing was recorded.
    Exceeded { index: usize, usage: WindowUsage },
}

/// Owner of all window counters. Callers only ever go through these methods.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Records one event now and returns the in-window count including it.
    async fn record(&self, key: &str, window: Duration) -> LimiterResult<u64>;

    async fn get_count(&self, key: &str, window: Duration) -> LimiterResult<u64>;

    /// Count and oldest event age of one window, read in a single step.
    async fn usage(&self, key: &str, window: Duration) -> LimiterResult<WindowUsage>;

    /// Checks `limits` in order and, only if every window has room, records
    /// one event in all of them. Concurrent calls touching the same keys never
    /// interleave between the check and the record.
    async fn try_admit(&self, limits: &[WindowLimit]) -> LimiterResult<AdmitOutcome>;

    fn degraded_calls(&self) -> u64 {
        0
    }
}

/// Builds the backend for one scope. The in-process store is always created,
/// either as the backend itself or as the fallback behind Redis.
pub fn build_backend(
    config: &BackendConfig,
    scope: &str,
    sweep_interval: Option<Duration>,
) -> LimiterResult<Arc<dyn CounterBackend>> {
    let local = Arc::new(InMemoryBackend::new());
    if let Some(interval) = sweep_interval {
        local.spawn_sweeper(interval);
    }

    match config {
        BackendConfig::InMemory => Ok(local),
        BackendConfig::Redis {
            url,
            key_prefix,
            timeout,
        } => {
            let shared = RedisBackend::new(url, format!("{key_prefix}:{scope}"), *timeout)?;
            Ok(Arc::new(FallbackBackend::new(Arc::new(shared), local)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_picks_backend_from_config() {
        let local = build_backend(&BackendConfig::InMemory, "pricing", None).unwrap();
        assert_eq!(local.name(), "in-memory");

        let shared = build_backend(
            &BackendConfig::Redis {
                url: "redis://127.0.0.1:6379".to_string(),
                key_prefix: "ratelimit".to_string(),
                timeout: Duration::from_secs(1),
            },
            "pricing",
            None,
        )
        .unwrap();
        assert_eq!(shared.name(), "redis-with-fallback");
    }

    #[test]
    fn malformed_redis_url_fails_at_construction() {
        let result = build_backend(
            &BackendConfig::Redis {
                url: "not a url".to_string(),
                key_prefix: "ratelimit".to_string(),
                timeout: Duration::from_secs(1),
            },
            "pricing",
            None,
        );
        assert!(result.is_err());
    }
}
