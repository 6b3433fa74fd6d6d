use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    error::{LimiterError, LimiterResult},
    ratelimit::{AdmitOutcome, CounterBackend, WindowLimit, WindowUsage, in_memory::InMemoryBackend},
};

/// Tries the shared backend first and answers from the in-process store when
/// it errors. The choice is made per call; nothing sticks after an outage.
pub struct FallbackBackend {
    primary: Arc<dyn CounterBackend>,
    fallback: Arc<InMemoryBackend>,
    degraded: AtomicU64,
}

impl FallbackBackend {
    pub fn new(primary: Arc<dyn CounterBackend>, fallback: Arc<InMemoryBackend>) -> Self {
        Self {
            primary,
            fallback,
            degraded: AtomicU64::new(0),
        }
    }

    fn degrade(&self, operation: &'static str, key: &str, err: &LimiterError) {
        let total = self.degraded.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            backend = self.primary.name(),
            operation,
            key,
            error = %err,
            degraded_calls = total,
            "shared rate limit backend failed; using in-process counters"
        );
    }
}

#[async_trait]
impl CounterBackend for FallbackBackend {
    fn name(&self) -> &'static str {
        "redis-with-fallback"
    }

    async fn record(&self, key: &str, window: Duration) -> LimiterResult<u64> {
        match self.primary.record(key, window).await {
            Ok(count) => Ok(count),
            Err(err) => {
                self.degrade("record", key, &err);
                self.fallback.record(key, window).await
            }
        }
    }

    async fn get_count(&self, key: &str, window: Duration) -> LimiterResult<u64> {
        match self.primary.get_count(key, window).await {
            Ok(count) => Ok(count),
            Err(err) => {
                self.degrade("get_count", key, &err);
                self.fallback.get_count(key, window).await
            }
        }
    }

    async fn usage(&self, key: &str, window: Duration) -> LimiterResult<WindowUsage> {
        match self.primary.usage(key, window).await {
            Ok(usage) => Ok(usage),
            Err(err) => {
                self.degrade("usage", key, &err);
                self.fallback.usage(key, window).await
            }
        }
    }

    async fn try_admit(&self, limits: &[WindowLimit]) -> LimiterResult<AdmitOutcome> {
        match self.primary.try_admit(limits).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let key = limits.first().map(|l| l.key.as_str()).unwrap_or_default();
                self.degrade("try_admit", key, &err);
                self.fallback.try_admit(limits).await
            }
        }
    }

    fn degraded_calls(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    /// Primary that fails while `down` is set and otherwise delegates to its
    /// own in-process store.
    pub(crate) struct FlakyBackend {
        pub(crate) down: AtomicBool,
        inner: InMemoryBackend,
    }

    impl FlakyBackend {
        pub(crate) fn new(down: bool) -> Self {
            Self {
                down: AtomicBool::new(down),
                inner: InMemoryBackend::new(),
            }
        }

        fn check(&self) -> LimiterResult<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(LimiterError::BackendUnavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CounterBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn record(&self, key: &str, window: Duration) -> LimiterResult<u64> {
            self.check()?;
            self.inner.record(key, window).await
        }

        async fn get_count(&self, key: &str, window: Duration) -> LimiterResult<u64> {
            self.check()?;
            self.inner.get_count(key, window).await
        }

        async fn usage(&self, key: &str, window: Duration) -> LimiterResult<WindowUsage> {
            self.check()?;
            self.inner.usage(key, window).await
        }

        async fn try_admit(&self, limits: &[WindowLimit]) -> LimiterResult<AdmitOutcome> {
            self.check()?;
            self.inner.try_admit(limits).await
        }
    }

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn healthy_primary_is_used() {
        let primary = Arc::new(FlakyBackend::new(false));
        let local = Arc::new(InMemoryBackend::new());
        let backend = FallbackBackend::new(primary.clone(), local.clone());

        assert_eq!(backend.record("k", WINDOW).await.unwrap(), 1);
        assert_eq!(primary.inner.get_count("k", WINDOW).await.unwrap(), 1);
        assert!(local.is_empty());
        assert_eq!(backend.degraded_calls(), 0);
    }

    #[tokio::test]
    async fn failing_primary_degrades_per_call() {
        let primary = Arc::new(FlakyBackend::new(true));
        let local = Arc::new(InMemoryBackend::new());
        let backend = FallbackBackend::new(primary.clone(), local.clone());

        assert_eq!(backend.record("k", WINDOW).await.unwrap(), 1);
        assert_eq!(backend.get_count("k", WINDOW).await.unwrap(), 1);
        assert_eq!(backend.degraded_calls(), 2);

        primary.down.store(false, Ordering::SeqCst);

        // recovered primary has no history of the outage
        assert_eq!(backend.get_count("k", WINDOW).await.unwrap(), 0);
        assert_eq!(backend.record("k", WINDOW).await.unwrap(), 1);
        assert_eq!(backend.degraded_calls(), 2);
        assert_eq!(local.get_count("k", WINDOW).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn admission_falls_back_as_a_unit() {
        let local = Arc::new(InMemoryBackend::new());
        let backend = FallbackBackend::new(Arc::new(FlakyBackend::new(true)), local.clone());
        let limits = vec![
            WindowLimit {
                key: "k:burst".to_string(),
                window: Duration::from_secs(10),
                limit: 1,
            },
            WindowLimit {
                key: "k:minute".to_string(),
                window: WINDOW,
                limit: 10,
            },
        ];

        assert_eq!(backend.try_admit(&limits).await.unwrap(), AdmitOutcome::Admitted);
        assert!(matches!(
            backend.try_admit(&limits).await.unwrap(),
            AdmitOutcome::Exceeded { index: 0, .. }
        ));
        assert_eq!(local.get_count("k:minute", WINDOW).await.unwrap(), 1);
        assert_eq!(backend.degraded_calls(), 2);
    }
}
