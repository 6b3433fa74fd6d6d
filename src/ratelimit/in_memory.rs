use std::{
    collections::{VecDeque, hash_map::RandomState},
    hash::BuildHasher,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    task::JoinHandle,
    time::Instant,
};

use crate::{
    error::LimiterResult,
    ratelimit::{AdmitOutcome, CounterBackend, WindowLimit, WindowUsage},
};

const ADMISSION_STRIPES: usize = 64;

/// Single-process window store. State is lost on restart and never shared
/// between instances. Every operation completes without awaiting.
///
/// Admissions lock the stripes of every key they touch, in stripe order, for
/// the whole check-then-record step.
pub struct InMemoryBackend {
    windows: DashMap<String, WindowEntry>,
    stripes: Box<[Mutex<()>]>,
    hasher: RandomState,
}

struct WindowEntry {
    window: Duration,
    events: VecDeque<Instant>,
}

impl WindowEntry {
    fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) >= self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            windows: DashMap::new(),
            stripes: (0..ADMISSION_STRIPES).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently holding at least one tracked window.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn record_now(&self, key: &str, window: Duration) -> u64 {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry::new(window));
        entry.window = window;
        entry.prune(now);
        entry.events.push_back(now);
        entry.events.len() as u64
    }

    fn count_now(&self, key: &str, window: Duration) -> u64 {
        self.usage_now(key, window).count
    }

    fn usage_now(&self, key: &str, window: Duration) -> WindowUsage {
        let now = Instant::now();
        let usage = {
            let Some(mut entry) = self.windows.get_mut(key) else {
                return WindowUsage::default();
            };
            entry.window = window;
            entry.prune(now);
            WindowUsage {
                count: entry.events.len() as u64,
                oldest_age: entry.events.front().map(|t| now.duration_since(*t)),
            }
        };

        if usage.count == 0 {
            self.windows.remove_if(key, |_, entry| entry.events.is_empty());
        }
        usage
    }

    fn lock_stripes(&self, limits: &[WindowLimit]) -> Vec<MutexGuard<'_, ()>> {
        let mut indices = limits
            .iter()
            .map(|limit| self.hasher.hash_one(&limit.key) as usize % self.stripes.len())
            .collect::<Vec<_>>();
        indices.sort_unstable();
        indices.dedup();

        // the guarded value is (), so a poisoned stripe is still usable
        indices
            .into_iter()
            .map(|i| self.stripes[i].lock().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }

    fn admit_now(&self, limits: &[WindowLimit]) -> AdmitOutcome {
        let _guards = self.lock_stripes(limits);

        for (index, limit) in limits.iter().enumerate() {
            let usage = self.usage_now(&limit.key, limit.window);
            if usage.count >= limit.limit {
                return AdmitOutcome::Exceeded { index, usage };
            }
        }

        for limit in limits {
            self.record_now(&limit.key, limit.window);
        }
        AdmitOutcome::Admitted
    }

    /// Drops expired events everywhere and removes keys left empty. Returns the
    /// number of keys removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, entry| {
            entry.prune(now);
            !entry.events.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until the backend is
    /// dropped. Outside a tokio runtime nothing is spawned.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let backend = Arc::downgrade(self);

        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(backend) = backend.upgrade() else {
                    break;
                };
                let removed = backend.sweep();
                tracing::debug!(removed, tracked = backend.len(), "swept idle rate limit windows");
            }
        }))
    }
}

#[async_trait]
impl CounterBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn record(&self, key: &str, window: Duration) -> LimiterResult<u64> {
        Ok(self.record_now(key, window))
    }

    async fn get_count(&self, key: &str, window: Duration) -> LimiterResult<u64> {
        Ok(self.count_now(key, window))
    }

    async fn usage(&self, key: &str, window: Duration) -> LimiterResult<WindowUsage> {
        Ok(self.usage_now(key, window))
    }

    async fn try_admit(&self, limits: &[WindowLimit]) -> LimiterResult<AdmitOutcome> {
        Ok(self.admit_now(limits))
    }
}
