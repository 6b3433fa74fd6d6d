use async_trait::async_trait;
use redis::{
    FromRedisValue,
    Pipeline,
    RedisResult,
    Script,
    aio::MultiplexedConnection,
};
use std::{
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    error::{LimiterError, LimiterResult},
    ratelimit::{AdmitOutcome, CounterBackend, WindowLimit, WindowUsage},
};

/// How long calls skip Redis after a failed connect or call.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

// KEYS: one sorted set per window. ARGV: now_ms, member, then window_ms and
// limit for each key. Returns {index, count, oldest_ms}; index 0 means the
// member was added everywhere, otherwise it is the 1-based full window.
const ADMIT_LUA: &str = r#"
local now_ms = tonumber(ARGV[1])
local member = ARGV[2]

for i, key in ipairs(KEYS) do
  local window_ms = tonumber(ARGV[1 + i * 2])
  local max_requests = tonumber(ARGV[2 + i * 2])
  redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
  local count = redis.call('ZCARD', key)
  if count >= max_requests then
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    local oldest_ms = -1
    if oldest[2] then
      oldest_ms = tonumber(oldest[2])
    end
    return {i, count, oldest_ms}
  end
end

for i, key in ipairs(KEYS) do
  local window_ms = tonumber(ARGV[1 + i * 2])
  redis.call('ZADD', key, now_ms, member)
  redis.call('EXPIRE', key, math.floor(window_ms / 1000) + 1)
end

return {0, 0, -1}
"#;

#[derive(Default)]
struct ConnectionState {
    connection: Option<MultiplexedConnection>,
    backoff_until: Option<Instant>,
}

/// Sliding windows kept in Redis sorted sets scored by epoch milliseconds.
///
/// Admissions run as one Lua script, other calls as one `MULTI/EXEC`
/// transaction, so concurrent callers on any instance never see a partial
/// step. Each call, connect included, is bounded by `timeout`. After a
/// failure the connection is dropped and calls fail immediately for
/// [`RECONNECT_BACKOFF`].
pub struct RedisBackend {
    client: redis::Client,
    state: Mutex<ConnectionState>,
    admit_script: Script,
    key_prefix: String,
    timeout: Duration,
}

impl RedisBackend {
    pub fn new(url: &str, key_prefix: String, timeout: Duration) -> LimiterResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| LimiterError::InvalidConfig(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            state: Mutex::new(ConnectionState::default()),
            admit_script: Script::new(ADMIT_LUA),
            key_prefix,
            timeout,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    fn now_ms() -> LimiterResult<i64> {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| LimiterError::Internal(e.to_string()))?;
        Ok(duration.as_millis() as i64)
    }

    fn ttl_secs(window: Duration) -> i64 {
        window.as_secs() as i64 + 1
    }

    fn age_of(now_ms: i64, score_ms: f64) -> Duration {
        Duration::from_millis((now_ms as f64 - score_ms).max(0.0) as u64)
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The open connection, if any. Errors while backing off.
    fn cached_connection(&self) -> LimiterResult<Option<MultiplexedConnection>> {
        let state = self.lock_state();
        if let Some(until) = state.backoff_until
            && Instant::now() < until
        {
            return Err(LimiterError::BackendUnavailable(format!(
                "redis marked down, retrying in {}ms",
                until.saturating_duration_since(Instant::now()).as_millis()
            )));
        }
        Ok(state.connection.clone())
    }

    async fn connect(&self) -> LimiterResult<MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;

        let mut state = self.lock_state();
        state.connection = Some(conn.clone());
        state.backoff_until = None;
        drop(state);

        tracing::info!(prefix = %self.key_prefix, "connected rate limit backend to redis");
        Ok(conn)
    }

    fn mark_down(&self) {
        let mut state = self.lock_state();
        state.connection = None;
        state.backoff_until = Some(Instant::now() + RECONNECT_BACKOFF);
    }

    /// Runs `op` on a connection, opening one if needed. Connect and call
    /// share one deadline.
    async fn call<T, F, Fut>(&self, op: F) -> LimiterResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let cached = self.cached_connection()?;

        let attempt = async {
            let conn = match cached {
                Some(conn) => conn,
                None => self.connect().await?,
            };
            let value = op(conn).await?;
            Ok::<T, LimiterError>(value)
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                self.mark_down();
                Err(err)
            }
            Err(_) => {
                self.mark_down();
                Err(LimiterError::BackendUnavailable(format!(
                    "redis call timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    async fn query<T: FromRedisValue>(&self, pipe: &Pipeline) -> LimiterResult<T> {
        self.call(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await
    }

    fn push_record(pipe: &mut Pipeline, key: &str, window: Duration, now_ms: i64) {
        let cutoff = now_ms - window.as_millis() as i64;
        let member = format!("{}-{}", now_ms, Uuid::new_v4());
        pipe.zrembyscore(key, "-inf", cutoff)
            .ignore()
            .zadd(key, member, now_ms)
            .ignore()
            .zcard(key)
            .expire(key, Self::ttl_secs(window))
            .ignore();
    }
}

#[async_trait]
impl CounterBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn record(&self, key: &str, window: Duration) -> LimiterResult<u64> {
        let full_key = self.key(key);
        let mut pipe = redis::pipe();
        pipe.atomic();
        Self::push_record(&mut pipe, &full_key, window, Self::now_ms()?);

        let (count,): (u64,) = self.query(&pipe).await?;
        Ok(count)
    }

    async fn get_count(&self, key: &str, window: Duration) -> LimiterResult<u64> {
        let full_key = self.key(key);
        let cutoff = Self::now_ms()? - window.as_millis() as i64;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrembyscore(&full_key, "-inf", cutoff)
            .ignore()
            .zcard(&full_key)
            .expire(&full_key, Self::ttl_secs(window))
            .ignore();

        let (count,): (u64,) = self.query(&pipe).await?;
        Ok(count)
    }

    async fn usage(&self, key: &str, window: Duration) -> LimiterResult<WindowUsage> {
        let full_key = self.key(key);
        let now_ms = Self::now_ms()?;
        let cutoff = now_ms - window.as_millis() as i64;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrembyscore(&full_key, "-inf", cutoff)
            .ignore()
            .zcard(&full_key)
            .zrange_withscores(&full_key, 0, 0);

        let (count, oldest): (u64, Vec<(String, f64)>) = self.query(&pipe).await?;
        Ok(WindowUsage {
            count,
            oldest_age: oldest.first().map(|(_, score)| Self::age_of(now_ms, *score)),
        })
    }

    async fn try_admit(&self, limits: &[WindowLimit]) -> LimiterResult<AdmitOutcome> {
        let now_ms = Self::now_ms()?;
        let mut invocation = self.admit_script.prepare_invoke();
        invocation.arg(now_ms).arg(format!("{}-{}", now_ms, Uuid::new_v4()));
        for limit in limits {
            invocation
                .key(self.key(&limit.key))
                .arg(limit.window.as_millis() as i64)
                .arg(limit.limit);
        }

        let (index, count, oldest_ms): (i64, i64, i64) = self
            .call(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;

        if index <= 0 {
            return Ok(AdmitOutcome::Admitted);
        }

        Ok(AdmitOutcome::Exceeded {
            index: (index - 1) as usize,
            usage: WindowUsage {
                count: count.max(0) as u64,
                oldest_age: (oldest_ms >= 0).then(|| Self::age_of(now_ms, oldest_ms as f64)),
            },
        })
    }
}
