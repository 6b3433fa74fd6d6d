use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    env,
    net::SocketAddr,
    str::FromStr,
    time::Duration,
};

use crate::error::{LimiterError, LimiterResult};

pub const DEFAULT_SCOPE: &str = "default";
pub const PRICING_SCOPE: &str = "pricing";
pub const UPLOAD_SCOPE: &str = "upload";
pub const CONFIG_SCOPE: &str = "config";

const REDIS_TIMEOUT_MS_RANGE: std::ops::RangeInclusive<u64> = 100..=3_000;

const DEFAULT_EXEMPT_PREFIXES: &str = "/health,/docs,/redoc,/openapi.json,/static,/favicon.ico";

/// Thresholds for one logical scope. Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    pub burst_limit: u64,
    pub burst_window_seconds: u64,
    pub whitelist: HashSet<String>,
    pub blacklist: HashSet<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 20,
            requests_per_hour: 200,
            burst_limit: 5,
            burst_window_seconds: 10,
            whitelist: ["127.0.0.1", "::1"].into_iter().map(String::from).collect(),
            blacklist: HashSet::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn pricing() -> Self {
        Self::default()
    }

    pub fn upload() -> Self {
        Self {
            requests_per_minute: 5,
            requests_per_hour: 50,
            burst_limit: 2,
            burst_window_seconds: 30,
            ..Self::default()
        }
    }

    pub fn config_read() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 500,
            burst_limit: 10,
            burst_window_seconds: 10,
            ..Self::default()
        }
    }

    pub fn with_whitelist<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = identities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blacklist<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist = identities.into_iter().map(Into::into).collect();
        self
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_secs(self.burst_window_seconds)
    }

    pub fn validate(&self) -> LimiterResult<()> {
        let checks = [
            ("requests_per_minute", self.requests_per_minute),
            ("requests_per_hour", self.requests_per_hour),
            ("burst_limit", self.burst_limit),
            ("burst_window_seconds", self.burst_window_seconds),
        ];

        for (field, value) in checks {
            if value == 0 {
                return Err(LimiterError::InvalidConfig(format!("{field} must be > 0")));
            }
        }

        Ok(())
    }
}

/// What happens when neither the primary nor the fallback backend can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    InMemory,
    Redis {
        url: String,
        key_prefix: String,
        timeout: Duration,
    },
}

impl BackendConfig {
    /// A configured store address selects the shared backend.
    pub fn from_redis_url(url: Option<String>, key_prefix: String, timeout: Duration) -> Self {
        match url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()) {
            Some(url) => Self::Redis {
                url,
                key_prefix,
                timeout,
            },
            None => Self::InMemory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!("unsupported log format: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimiterSettings {
    pub bind_addr: SocketAddr,
    pub backend: BackendConfig,
    pub failure_policy: FailurePolicy,
    pub exempt_prefixes: Vec<String>,
    pub sweep_interval: Option<Duration>,
    pub default_policy: RateLimitConfig,
    pub scopes: HashMap<String, RateLimitConfig>,
    pub log_format: LogFormat,
}

impl LimiterSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = lookup("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let timeout_ms = parse_value(&lookup, "REDIS_TIMEOUT_MS", 2_000u64)?;
        if !REDIS_TIMEOUT_MS_RANGE.contains(&timeout_ms) {
            return Err(anyhow!(
                "REDIS_TIMEOUT_MS must be between {} and {}, got {timeout_ms}",
                REDIS_TIMEOUT_MS_RANGE.start(),
                REDIS_TIMEOUT_MS_RANGE.end()
            ));
        }

        let backend = BackendConfig::from_redis_url(
            lookup("REDIS_URL"),
            lookup("REDIS_KEY_PREFIX").unwrap_or_else(|| "ratelimit".to_string()),
            Duration::from_millis(timeout_ms),
        );

        let failure_policy = if parse_value(&lookup, "RATE_LIMIT_FAIL_OPEN", true)? {
            FailurePolicy::Open
        } else {
            FailurePolicy::Closed
        };

        let sweep_seconds = parse_value(&lookup, "RATE_LIMIT_SWEEP_SECONDS", 300u64)?;
        let sweep_interval = (sweep_seconds > 0).then(|| Duration::from_secs(sweep_seconds));

        let default_policy = RateLimitConfig {
            requests_per_minute: parse_value(&lookup, "RATE_LIMIT_REQUESTS_PER_MINUTE", 20u64)?,
            requests_per_hour: parse_value(&lookup, "RATE_LIMIT_REQUESTS_PER_HOUR", 200u64)?,
            ..RateLimitConfig::default()
        };

        let mut scopes = HashMap::from([
            (PRICING_SCOPE.to_string(), RateLimitConfig::pricing()),
            (UPLOAD_SCOPE.to_string(), RateLimitConfig::upload()),
            (CONFIG_SCOPE.to_string(), RateLimitConfig::config_read()),
        ]);
        if let Some(raw) = lookup("RATE_LIMIT_SCOPES").filter(|s| !s.trim().is_empty()) {
            let overrides: HashMap<String, RateLimitConfig> =
                serde_json::from_str(&raw).context("invalid RATE_LIMIT_SCOPES")?;
            scopes.extend(overrides);
        }

        default_policy
            .validate()
            .map_err(|e| anyhow!("default policy: {e}"))?;
        for (scope, policy) in &scopes {
            policy.validate().map_err(|e| anyhow!("scope {scope}: {e}"))?;
        }

        let log_format = lookup("LOG_FORMAT")
            .map(|raw| raw.parse::<LogFormat>().map_err(|e| anyhow!(e)))
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            bind_addr,
            backend,
            failure_policy,
            exempt_prefixes: parse_csv(&lookup, "RATE_LIMIT_EXEMPT_PREFIXES", DEFAULT_EXEMPT_PREFIXES),
            sweep_interval,
            default_policy,
            scopes,
            log_format,
        })
    }

    pub fn policy_for(&self, scope: &str) -> RateLimitConfig {
        self.scopes
            .get(scope)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }
}

fn parse_csv<F>(lookup: &F, key: &str, default: &str) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .unwrap_or_else(|| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// `default` only when `key` is unset or blank; anything else must parse.
fn parse_value<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|raw| !raw.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}")),
        None => Ok(default),
    }
}
