//! Configuration types

use crate::error::{ConfigError, SieveError, SieveResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How a read consults the cache and the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FetchPolicy {
    /// Answer from the cache, fetch only what is missing.
    #[default]
    CacheFirst,
    /// Never touch the network.
    CacheOnly,
    /// Always fetch everything, then write to the cache.
    NetworkOnly,
    /// Always fetch everything, never write to the cache.
    NoCache,
}

impl FetchPolicy {
    /// Policies that require the complete document, bypassing reduction.
    pub fn bypasses_reduction(&self) -> bool {
        !matches!(self, FetchPolicy::CacheFirst)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchPolicy::CacheFirst => "cache-first",
            FetchPolicy::CacheOnly => "cache-only",
            FetchPolicy::NetworkOnly => "network-only",
            FetchPolicy::NoCache => "no-cache",
        }
    }
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FetchPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "cache-first" => Ok(FetchPolicy::CacheFirst),
            "cache-only" => Ok(FetchPolicy::CacheOnly),
            "network-only" => Ok(FetchPolicy::NetworkOnly),
            "no-cache" => Ok(FetchPolicy::NoCache),
            _ => Err(ConfigError::InvalidValue {
                field: "fetch_policy".to_string(),
                value: s.to_string(),
                reason: "expected cache-first, cache-only, network-only or no-cache".to_string(),
            }),
        }
    }
}

/// Request context forwarded to the transport (headers, auth hints, ...).
pub type RequestContext = BTreeMap<String, String>;

/// Per-read options.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadOptions {
    pub fetch_policy: FetchPolicy,
    /// `Some(false)` disables reduction for this read; `None` follows the client config.
    pub reduce: Option<bool>,
    /// Live (polling) reads always request the full document.
    pub poll_interval: Option<Duration>,
    pub context: RequestContext,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.fetch_policy = policy;
        self
    }

    pub fn with_reduce(mut self, enabled: bool) -> Self {
        self.reduce = Some(enabled);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Whether reduction applies, given the client-wide default.
    pub fn reduction_enabled(&self, default: bool) -> bool {
        self.reduce.unwrap_or(default)
            && !self.fetch_policy.bypasses_reduction()
            && self.poll_interval.is_none()
    }
}

/// Client-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SieveConfig {
    pub default_fetch_policy: FetchPolicy,
    /// Reduce reads to the fields missing from the cache.
    pub reduce_queries: bool,
    /// Context merged under every request's own context.
    pub global_context: RequestContext,
}

impl Default for SieveConfig {
    fn default() -> Self {
        Self {
            default_fetch_policy: FetchPolicy::CacheFirst,
            reduce_queries: true,
            global_context: RequestContext::new(),
        }
    }
}

impl SieveConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `SIEVE_DEFAULT_FETCH_POLICY`: default fetch policy (default: cache-first)
    /// - `SIEVE_REDUCE_QUERIES`: `true`/`1` to reduce reads (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            default_fetch_policy: std::env::var("SIEVE_DEFAULT_FETCH_POLICY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_fetch_policy),
            reduce_queries: std::env::var("SIEVE_REDUCE_QUERIES")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.reduce_queries),
            global_context: defaults.global_context,
        }
    }

    pub fn with_global_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.global_context.insert(key.into(), value.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SieveResult<()> {
        if let Some(key) = self.global_context.keys().find(|key| key.trim().is_empty()) {
            return Err(SieveError::Config(ConfigError::InvalidValue {
                field: "global_context".to_string(),
                value: format!("{key:?}"),
                reason: "context keys must not be blank".to_string(),
            }));
        }
        Ok(())
    }

    /// Read options carrying this configuration's default fetch policy.
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions::new().with_fetch_policy(self.default_fetch_policy)
    }

    /// Global context overlaid with a request's own context.
    pub fn merged_context(&self, request: &RequestContext) -> RequestContext {
        let mut merged = self.global_context.clone();
        merged.extend(request.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}
