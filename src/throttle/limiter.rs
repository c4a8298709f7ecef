//! Core rate limiter implementation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::key::{KeyFn, KeyStrategy, RequestInfo, SkipFn};
use super::store::WindowCounterStore;
use crate::error::{GatekeeperError, Result};

/// Named parameterizations of the sliding-window limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// 10 requests per minute, for sensitive endpoints
    Strict,
    /// 60 requests per minute
    Api,
    /// 100 requests per 15 minutes
    Default,
}

impl Preset {
    pub fn max_requests(&self) -> u32 {
        match self {
            Preset::Strict => 10,
            Preset::Api => 60,
            Preset::Default => 100,
        }
    }

    pub fn window_ms(&self) -> u64 {
        match self {
            Preset::Strict | Preset::Api => 60 * 1000,
            Preset::Default => 15 * 60 * 1000,
        }
    }
}

/// Immutable policy for one limiter.
#[derive(Clone)]
pub struct RateLimiterConfig {
    /// Namespace for this limiter's keys in a shared store
    pub name: String,
    /// Requests allowed per window
    pub max_requests: u32,
    /// Sliding window width in milliseconds
    pub window_ms: u64,
    /// Derives the bucket key (client address unless overridden)
    pub key_fn: KeyFn,
    /// Requests for which this returns true bypass the limiter
    pub skip_fn: Option<SkipFn>,
}

impl RateLimiterConfig {
    pub fn new(name: impl Into<String>, max_requests: u32, window_ms: u64) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window_ms,
            key_fn: KeyStrategy::ClientIp.into_key_fn(),
            skip_fn: None,
        }
    }

    pub fn from_preset(name: impl Into<String>, preset: Preset) -> Self {
        Self::new(name, preset.max_requests(), preset.window_ms())
    }

    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_fn = strategy.into_key_fn();
        self
    }

    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&RequestInfo) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }

    pub fn with_skip_fn<F>(mut self, skip_fn: F) -> Self
    where
        F: Fn(&RequestInfo) -> bool + Send + Sync + 'static,
    {
        self.skip_fn = Some(Arc::new(skip_fn));
        self
    }

    /// Attach an already shared skip predicate.
    pub fn with_shared_skip_fn(mut self, skip_fn: SkipFn) -> Self {
        self.skip_fn = Some(skip_fn);
        self
    }

    /// Reject policies that could never admit a request or never expire one.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GatekeeperError::Config(
                "rate limiter name must not be empty".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(GatekeeperError::Config(format!(
                "rate limiter '{}': max_requests must be greater than 0",
                self.name
            )));
        }
        if self.window_ms == 0 {
            return Err(GatekeeperError::Config(format!(
                "rate limiter '{}': window_ms must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RateLimiterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterConfig")
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("window_ms", &self.window_ms)
            .field("skip_fn", &self.skip_fn.is_some())
            .finish()
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Configured maximum for the window
    pub limit: u32,
    /// Requests left in the current window after this one
    pub remaining: u32,
    /// Milliseconds until the oldest counted request leaves the window
    pub reset_ms: u64,
    /// The request bypassed the limiter without touching the store
    pub skipped: bool,
}

impl RateLimitDecision {
    /// Seconds a rejected client should wait, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        (!self.allowed).then(|| self.reset_ms.div_ceil(1000))
    }
}

/// A sliding-window limiter bound to a shared [`WindowCounterStore`].
///
/// Cheap to share behind an `Arc`; all mutable state lives in the store.
pub struct RateLimiter {
    config: RateLimiterConfig,
    store: Arc<WindowCounterStore>,
}

impl RateLimiter {
    /// Create a limiter, validating its policy.
    pub fn new(config: RateLimiterConfig, store: Arc<WindowCounterStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, store })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn max_requests(&self) -> u32 {
        self.config.max_requests
    }

    pub fn window_ms(&self) -> u64 {
        self.config.window_ms
    }

    pub fn store(&self) -> &Arc<WindowCounterStore> {
        &self.store
    }

    /// The namespaced store key for `request`.
    pub fn key_for(&self, request: &RequestInfo) -> String {
        format!("{}:{}", self.config.name, (self.config.key_fn)(request))
    }

    /// Decide whether `request` may proceed, recording it if so.
    ///
    /// Rejections do not count against the window, so hammering a limited
    /// key neither extends its reset time nor drives `remaining` below zero.
    pub fn check(&self, request: &RequestInfo) -> RateLimitDecision {
        let limit = self.config.max_requests;

        if let Some(skip) = &self.config.skip_fn {
            if skip(request) {
                trace!(limiter = %self.config.name, path = %request.path, "Rate limit skipped");
                return RateLimitDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_ms: 0,
                    skipped: true,
                };
            }
        }

        let key = self.key_for(request);
        let admission = self
            .store
            .admit(&key, self.config.window_ms, limit as usize);

        if !admission.recorded {
            warn!(
                key = %key,
                limiter = %self.config.name,
                current_count = admission.count,
                path = %request.path,
                "Rate limit exceeded"
            );
            return RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_ms: admission.reset_ms,
                skipped: false,
            };
        }

        let remaining = limit.saturating_sub((admission.count as u32).saturating_add(1));
        trace!(
            key = %key,
            limiter = %self.config.name,
            remaining,
            "Request admitted"
        );

        RateLimitDecision {
            allowed: true,
            limit,
            remaining,
            reset_ms: admission.reset_ms,
            skipped: false,
        }
    }

    /// Clear the bucket `request` falls into. Returns whether one existed.
    pub fn reset(&self, request: &RequestInfo) -> bool {
        self.store.reset_key(&self.key_for(request))
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}
