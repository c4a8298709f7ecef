//! Route-to-limiter selection.
//!
//! Every request is governed by exactly one limiter: the one attached to the
//! longest route prefix matching its path, or the default limiter when no
//! route matches. All limiters share a single [`WindowCounterStore`] and are
//! kept apart by their names.

use std::sync::Arc;

use tracing::info;

use super::key::{skip_paths, RequestInfo};
use super::limiter::{RateLimitDecision, RateLimiter, RateLimiterConfig};
use super::store::WindowCounterStore;
use crate::config::{LimiterSpec, RateLimitingConfig};
use crate::error::{GatekeeperError, Result};

/// A limiter bound to a path prefix.
#[derive(Debug)]
struct RouteLimiter {
    prefix: String,
    limiter: Arc<RateLimiter>,
}

/// The set of limiters protecting an application.
#[derive(Debug)]
pub struct LimiterRules {
    default: Arc<RateLimiter>,
    /// Sorted by descending prefix length so the first match is the most specific
    routes: Vec<RouteLimiter>,
    store: Arc<WindowCounterStore>,
}

impl LimiterRules {
    /// Start from a default limiter; add routes with [`LimiterRules::route`].
    pub fn new(default: Arc<RateLimiter>) -> Self {
        let store = default.store().clone();
        Self {
            default,
            routes: Vec::new(),
            store,
        }
    }

    /// Attach `limiter` to every path starting with `prefix`.
    ///
    /// The limiter must use the same store as the default limiter.
    pub fn route(mut self, prefix: impl Into<String>, limiter: Arc<RateLimiter>) -> Result<Self> {
        let prefix = prefix.into();
        if !Arc::ptr_eq(limiter.store(), &self.store) {
            return Err(GatekeeperError::Config(format!(
                "limiter '{}' for route '{}' does not share the default store",
                limiter.name(),
                prefix
            )));
        }

        self.routes.push(RouteLimiter { prefix, limiter });
        self.routes
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(self)
    }

    /// Build every limiter described by `config` on top of `store`.
    pub fn from_config(config: &RateLimitingConfig, store: Arc<WindowCounterStore>) -> Result<Self> {
        let skip = skip_paths(config.skip_paths.clone());
        let build = |spec: &LimiterSpec| -> Result<Arc<RateLimiter>> {
            let limiter_config: RateLimiterConfig = spec
                .to_limiter_config()?
                .with_shared_skip_fn(skip.clone());
            Ok(Arc::new(RateLimiter::new(limiter_config, store.clone())?))
        };

        let mut rules = LimiterRules::new(build(&config.default)?);
        for route in &config.routes {
            rules = rules.route(route.prefix.clone(), build(&route.limiter)?)?;
        }

        info!(
            default = %rules.default.name(),
            routes = rules.routes.len(),
            skip_paths = ?config.skip_paths,
            "Rate limiter rules loaded"
        );
        Ok(rules)
    }

    /// The limiter governing `path`.
    pub fn limiter_for(&self, path: &str) -> &Arc<RateLimiter> {
        self.routes
            .iter()
            .find(|route| path.starts_with(route.prefix.as_str()))
            .map(|route| &route.limiter)
            .unwrap_or(&self.default)
    }

    /// Check `request` against the limiter governing its path.
    pub fn check(&self, request: &RequestInfo) -> RateLimitDecision {
        self.limiter_for(&request.path).check(request)
    }

    pub fn store(&self) -> &Arc<WindowCounterStore> {
        &self.store
    }

    /// Idle time after which a store key can no longer affect any decision:
    /// two widths of the longest window.
    pub fn max_idle_ms(&self) -> u64 {
        self.limiters()
            .map(|limiter| limiter.window_ms())
            .max()
            .unwrap_or(0)
            .saturating_mul(2)
    }

    /// Evict keys idle for two widths of their own limiter's window.
    ///
    /// Keys are matched to limiters by their `name:` namespace; keys that
    /// belong to no limiter fall back to [`LimiterRules::max_idle_ms`].
    pub fn sweep(&self) -> usize {
        let fallback = self.max_idle_ms();
        self.store.sweep_by(|key| {
            self.limiters()
                .filter(|limiter| {
                    key.strip_prefix(limiter.name())
                        .is_some_and(|rest| rest.starts_with(':'))
                })
                .max_by_key(|limiter| limiter.name().len())
                .map(|limiter| limiter.window_ms().saturating_mul(2))
                .unwrap_or(fallback)
        })
    }

    /// The shortest window among all limiters.
    pub fn min_window_ms(&self) -> u64 {
        self.limiters()
            .map(|limiter| limiter.window_ms())
            .min()
            .unwrap_or(0)
    }

    fn limiters(&self) -> impl Iterator<Item = &Arc<RateLimiter>> {
        std::iter::once(&self.default).chain(self.routes.iter().map(|route| &route.limiter))
    }
}
