//! HTTP integration: axum middleware, reference login endpoint and server.

mod auth;
mod middleware;
mod server;

use std::sync::Arc;

pub use auth::{login, CredentialVerifier, LoginRequest, StaticCredentials};
pub use middleware::{
    apply_rate_limit_headers, rate_limit, request_info, AuthenticatedUser, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::HttpServer;

use crate::throttle::{LimiterRules, LoginThrottle};

/// Shared state handed to every handler and to the rate limiting middleware.
#[derive(Clone)]
pub struct AppState {
    pub rules: Arc<LimiterRules>,
    pub login_throttle: Arc<LoginThrottle>,
    pub verifier: Arc<dyn CredentialVerifier>,
    /// Take the client address from `X-Forwarded-For`
    pub trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(
        rules: Arc<LimiterRules>,
        login_throttle: Arc<LoginThrottle>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            rules,
            login_throttle,
            verifier,
            trust_proxy_headers: false,
        }
    }

    pub fn with_trusted_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }
}
