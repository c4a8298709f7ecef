//! Reference login endpoint guarded by the login throttle.
//!
//! The handler's observable behavior must not depend on whether the submitted
//! identifier belongs to an account: lockout is checked per
//! `(identifier, ip)` before verification, every failed verification is
//! recorded, and wrong passwords and unknown identifiers share one response.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::middleware::request_info;
use super::AppState;
use crate::error::{GatekeeperError, Result};
use crate::throttle::{normalize_identifier, LoginDecision};

const MAX_BODY_BYTES: usize = 16 * 1024;

/// Placeholder compared against when the identifier is unknown, so both paths
/// do the same amount of work.
const DUMMY_SECRET: &str = "gatekeeper-placeholder-secret-value";

/// Checks submitted credentials.
///
/// Implementations must take comparable time whether or not the identifier
/// exists.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, identifier: &str, password: &str) -> bool;
}

/// In-memory credential table keyed by normalized identifier.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account. Identifiers that normalize to nothing are rejected.
    pub fn with_user(mut self, identifier: &str, password: impl Into<String>) -> Result<Self> {
        let normalized = normalize_identifier(identifier);
        if normalized.is_empty() {
            return Err(GatekeeperError::Config(format!(
                "login identifier '{}' is empty after normalization",
                identifier
            )));
        }
        self.users.insert(normalized, password.into());
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn verify(&self, identifier: &str, password: &str) -> bool {
        let stored = self.users.get(&normalize_identifier(identifier));
        let expected = stored.map(String::as_str).unwrap_or(DUMMY_SECRET);
        let matches = constant_time_eq(expected.as_bytes(), password.as_bytes());
        matches && stored.is_some()
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut diff = (a.len() != b.len()) as u8;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(alias = "email", alias = "phone")]
    pub identifier: String,
    pub password: String,
}

/// `POST /auth/login`
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn login(State(state): State<AppState>, request: Request) -> Response {
    let info = request_info(&request, state.trust_proxy_headers);
    let ip = info.client_ip();

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => return bad_request(),
    };
    let credentials: LoginRequest = match serde_json::from_slice(&body) {
        Ok(credentials) => credentials,
        Err(_) => return bad_request(),
    };

    let decision = state.login_throttle.check(&credentials.identifier, &ip);
    if decision.is_locked() {
        return locked_out(decision.remaining_minutes());
    }

    if state
        .verifier
        .verify(&credentials.identifier, &credentials.password)
        .await
    {
        state
            .login_throttle
            .clear_attempts(&credentials.identifier, &ip);
        info!(ip = %ip, "Login succeeded");
        return (
            StatusCode::OK,
            Json(json!({ "success": true, "message": "Login successful." })),
        )
            .into_response();
    }

    let attempt = state
        .login_throttle
        .record_failed_attempt(&credentials.identifier, &ip);
    if attempt.is_locked {
        let minutes = LoginDecision::LockedOut {
            remaining_ms: attempt.lockout_ms,
        }
        .remaining_minutes();
        return locked_out(minutes);
    }

    warn!(ip = %ip, "Login failed");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "success": false,
            "message": "Invalid credentials.",
            "code": "INVALID_CREDENTIALS",
        })),
    )
        .into_response()
}

fn locked_out(minutes: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "success": false,
            "message": format!(
                "Too many failed login attempts. Please try again in {} minute(s).",
                minutes
            ),
            "code": "ACCOUNT_LOCKED",
            "remaining_minutes": minutes,
        })),
    )
        .into_response()
}

fn bad_request() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "success": false,
            "message": "Malformed login request.",
            "code": "BAD_REQUEST",
        })),
    )
        .into_response()
}
