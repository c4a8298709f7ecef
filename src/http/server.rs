//! HTTP server implementation.

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::auth::login;
use super::middleware::rate_limit;
use super::AppState;
use crate::error::{GatekeeperError, Result};

/// HTTP server exposing the throttled application routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AppState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// All routes, wrapped in the rate limiting middleware.
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/api/status", get(status))
            .route("/auth/login", post(login))
            .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
            .with_state(state)
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        let app = Self::router(self.state);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GatekeeperError::Server(e.to_string())
        })
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn status() -> Json<Value> {
    Json(json!({
        "success": true,
        "service": "gatekeeper",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::http::{StaticCredentials, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
    use crate::throttle::{
        LimiterRules, LockoutPolicy, LoginThrottle, RateLimiter, RateLimiterConfig,
        WindowCounterStore,
    };
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use std::sync::Arc;
    use tower::ServiceExt;

    const PASSWORD: &str = "correct horse battery staple";

    fn test_app(clock: Arc<ManualClock>) -> Router {
        let store = Arc::new(WindowCounterStore::new(clock.clone()));
        let default = RateLimiterConfig::new("default", 100, 60_000)
            .with_skip_fn(|request| request.path.starts_with("/health"));
        let default = Arc::new(RateLimiter::new(default, store.clone()).unwrap());
        let api = Arc::new(
            RateLimiter::new(RateLimiterConfig::new("api", 2, 60_000), store).unwrap(),
        );
        let rules = LimiterRules::new(default).route("/api/", api).unwrap();

        let throttle = LoginThrottle::new(LockoutPolicy::default(), clock).unwrap();
        let verifier = StaticCredentials::new()
            .with_user("alice@example.com", PASSWORD)
            .unwrap();

        HttpServer::router(AppState::new(
            Arc::new(rules),
            Arc::new(throttle),
            Arc::new(verifier),
        ))
    }

    fn get_from(uri: &str, ip: &str) -> Request<Body> {
        let peer: SocketAddr = format!("{}:40000", ip).parse().unwrap();
        Request::builder()
            .uri(uri)
            .extension(ConnectInfo(peer))
            .body(Body::empty())
            .unwrap()
    }

    fn login_from(identifier: &str, password: &str, ip: &str) -> Request<Body> {
        let peer: SocketAddr = format!("{}:40000", ip).parse().unwrap();
        let body = json!({ "identifier": identifier, "password": password });
        Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .extension(ConnectInfo(peer))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_response_carries_headers() {
        let app = test_app(Arc::new(ManualClock::new(0)));

        let response = app.oneshot(get_from("/api/status", "10.0.0.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "2");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "1");
        assert!(response.headers().contains_key(X_RATELIMIT_RESET));
    }

    #[tokio::test]
    async fn test_rejection_is_429_with_json_body() {
        let clock = Arc::new(ManualClock::new(0));
        let app = test_app(clock.clone());

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(get_from("/api/status", "10.0.0.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        clock.set(30_500);
        let response = app
            .clone()
            .oneshot(get_from("/api/status", "10.0.0.1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "TOO_MANY_REQUESTS");

        // Other clients are unaffected
        let response = app.oneshot(get_from("/api/status", "10.0.0.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_concurrent_requests_respect_limit() {
        let app = test_app(Arc::new(ManualClock::new(0)));

        let responses = futures::future::join_all((0..10).map(|_| {
            let app = app.clone();
            tokio::spawn(async move { app.oneshot(get_from("/api/status", "10.0.0.9")).await })
        }))
        .await;

        let allowed = responses
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(|response| response.status() == StatusCode::OK)
            .count();
        assert_eq!(allowed, 2);
    }

    #[tokio::test]
    async fn test_skipped_paths_have_no_headers() {
        let app = test_app(Arc::new(ManualClock::new(0)));

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(get_from("/health", "10.0.0.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(X_RATELIMIT_LIMIT));
        }
    }

    #[tokio::test]
    async fn test_login_success_and_failure() {
        let app = test_app(Arc::new(ManualClock::new(0)));

        let response = app
            .clone()
            .oneshot(login_from("Alice@Example.com", PASSWORD, "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(login_from("alice@example.com", "wrong", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], "INVALID_CREDENTIALS");
    }

    #[tokio::test]
    async fn test_unknown_and_wrong_password_are_indistinguishable() {
        let app = test_app(Arc::new(ManualClock::new(0)));

        for attempt in 0..5 {
            let known = app
                .clone()
                .oneshot(login_from("alice@example.com", "wrong", "10.0.0.1"))
                .await
                .unwrap();
            let unknown = app
                .clone()
                .oneshot(login_from("nobody@example.com", "wrong", "10.0.0.1"))
                .await
                .unwrap();

            assert_eq!(known.status(), unknown.status(), "attempt {}", attempt);
            assert_eq!(json_body(known).await, json_body(unknown).await);
        }
    }

    #[tokio::test]
    async fn test_lockout_blocks_even_correct_password() {
        let clock = Arc::new(ManualClock::new(0));
        let app = test_app(clock.clone());

        for _ in 0..4 {
            let response = app
                .clone()
                .oneshot(login_from("alice@example.com", "wrong", "10.0.0.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let response = app
            .clone()
            .oneshot(login_from("alice@example.com", "wrong", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = json_body(response).await;
        assert_eq!(body["code"], "ACCOUNT_LOCKED");
        assert_eq!(body["remaining_minutes"], 15);

        let response = app
            .clone()
            .oneshot(login_from("alice@example.com", PASSWORD, "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // The same account from another address is not locked
        let response = app
            .clone()
            .oneshot(login_from("alice@example.com", PASSWORD, "10.0.0.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        clock.advance(15 * 60 * 1000);
        let response = app
            .oneshot(login_from("alice@example.com", PASSWORD, "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_login_body() {
        let app = test_app(Arc::new(ManualClock::new(0)));
        let request = Request::builder()
            .method("POST")
            .uri("/auth/login")
            .body(Body::from("not json"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_serve_with_shutdown() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(WindowCounterStore::new(clock.clone()));
        let default = Arc::new(
            RateLimiter::new(RateLimiterConfig::new("default", 10, 1_000), store).unwrap(),
        );
        let state = AppState::new(
            Arc::new(LimiterRules::new(default)),
            Arc::new(LoginThrottle::new(LockoutPolicy::default(), clock).unwrap()),
            Arc::new(StaticCredentials::new()),
        );
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), state);

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
