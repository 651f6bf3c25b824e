//! Read-only query API
//!
//! Serves current status, latency history, and the incident log straight
//! from the central store. Nothing here writes; the aggregator owns all
//! derived state. CORS is wide open because the status page is a separate
//! origin, and an optional basic-auth gate protects private deployments.

mod handlers;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};

use crate::config::AppConfig;
use crate::store::Store;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
}

/// Build the query-layer router.
pub fn build_router(config: Arc<AppConfig>, store: Arc<dyn Store>) -> Router {
    let state = ApiState { config, store };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/api/status", get(handlers::status))
        .route("/api/data", get(handlers::data))
        .route("/api/history/{id}", get(handlers::history))
        .route("/api/history/{id}/all", get(handlers::history_all))
        .route("/api/incidents", get(handlers::incidents))
        .route("/api/badge", get(handlers::badge))
        .route("/api/config", get(handlers::config))
        .route("/health", get(handlers::health))
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth))
        .layer(cors)
        .with_state(state)
}

/// Optional basic-auth gate: compare the whole `Authorization` header value
/// against the expected one in constant time.
async fn basic_auth(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(credentials) = state.config.password_protection.as_deref() else {
        return next.run(request).await;
    };
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(credentials)
    );
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|provided| constant_time_eq(provided.as_bytes(), expected.as_bytes()));

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"lookout\""),
            )],
            Json(serde_json::json!({ "error": "unauthorized" })),
        )
            .into_response()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn protected_router() -> Router {
        let config = AppConfig {
            password_protection: Some("admin:secret".to_string()),
            ..AppConfig::new(Vec::new(), NotificationConfig::default(), Vec::new()).unwrap()
        };
        build_router(Arc::new(config), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected() {
        let response = protected_router()
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_credentials_are_rejected() {
        let response = protected_router()
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .header("Authorization", "Basic d3Jvbmc6Y3JlZHM=")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn correct_credentials_pass() {
        // base64("admin:secret")
        let response = protected_router()
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .header("Authorization", "Basic YWRtaW46c2VjcmV0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn preflight_bypasses_auth() {
        let response = protected_router()
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/status")
                    .header("Origin", "https://status.example.com")
                    .header("Access-Control-Request-Method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn unprotected_router_is_open() {
        let config = AppConfig::new(Vec::new(), NotificationConfig::default(), Vec::new()).unwrap();
        let router = build_router(Arc::new(config), Arc::new(MemoryStore::new()));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn constant_time_eq_requires_equal_bytes() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
