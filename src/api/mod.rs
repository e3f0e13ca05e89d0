pub mod error;
mod handlers;
pub mod resolve;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    response::Response,
    routing::{delete, get},
    Router,
};
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::artifacts::ArtifactStore;
use crate::job::JobRunner;
use crate::session::SessionRegistry;

use error::ApiError;
use handlers::*;
use resolve::SessionCarriage;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub artifacts: ArtifactStore,
    pub runner: Arc<JobRunner>,
    /// How session identifiers are read from requests and written to cookies.
    pub carriage: Arc<SessionCarriage>,
}

/// Configuration for the HTTP router.
///
/// Use `RouterConfig::default()` in tests for a setup without CORS or
/// rate limiting.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub cors_origins: Vec<String>,
    /// Per-IP requests per second. Requires connect info on the listener.
    pub rate_limit: Option<u32>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let session_routes = Router::new()
        .route("/api/session", get(session_info))
        .route("/api/config", get(config_get).post(config_set))
        .route("/api/students", get(students_get).post(students_set))
        .route("/api/run", get(run))
        .route("/api/files", get(files_list))
        .route("/api/files/{name}", delete(files_delete))
        .route("/downloads/{name}", get(download))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            resolve::resolve_session,
        ))
        .with_state(state);

    let session_routes = match config.rate_limit {
        Some(rps) => {
            use tower_governor::{
                governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer,
            };
            let replenish_ms = (1000 / u64::from(rps.max(1))).max(1);
            match GovernorConfigBuilder::default()
                .per_millisecond(replenish_ms)
                .burst_size(rps.max(1))
                .key_extractor(PeerIpKeyExtractor)
                .finish()
            {
                Some(conf) => session_routes.layer(GovernorLayer::new(Arc::new(conf))),
                None => {
                    tracing::warn!(rps, "invalid rate limit, serving without it");
                    session_routes
                }
            }
        }
        None => session_routes,
    };

    let router = Router::new()
        .route("/health", get(health))
        .merge(session_routes)
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http());

    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, HeaderName::from_static("x-session-id")])
                .allow_credentials(true),
        )
    }
}

/// Turn a handler panic into the standard 500 body.
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "request handler panicked");
    axum::response::IntoResponse::into_response(ApiError::InternalError(
        "unexpected server error".to_string(),
    ))
}
