use std::sync::Arc;

use axum::{http::HeaderValue, routing::get, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::service::app_state::AppState;

use super::handlers::{gateway_handler, websocket_handler};

/// Builds the gateway router. The websocket path gets its exact route; every
/// other request falls through to the gateway handler, which sees the raw,
/// unstripped path and validates it against the proxy prefix itself. No
/// framework path matching happens before validation.
pub fn create_proxy_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origin);

    Router::new()
        .route(&state.config.websocket_path, get(websocket_handler))
        .fallback(gateway_handler)
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let allow_origin = if origin == "*" {
        AllowOrigin::any()
    } else {
        match HeaderValue::from_str(origin) {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                warn!("invalid CORS origin in config; falling back to any");
                AllowOrigin::any()
            }
        }
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}
