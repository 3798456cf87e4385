use axum::{
    response::{IntoResponse, Response},
    Json,
};
use reqwest::StatusCode;
use serde_json::json;
use thiserror::Error;

use crate::proxy::core::FetchError;
use crate::security::ValidationError;
use crate::service::transform::BuildError;

/// Everything a request can fail with before or while talking to the
/// backend. Client-visible messages stay generic on purpose: no allowlist
/// contents, no upstream error details, no stack traces.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("{0}")]
    BadRequest(String),
    #[error("request body too large")]
    PayloadTooLarge,
    #[error("internal server error")]
    Internal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_code, error_message) = match &self {
            GatewayError::Validation(e) => {
                let status = match e {
                    ValidationError::PathNotAllowed
                    | ValidationError::WebSocketPathMismatch => StatusCode::NOT_FOUND,
                    _ => StatusCode::FORBIDDEN,
                };
                (status, 2001, e.to_string())
            }
            GatewayError::Fetch(e) => match e {
                FetchError::Blocked(v) => (StatusCode::FORBIDDEN, 2002, v.to_string()),
                FetchError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, 2101, e.to_string()),
                FetchError::ResponseTooLarge { .. } => {
                    (StatusCode::BAD_GATEWAY, 2102, e.to_string())
                }
                FetchError::Upstream(_) => {
                    (StatusCode::BAD_GATEWAY, 2103, "backend request failed".to_string())
                }
            },
            GatewayError::Build(e) => match e {
                BuildError::NoUserMessage => (StatusCode::BAD_REQUEST, 2201, e.to_string()),
                BuildError::InitializationFailed(_) => {
                    (StatusCode::BAD_GATEWAY, 2202, "backend initialization failed".to_string())
                }
            },
            GatewayError::BadRequest(msg) => (StatusCode::BAD_REQUEST, 1001, msg.clone()),
            GatewayError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, 1002, self.to_string())
            }
            GatewayError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, 0, "internal server error".to_string())
            }
        };
        let body = Json(json!({
            "code": error_code,
            "msg": error_message,
        }));
        (status, body).into_response()
    }
}
