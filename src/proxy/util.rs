use std::collections::HashMap;

use axum::{body::Body, extract::Request};

use crate::error::GatewayError;
use crate::service::transform::GatewayRequest;

/// Reads and parses the inbound request body, enforcing the inbound size
/// ceiling (separate from the outbound response ceiling).
pub(super) async fn parse_request_body(
    request: Request<Body>,
    max_bytes: usize,
) -> Result<GatewayRequest, GatewayError> {
    let body = axum::body::to_bytes(request.into_body(), max_bytes)
        .await
        .map_err(|_| GatewayError::PayloadTooLarge)?;

    if body.is_empty() {
        return Err(GatewayError::BadRequest("request body is empty".to_string()));
    }

    serde_json::from_slice(&body)
        .map_err(|e| GatewayError::BadRequest(format!("failed to parse JSON body: {e}")))
}

// Helper to serialize a header map for debug logging. Credentials never
// belong in logs.
const IGNORED_HEADERS: [&str; 2] = ["authorization", "cookie"];

pub(super) fn serialize_headers(headers: &axum::http::HeaderMap) -> Option<String> {
    let mut simplified = HashMap::new();
    for (name, value) in headers.iter() {
        let name_str = name.as_str().to_lowercase();
        if IGNORED_HEADERS.contains(&name_str.as_str()) {
            continue;
        }
        simplified.insert(name_str, value.to_str().unwrap_or("").to_string());
    }
    serde_json::to_string(&simplified).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[tokio::test]
    async fn test_parse_request_body_roundtrip() {
        let body = r#"{"messages": [{"role": "user", "content": "hi"}]}"#;
        let request = Request::builder().body(Body::from(body)).unwrap();
        let parsed = parse_request_body(request, 1024).await.unwrap();
        assert_eq!(parsed.messages.len(), 1);
        assert!(parsed.show_intermediate_steps); // default
    }

    #[tokio::test]
    async fn test_parse_request_body_enforces_ceiling() {
        let body = "x".repeat(2048);
        let request = Request::builder().body(Body::from(body)).unwrap();
        let err = parse_request_body(request, 1024).await.unwrap_err();
        assert!(matches!(err, GatewayError::PayloadTooLarge));
    }

    #[tokio::test]
    async fn test_parse_request_body_rejects_empty() {
        let request = Request::builder().body(Body::empty()).unwrap();
        let err = parse_request_body(request, 1024).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn test_serialize_headers_drops_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let serialized = serialize_headers(&headers).unwrap();
        assert!(!serialized.contains("secret"));
        assert!(serialized.contains("content-type"));
    }
}
