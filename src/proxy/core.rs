use std::io::Read;
use std::time::Duration;

use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::StreamExt;
use reqwest::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Method;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::security::{validate_outbound_url, ValidationError};

/// Per-call bounds on an outbound fetch. Immutable for the call's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_response_bytes: usize,
}

impl FetchPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
            max_response_bytes: config.max_response_bytes,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("outbound request blocked: {0}")]
    Blocked(#[from] ValidationError),
    #[error("backend request timed out after {0}ms")]
    Timeout(u64),
    #[error("backend response exceeds {limit} byte limit")]
    ResponseTooLarge { declared: Option<u64>, limit: usize },
    #[error("backend request failed")]
    Upstream(#[source] reqwest::Error),
}

/// Sends a bounded outbound request.
///
/// The URL is re-validated here even though the router already validated
/// the inbound path: this is the single choke point every outbound call
/// goes through. The timeout covers connect plus response headers; a
/// declared Content-Length above the ceiling is rejected before any body
/// byte is read. Every call is audit-logged with its outcome.
pub async fn bounded_fetch(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    body: Option<String>,
    config: &GatewayConfig,
    policy: &FetchPolicy,
) -> Result<reqwest::Response, FetchError> {
    let validated = match validate_outbound_url(url, config) {
        Ok(validated) => validated,
        Err(e) => {
            warn!(target_url = %url, outcome = "blocked", reason = %e, "outbound fetch");
            return Err(FetchError::Blocked(e));
        }
    };

    let mut request = client
        .request(method, validated)
        .header(CONTENT_TYPE, "application/json");
    if let Some(body) = body {
        request = request.body(body);
    }

    let response = match tokio::time::timeout(policy.timeout, request.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            error!(target_url = %url, outcome = "error", reason = %e, "outbound fetch");
            return Err(FetchError::Upstream(e));
        }
        Err(_) => {
            let timeout_ms = policy.timeout.as_millis() as u64;
            error!(
                target_url = %url,
                outcome = "error",
                reason = format!("timeout after {timeout_ms}ms"),
                "outbound fetch"
            );
            return Err(FetchError::Timeout(timeout_ms));
        }
    };

    if let Some(declared) = declared_content_length(&response) {
        if declared > policy.max_response_bytes as u64 {
            warn!(
                target_url = %url,
                outcome = "blocked",
                reason = format!("declared size {declared} exceeds {}", policy.max_response_bytes),
                "outbound fetch"
            );
            return Err(FetchError::ResponseTooLarge {
                declared: Some(declared),
                limit: policy.max_response_bytes,
            });
        }
    }

    info!(target_url = %url, outcome = "success", status = %response.status(), "outbound fetch");
    Ok(response)
}

fn declared_content_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Reads the whole body with the size ceiling applied chunk by chunk, then
/// gzip-decodes it when the backend compressed it. Used for the buffered
/// (non-streaming) protocols.
pub async fn read_bounded_body(
    response: reqwest::Response,
    policy: &FetchPolicy,
) -> Result<Bytes, FetchError> {
    let is_gzip = response
        .headers()
        .get(CONTENT_ENCODING)
        .is_some_and(|value| value.to_str().unwrap_or("").contains("gzip"));

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    let read_all = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(FetchError::Upstream)?;
            if body.len() + chunk.len() > policy.max_response_bytes {
                return Err(FetchError::ResponseTooLarge {
                    declared: None,
                    limit: policy.max_response_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(())
    };
    match tokio::time::timeout(policy.timeout, read_all).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(FetchError::Timeout(policy.timeout.as_millis() as u64)),
    }

    if is_gzip && !body.is_empty() {
        let mut gz = GzDecoder::new(&body[..]);
        let mut decompressed = Vec::new();
        match gz.read_to_end(&mut decompressed) {
            Ok(_) => Ok(Bytes::from(decompressed)),
            Err(e) => {
                error!("gzip decoding of backend body failed: {e}");
                Ok(Bytes::from(body)) // return original if decode fails
            }
        }
    } else {
        Ok(Bytes::from(body))
    }
}

/// Wraps a streaming body in a cumulative byte counter. Chunks pass through
/// untouched until the running total crosses the ceiling, at which point the
/// stream errors out and the upstream read is dropped. Bytes already
/// forwarded are not retracted.
pub fn bounded_byte_stream<S, E>(
    stream: S,
    url: String,
    max_response_bytes: usize,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>>
where
    S: futures::Stream<Item = Result<Bytes, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    async_stream::stream! {
        let mut total: usize = 0;
        let mut stream = std::pin::pin!(stream);
        while let Some(chunk_result) = stream.next().await {
            match chunk_result {
                Ok(chunk) => {
                    total += chunk.len();
                    if total > max_response_bytes {
                        warn!(
                            target_url = %url,
                            outcome = "blocked",
                            reason = format!("stream exceeded {max_response_bytes} bytes"),
                            "outbound fetch"
                        );
                        yield Err(std::io::Error::other("response size limit exceeded"));
                        break;
                    }
                    yield Ok(chunk);
                }
                Err(e) => {
                    error!(target_url = %url, outcome = "error", reason = %e, "outbound fetch");
                    yield Err(std::io::Error::other(e));
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    #[tokio::test]
    async fn test_blocked_before_any_network_io() {
        // Production with only api.example.com allowlisted; target is a
        // non-routable host, so an attempted connection would error rather
        // than block. The call must fail with Blocked instead.
        let config = GatewayConfig {
            environment: Environment::Production,
            backend_url: "https://api.example.com".to_string(),
            ..GatewayConfig::default()
        };
        let policy = FetchPolicy::from_config(&config);
        let client = reqwest::Client::new();
        let err = bounded_fetch(
            &client,
            Method::POST,
            "https://evil.invalid/chat",
            None,
            &config,
            &policy,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Blocked(ValidationError::NotAllowlisted)
        ));
    }

    #[tokio::test]
    async fn test_private_target_blocked_in_production() {
        let config = GatewayConfig {
            environment: Environment::Production,
            backend_url: "https://api.example.com".to_string(),
            allowed_backend_hosts: vec!["169.254.169.254".to_string()],
            ..GatewayConfig::default()
        };
        let policy = FetchPolicy::from_config(&config);
        let client = reqwest::Client::new();
        let err = bounded_fetch(
            &client,
            Method::GET,
            "https://169.254.169.254/latest/meta-data/",
            None,
            &config,
            &policy,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Blocked(ValidationError::PrivateIpBlocked)
        ));
    }

    #[test]
    fn test_policy_defaults_from_config() {
        let config = GatewayConfig::default();
        let policy = FetchPolicy::from_config(&config);
        assert_eq!(policy.timeout, Duration::from_millis(30_000));
        assert_eq!(policy.max_response_bytes, 10 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_declared_content_length_rejected_before_body_read() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                // Headers only; the body never arrives.
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 99999\r\n\r\n")
                    .await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let config = GatewayConfig {
            backend_url: format!("http://{addr}"),
            ..GatewayConfig::default()
        };
        let policy = FetchPolicy {
            timeout: Duration::from_secs(5),
            max_response_bytes: 1024,
        };
        let client = reqwest::Client::new();
        let err = bounded_fetch(
            &client,
            Method::GET,
            &format!("http://{addr}/big"),
            None,
            &config,
            &policy,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            FetchError::ResponseTooLarge { declared: Some(99_999), limit: 1024 }
        ));
    }

    #[tokio::test]
    async fn test_bounded_stream_aborts_at_crossing_point() {
        // Four 4-byte chunks against a 10-byte ceiling: the first two pass,
        // the third crosses and errors, the fourth is never read.
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"aaaa")),
            Ok(Bytes::from_static(b"bbbb")),
            Ok(Bytes::from_static(b"cccc")),
            Ok(Bytes::from_static(b"dddd")),
        ];
        let bounded = bounded_byte_stream(
            futures::stream::iter(chunks),
            "http://test.invalid/".to_string(),
            10,
        );
        let collected: Vec<_> = bounded.collect().await;
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0].as_ref().unwrap(), &Bytes::from_static(b"aaaa"));
        assert_eq!(collected[1].as_ref().unwrap(), &Bytes::from_static(b"bbbb"));
        assert!(collected[2].is_err());
    }

    #[tokio::test]
    async fn test_bounded_stream_passes_through_under_limit() {
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"hello")), Ok(Bytes::from_static(b" world"))];
        let bounded = bounded_byte_stream(
            futures::stream::iter(chunks),
            "http://test.invalid/".to_string(),
            1024,
        );
        let collected: Vec<_> = bounded.collect().await;
        assert_eq!(collected.len(), 2);
        assert!(collected.iter().all(Result::is_ok));
    }
}
