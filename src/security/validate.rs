use reqwest::Url;
use thiserror::Error;
use tracing::warn;

use crate::config::GatewayConfig;

use super::address::{is_obfuscated_ip, is_private_address};

/// Rejections produced before any outbound call is made. These are the
/// security boundary: every variant maps to a 4xx and none of the messages
/// echo allowlist contents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid URL format")]
    InvalidFormat,
    #[error("protocol not permitted")]
    InvalidProtocol,
    #[error("host not allowlisted")]
    NotAllowlisted,
    #[error("private address blocked")]
    PrivateIpBlocked,
    #[error("suspicious hostname blocked")]
    DnsRebindingSuspected,
    #[error("path not allowed")]
    PathNotAllowed,
    #[error("websocket path mismatch")]
    WebSocketPathMismatch,
}

/// Validates a URL the gateway is about to call.
///
/// Order matters: format, protocol policy, obfuscated-host rejection, host
/// allowlist, then private-address policy. Allowlist membership never
/// overrides the private-address check in production.
pub fn validate_outbound_url(
    url_str: &str,
    config: &GatewayConfig,
) -> Result<Url, ValidationError> {
    let url = Url::parse(url_str).map_err(|_| ValidationError::InvalidFormat)?;

    match url.scheme() {
        "https" => {}
        "http" if !config.is_production() => {}
        _ => return Err(ValidationError::InvalidProtocol),
    }

    // The URL parser canonicalizes numeric hosts (decimal or hex IPv4
    // encodings become dotted quads), so this check has to look at the raw
    // host token as the caller wrote it. Rejected in every environment.
    if let Some(raw_host) = raw_host_token(url_str) {
        if is_obfuscated_ip(raw_host) {
            return Err(ValidationError::DnsRebindingSuspected);
        }
    }

    let hostname = url
        .host_str()
        .ok_or(ValidationError::InvalidFormat)?
        .to_ascii_lowercase();

    let allowed_hosts = config.allowed_host_set();
    if allowed_hosts.is_empty() {
        if config.is_production() {
            // Fail closed: an empty allowlist in production permits nothing.
            return Err(ValidationError::NotAllowlisted);
        }
        warn!("outbound host allowlist is empty; permitting all hosts in development");
    } else if !allowed_hosts.contains(&hostname) {
        return Err(ValidationError::NotAllowlisted);
    }

    if config.is_production() && is_private_address(&hostname) {
        return Err(ValidationError::PrivateIpBlocked);
    }

    // A hostname that is not an IP literal gets a second look in production:
    // a name that classifies as private (e.g. metadata.google.internal)
    // could resolve differently between now and the actual fetch.
    let is_ip_literal = hostname.parse::<std::net::IpAddr>().is_ok();
    if !is_ip_literal && config.is_production() && is_private_address(&hostname) {
        return Err(ValidationError::DnsRebindingSuspected);
    }

    Ok(url)
}

/// The host portion of `url_str` as written, before parser canonicalization.
fn raw_host_token(url_str: &str) -> Option<&str> {
    let (_, rest) = url_str.split_once("://")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    if host.starts_with('[') {
        // Bracketed IPv6 literals are never decimal or hex encodings.
        return None;
    }
    Some(host.rsplit_once(':').map_or(host, |(h, _)| h))
}

/// Validates an inbound proxy path and returns the backend path it maps to.
///
/// Pure string matching on the raw path: the prefix is stripped with
/// `strip_prefix`, and the remainder must be exactly one allowlisted
/// backend path. Nothing is normalized first, so `.`/`..` segments can
/// never collapse into an allowed path.
pub fn validate_inbound_path<'a>(
    path: &'a str,
    config: &GatewayConfig,
) -> Result<&'a str, ValidationError> {
    let backend_path = path
        .strip_prefix(config.proxy_prefix.as_str())
        .filter(|rest| rest.starts_with('/'))
        .ok_or(ValidationError::PathNotAllowed)?;

    if config
        .allowed_backend_paths
        .iter()
        .any(|allowed| allowed == backend_path)
    {
        Ok(backend_path)
    } else {
        Err(ValidationError::PathNotAllowed)
    }
}

/// WebSocket upgrades are accepted on exactly one configured path.
pub fn validate_websocket_path(
    path: &str,
    config: &GatewayConfig,
) -> Result<(), ValidationError> {
    if path == config.websocket_path {
        Ok(())
    } else {
        Err(ValidationError::WebSocketPathMismatch)
    }
}
