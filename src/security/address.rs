use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Cloud metadata endpoints that must never be reachable through the
/// gateway, regardless of how they are spelled in a URL.
const METADATA_HOSTS: [&str; 4] = [
    "169.254.169.254",       // AWS / GCP / Azure IMDS
    "169.254.170.2",         // AWS ECS task metadata
    "metadata.google.internal",
    "100.100.100.200",       // Alibaba Cloud
];

/// Returns true when the hostname names a private, loopback, link-local,
/// unique-local, unspecified/broadcast or cloud-metadata address.
///
/// Total function: anything unrecognized is simply not private. Hostname
/// comparison is case-insensitive.
pub fn is_private_address(hostname: &str) -> bool {
    let host = hostname.trim().trim_matches(|c| c == '[' || c == ']');
    let lower = host.to_ascii_lowercase();

    if lower == "localhost" || lower.ends_with(".localhost") {
        return true;
    }
    if METADATA_HOSTS.contains(&lower.as_str()) {
        return true;
    }

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => is_private_v4(v4),
        Ok(IpAddr::V6(v6)) => is_private_v6(v6),
        Err(_) => false,
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.octets() == [100, 100, 100, 200]
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    let segments = ip.segments();
    // fe80::/10 link-local, fc00::/7 unique-local
    if (segments[0] & 0xffc0) == 0xfe80 || (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }
    // IPv4-mapped addresses classify as their embedded v4 address.
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    false
}

/// Returns true when the hostname is a numeric encoding of an IP address:
/// all decimal digits (`2130706433` is 127.0.0.1) or `0x` + hex digits.
///
/// Such hostnames exist only to slip past name-based allowlists, so they
/// are flagged unconditionally.
pub fn is_obfuscated_ip(hostname: &str) -> bool {
    let host = hostname.trim();
    if host.is_empty() {
        return false;
    }
    if host.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    let lower = host.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        return !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit());
    }
    false
}
