use std::collections::HashSet;
use std::time::Duration;
use std::{fs, path::Path};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_RAG_INIT_CACHE_CAP: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Development,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

/// The fully resolved gateway configuration.
///
/// The binary reads it once through [`CONFIG`]; everything else takes a
/// reference (or an `Arc`) so tests can construct isolated instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
    /// Inbound prefix under which backend paths are exposed, e.g. `/api`.
    pub proxy_prefix: String,
    /// The single path on which websocket upgrades are accepted.
    pub websocket_path: String,
    /// Base URL of the configured backend, e.g. `http://127.0.0.1:8000`.
    pub backend_url: String,
    /// Extra hostnames permitted for outbound calls besides the backend
    /// URL's own host.
    pub allowed_backend_hosts: Vec<String>,
    /// Backend paths that may be reached through the proxy prefix.
    pub allowed_backend_paths: Vec<String>,
    pub request_timeout_ms: u64,
    pub max_response_bytes: usize,
    /// Ceiling on inbound request bodies (conversation JSON), separate
    /// from the outbound response ceiling.
    pub max_request_bytes: usize,
    pub cors_origin: String,
    pub log_level: String,
    /// Model string placed into chat-protocol payloads.
    pub chat_model: String,
    /// Send the full message history to chat backends, or only the last
    /// user message.
    pub send_full_history: bool,
    /// Fixed session identifier used for the RAG /init handshake.
    pub rag_session_id: String,
    pub rag_init_cache_cap: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            environment: Environment::default(),
            proxy_prefix: "/api".to_string(),
            websocket_path: "/ws".to_string(),
            backend_url: "http://127.0.0.1:8000".to_string(),
            allowed_backend_hosts: Vec::new(),
            allowed_backend_paths: vec![
                "/generate".to_string(),
                "/generate/stream".to_string(),
                "/chat".to_string(),
                "/chat/stream".to_string(),
                "/call".to_string(),
            ],
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            cors_origin: "*".to_string(),
            log_level: "info".to_string(),
            chat_model: "default".to_string(),
            send_full_history: true,
            rag_session_id: "12345678-1234-1234-1234-123456789abc".to_string(),
            rag_init_cache_cap: DEFAULT_RAG_INIT_CACHE_CAP,
        }
    }
}

impl GatewayConfig {
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The outbound host allowlist: configured hosts plus the hostname of
    /// the default backend URL, de-duplicated and lowercased. May be empty
    /// when nothing is configured; the validator decides what that means
    /// per environment.
    pub fn allowed_host_set(&self) -> HashSet<String> {
        let mut hosts: HashSet<String> = self
            .allowed_backend_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if let Ok(url) = reqwest::Url::parse(&self.backend_url) {
            if let Some(host) = url.host_str() {
                hosts.insert(host.to_ascii_lowercase());
            }
        }
        hosts
    }
}

// Used for deserializing user-provided config files where all fields are
// optional.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub environment: Option<Environment>,
    pub proxy_prefix: Option<String>,
    pub websocket_path: Option<String>,
    pub backend_url: Option<String>,
    pub allowed_backend_hosts: Option<Vec<String>>,
    pub allowed_backend_paths: Option<Vec<String>>,
    pub request_timeout_ms: Option<u64>,
    pub max_response_bytes: Option<usize>,
    pub max_request_bytes: Option<usize>,
    pub cors_origin: Option<String>,
    pub log_level: Option<String>,
    pub chat_model: Option<String>,
    pub send_full_history: Option<bool>,
    pub rag_session_id: Option<String>,
    pub rag_init_cache_cap: Option<usize>,
}

impl PartialConfig {
    /// Merges the fields of this partial config into a final config,
    /// overwriting existing values.
    fn merge_into(self, final_config: &mut GatewayConfig) {
        if let Some(host) = self.host { final_config.host = host; }
        if let Some(port) = self.port { final_config.port = port; }
        if let Some(environment) = self.environment { final_config.environment = environment; }
        if let Some(proxy_prefix) = self.proxy_prefix { final_config.proxy_prefix = proxy_prefix; }
        if let Some(websocket_path) = self.websocket_path { final_config.websocket_path = websocket_path; }
        if let Some(backend_url) = self.backend_url { final_config.backend_url = backend_url; }
        if let Some(hosts) = self.allowed_backend_hosts { final_config.allowed_backend_hosts = hosts; }
        if let Some(paths) = self.allowed_backend_paths { final_config.allowed_backend_paths = paths; }
        if let Some(timeout) = self.request_timeout_ms { final_config.request_timeout_ms = timeout; }
        if let Some(max_resp) = self.max_response_bytes { final_config.max_response_bytes = max_resp; }
        if let Some(max_req) = self.max_request_bytes { final_config.max_request_bytes = max_req; }
        if let Some(cors_origin) = self.cors_origin { final_config.cors_origin = cors_origin; }
        if let Some(log_level) = self.log_level { final_config.log_level = log_level; }
        if let Some(chat_model) = self.chat_model { final_config.chat_model = chat_model; }
        if let Some(full_history) = self.send_full_history { final_config.send_full_history = full_history; }
        if let Some(session_id) = self.rag_session_id { final_config.rag_session_id = session_id; }
        if let Some(cap) = self.rag_init_cache_cap { final_config.rag_init_cache_cap = cap; }
    }
}

fn get_env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn get_env_csv(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn get_config_from_env() -> PartialConfig {
    PartialConfig {
        host: get_env_var("HOST"),
        port: get_env_var("PORT"),
        environment: get_env_var::<Environment>("ENVIRONMENT"),
        proxy_prefix: get_env_var("PROXY_PREFIX"),
        websocket_path: get_env_var("WEBSOCKET_PATH"),
        backend_url: get_env_var("BACKEND_URL"),
        allowed_backend_hosts: get_env_csv("ALLOWED_BACKEND_HOSTS"),
        allowed_backend_paths: None,
        request_timeout_ms: get_env_var("REQUEST_TIMEOUT_MS"),
        max_response_bytes: get_env_var("MAX_RESPONSE_BYTES"),
        max_request_bytes: get_env_var("MAX_REQUEST_BYTES"),
        cors_origin: get_env_var("CORS_ORIGIN"),
        log_level: get_env_var("LOG_LEVEL"),
        chat_model: get_env_var("CHAT_MODEL"),
        send_full_history: get_env_var("SEND_FULL_HISTORY"),
        rag_session_id: get_env_var("RAG_SESSION_ID"),
        rag_init_cache_cap: get_env_var("RAG_INIT_CACHE_CAP"),
    }
}

/// Resolves the effective configuration: programmatic defaults, overridden
/// by an optional yaml file, overridden by environment variables.
pub fn load_config() -> GatewayConfig {
    let mut final_config = GatewayConfig::default();

    let config_path = std::env::var("GATEWAY_CONFIG_FILE")
        .unwrap_or_else(|_| "config.yaml".to_string());
    let config_path = Path::new(&config_path);
    if config_path.exists() {
        if let Ok(config_str) = fs::read_to_string(config_path) {
            let file_config: PartialConfig = serde_yaml::from_str(&config_str)
                .unwrap_or_else(|e| {
                    panic!("Failed to parse configuration file at {config_path:?}: {e}")
                });
            file_config.merge_into(&mut final_config);
        }
    }

    get_config_from_env().merge_into(&mut final_config);
    final_config
}

pub static CONFIG: Lazy<GatewayConfig> = Lazy::new(load_config);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.max_response_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_request_bytes, 5 * 1024 * 1024);
        assert!(!config.is_production());
        assert!(config.allowed_backend_paths.contains(&"/chat/stream".to_string()));
    }

    #[test]
    fn test_partial_merge_overrides() {
        let mut config = GatewayConfig::default();
        let partial = PartialConfig {
            port: Some(9000),
            environment: Some(Environment::Production),
            backend_url: Some("https://api.example.com".to_string()),
            ..Default::default()
        };
        partial.merge_into(&mut config);
        assert_eq!(config.port, 9000);
        assert!(config.is_production());
        assert_eq!(config.backend_url, "https://api.example.com");
        // untouched fields keep their defaults
        assert_eq!(config.proxy_prefix, "/api");
    }

    #[test]
    fn test_allowed_host_set_includes_backend_host() {
        let config = GatewayConfig {
            backend_url: "https://api.example.com:8443/base".to_string(),
            allowed_backend_hosts: vec!["Other.Example.COM".to_string(), " ".to_string()],
            ..GatewayConfig::default()
        };
        let hosts = config.allowed_host_set();
        assert!(hosts.contains("api.example.com"));
        assert!(hosts.contains("other.example.com"));
        assert_eq!(hosts.len(), 2);
    }

    #[test]
    fn test_allowed_host_set_empty_when_unconfigured() {
        let config = GatewayConfig {
            backend_url: "not a url".to_string(),
            allowed_backend_hosts: Vec::new(),
            ..GatewayConfig::default()
        };
        assert!(config.allowed_host_set().is_empty());
    }
}
