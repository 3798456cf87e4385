use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::service::transform::rag::ConversationInitStore;

/// Shared per-process state, constructed once at startup and handed to the
/// router. Tests build their own instances with isolated config and init
/// stores instead of mutating globals.
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub client: reqwest::Client,
    pub init_store: ConversationInitStore,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let init_store = ConversationInitStore::new(config.rag_init_cache_cap);
        Arc::new(Self {
            config: Arc::new(config),
            client: reqwest::Client::new(),
            init_store,
        })
    }
}
