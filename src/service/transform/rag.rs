use dashmap::DashMap;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::proxy::core::{bounded_fetch, FetchPolicy};
use crate::service::app_state::AppState;

use super::{last_user_message, BuildError, GatewayRequest};

const DEFAULT_CONVERSATION_ID: &str = "default";

/// Tracks which conversations have completed the one-time RAG `/init`
/// handshake. Keys live for the life of the process, capped so a long-lived
/// gateway does not grow one entry per conversation forever; re-initializing
/// an evicted conversation is harmless.
#[derive(Debug)]
pub struct ConversationInitStore {
    initialized: DashMap<String, ()>,
    cap: usize,
}

impl ConversationInitStore {
    pub fn new(cap: usize) -> Self {
        Self {
            initialized: DashMap::new(),
            cap: cap.max(1),
        }
    }

    pub fn is_initialized(&self, key: &str) -> bool {
        self.initialized.contains_key(key)
    }

    /// Marks a conversation initialized, evicting an arbitrary entry first
    /// when the store is full.
    pub fn mark_initialized(&self, key: String) {
        if self.initialized.len() >= self.cap && !self.initialized.contains_key(&key) {
            // Clone the victim key and drop the iterator's shard guard before
            // calling `remove`, which locks the same shard.
            let evict = self
                .initialized
                .iter()
                .next()
                .map(|entry| entry.key().clone());
            if let Some(evict) = evict {
                self.initialized.remove(&evict);
            }
        }
        self.initialized.insert(key, ());
    }

    pub fn len(&self) -> usize {
        self.initialized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.initialized.is_empty()
    }
}

pub fn conversation_key(session_id: &str, conversation_id: Option<&str>) -> String {
    format!(
        "{}:{}",
        session_id,
        conversation_id.unwrap_or(DEFAULT_CONVERSATION_ID)
    )
}

/// Builds the context-aware-RAG payload. The first request of a conversation
/// triggers a `POST /init` with the fixed session id; the conversation is
/// only marked initialized once that call succeeds, so a failed init is
/// retried on the next request.
pub async fn build_payload(
    request: &GatewayRequest,
    state: &AppState,
) -> Result<Value, BuildError> {
    let last = last_user_message(&request.messages)?;

    let key = conversation_key(
        &state.config.rag_session_id,
        request.conversation_id.as_deref(),
    );
    if !state.init_store.is_initialized(&key) {
        initialize_conversation(state).await?;
        state.init_store.mark_initialized(key);
    }

    Ok(json!({ "state": { "chat": { "question": last.content } } }))
}

async fn initialize_conversation(state: &AppState) -> Result<(), BuildError> {
    let init_url = format!("{}/init", state.config.backend_url.trim_end_matches('/'));
    let body = json!({ "session_id": state.config.rag_session_id }).to_string();
    let policy = FetchPolicy::from_config(&state.config);

    let response = bounded_fetch(
        &state.client,
        Method::POST,
        &init_url,
        Some(body),
        &state.config,
        &policy,
    )
    .await
    .map_err(|e| BuildError::InitializationFailed(e.to_string()))?;

    if !response.status().is_success() {
        warn!(status = %response.status(), "RAG /init rejected");
        return Err(BuildError::InitializationFailed(format!(
            "init returned status {}",
            response.status()
        )));
    }

    info!("RAG conversation initialized");
    Ok(())
}

/// Buffered extraction: the RAG state shape first, then a flat `answer`.
/// The caller falls back to raw text when neither is present.
pub fn extract_buffered(parsed: &Value) -> Option<Value> {
    parsed
        .pointer("/state/chat/answer")
        .or_else(|| parsed.get("answer"))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::service::transform::{ChatMessage, Role};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_conversation_key_defaults() {
        assert_eq!(conversation_key("uuid", None), "uuid:default");
        assert_eq!(conversation_key("uuid", Some("c1")), "uuid:c1");
    }

    #[test]
    fn test_store_marks_and_reports() {
        let store = ConversationInitStore::new(16);
        assert!(!store.is_initialized("uuid:c1"));
        store.mark_initialized("uuid:c1".to_string());
        assert!(store.is_initialized("uuid:c1"));
        assert!(!store.is_initialized("uuid:c2"));
    }

    #[test]
    fn test_store_evicts_at_cap() {
        let store = ConversationInitStore::new(2);
        store.mark_initialized("a".to_string());
        store.mark_initialized("b".to_string());
        store.mark_initialized("c".to_string());
        assert_eq!(store.len(), 2);
        assert!(store.is_initialized("c"));
    }

    #[test]
    fn test_extraction_precedence() {
        let nested = serde_json::json!({
            "state": {"chat": {"answer": "nested"}},
            "answer": "flat",
        });
        assert_eq!(extract_buffered(&nested), Some(serde_json::json!("nested")));

        let flat = serde_json::json!({"answer": "flat"});
        assert_eq!(extract_buffered(&flat), Some(serde_json::json!("flat")));

        assert_eq!(extract_buffered(&serde_json::json!({"x": 1})), None);
    }

    /// Minimal one-connection-at-a-time HTTP responder for exercising the
    /// init handshake without a real backend.
    async fn spawn_init_backend(status_line: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                hits_clone.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    fn rag_request(conversation_id: Option<&str>) -> GatewayRequest {
        GatewayRequest {
            messages: vec![ChatMessage { role: Role::User, content: "q".into() }],
            conversation_id: conversation_id.map(str::to_string),
            optional_params: None,
            show_intermediate_steps: true,
        }
    }

    #[tokio::test]
    async fn test_init_called_once_per_conversation() {
        let (backend_url, hits) = spawn_init_backend("200 OK").await;
        let config = GatewayConfig { backend_url, ..GatewayConfig::default() };
        let state = AppState::new(config);

        let payload = build_payload(&rag_request(Some("c1")), &state).await.unwrap();
        assert_eq!(payload, serde_json::json!({"state": {"chat": {"question": "q"}}}));
        build_payload(&rag_request(Some("c1")), &state).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A different conversation id triggers its own init.
        build_payload(&rag_request(Some("c2")), &state).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_init_not_marked_initialized() {
        let (backend_url, hits) = spawn_init_backend("502 Bad Gateway").await;
        let config = GatewayConfig { backend_url, ..GatewayConfig::default() };
        let state = AppState::new(config);

        let err = build_payload(&rag_request(None), &state).await.unwrap_err();
        assert!(matches!(err, BuildError::InitializationFailed(_)));

        // The retry attempts init again instead of skipping it.
        let _ = build_payload(&rag_request(None), &state).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
