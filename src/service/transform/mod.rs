use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod chat;
pub mod generate;
pub mod rag;
pub mod stream;

use crate::service::app_state::AppState;

/// The closed set of backend wire protocols the gateway speaks. The inbound
/// path selects the protocol, and the protocol selects both the payload
/// builder and the response processor so the two can never be mismatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum BackendProtocol {
    Generate,
    GenerateStream,
    Chat,
    ChatStream,
    ContextAwareRag,
}

impl BackendProtocol {
    pub fn from_backend_path(path: &str) -> Option<Self> {
        match path {
            "/generate" => Some(Self::Generate),
            "/generate/stream" => Some(Self::GenerateStream),
            "/chat" => Some(Self::Chat),
            "/chat/stream" => Some(Self::ChatStream),
            "/call" => Some(Self::ContextAwareRag),
            _ => None,
        }
    }

    pub fn backend_path(self) -> &'static str {
        match self {
            Self::Generate => "/generate",
            Self::GenerateStream => "/generate/stream",
            Self::Chat => "/chat",
            Self::ChatStream => "/chat/stream",
            Self::ContextAwareRag => "/call",
        }
    }

    pub fn is_streaming(self) -> bool {
        matches!(self, Self::GenerateStream | Self::ChatStream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// The normalized inbound request body from the chat client.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Extra chat parameters, either a JSON object string or
    /// comma-separated `key=value` pairs.
    #[serde(default)]
    pub optional_params: Option<String>,
    #[serde(default = "default_true")]
    pub show_intermediate_steps: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("conversation must end with a user message")]
    NoUserMessage,
    #[error("backend initialization failed: {0}")]
    InitializationFailed(String),
}

/// Shared builder precondition: a non-empty history ending in a user turn.
/// Anything else is a contract violation, not something to paper over.
pub fn last_user_message(messages: &[ChatMessage]) -> Result<&ChatMessage, BuildError> {
    match messages.last() {
        Some(message) if message.role == Role::User => Ok(message),
        _ => Err(BuildError::NoUserMessage),
    }
}

/// Builds the backend-specific request body for a protocol. The RAG builder
/// may issue a one-time initialization call, hence async and state access.
pub async fn build_payload(
    protocol: BackendProtocol,
    request: &GatewayRequest,
    state: &AppState,
) -> Result<Value, BuildError> {
    match protocol {
        BackendProtocol::Generate | BackendProtocol::GenerateStream => {
            generate::build_payload(&request.messages)
        }
        BackendProtocol::Chat | BackendProtocol::ChatStream => chat::build_payload(
            &request.messages,
            request.optional_params.as_deref(),
            protocol.is_streaming(),
            &state.config,
        ),
        BackendProtocol::ContextAwareRag => rag::build_payload(request, state).await,
    }
}

/// Extracts the client-facing answer from a buffered backend body using the
/// protocol's field precedence. An unparseable body passes through raw: a
/// garbled upstream is still more useful than an error in a chat UI.
pub fn process_buffered(protocol: BackendProtocol, body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    let extracted = match protocol {
        BackendProtocol::Generate | BackendProtocol::GenerateStream => {
            generate::extract_buffered(&parsed)
        }
        BackendProtocol::Chat | BackendProtocol::ChatStream => chat::extract_buffered(&parsed),
        BackendProtocol::ContextAwareRag => rag::extract_buffered(&parsed),
    };
    match extracted {
        Some(value) => value_to_text(&value),
        None => body.to_string(),
    }
}

/// String values pass through as-is; anything else is re-serialized as JSON
/// text before it is written to the client.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_path_round_trip() {
        for protocol in [
            BackendProtocol::Generate,
            BackendProtocol::GenerateStream,
            BackendProtocol::Chat,
            BackendProtocol::ChatStream,
            BackendProtocol::ContextAwareRag,
        ] {
            assert_eq!(
                BackendProtocol::from_backend_path(protocol.backend_path()),
                Some(protocol)
            );
        }
        assert_eq!(BackendProtocol::from_backend_path("/admin"), None);
        assert_eq!(BackendProtocol::from_backend_path("/chat/stream/extra"), None);
    }

    #[test]
    fn test_last_user_message_contract() {
        let messages = vec![
            ChatMessage { role: Role::System, content: "be brief".into() },
            ChatMessage { role: Role::User, content: "hi".into() },
        ];
        assert_eq!(last_user_message(&messages).unwrap().content, "hi");

        let trailing_assistant = vec![
            ChatMessage { role: Role::User, content: "hi".into() },
            ChatMessage { role: Role::Assistant, content: "hello".into() },
        ];
        assert!(matches!(
            last_user_message(&trailing_assistant),
            Err(BuildError::NoUserMessage)
        ));
        assert!(matches!(last_user_message(&[]), Err(BuildError::NoUserMessage)));
    }

    #[test]
    fn test_buffered_raw_passthrough_for_non_json() {
        assert_eq!(
            process_buffered(BackendProtocol::Generate, "plain text answer"),
            "plain text answer"
        );
    }

    #[test]
    fn test_value_to_text_reserializes_non_strings() {
        assert_eq!(value_to_text(&serde_json::json!("hi")), "hi");
        assert_eq!(value_to_text(&serde_json::json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(value_to_text(&serde_json::json!(42)), "42");
    }
}
