use serde_json::{json, Value};

use super::{last_user_message, BuildError, ChatMessage};

/// The generate backend is stateless and single-turn: only the last user
/// message is sent, never the history.
pub fn build_payload(messages: &[ChatMessage]) -> Result<Value, BuildError> {
    let last = last_user_message(messages)?;
    Ok(json!({ "input_message": last.content }))
}

/// Buffered extraction precedence: `value`, `output`, `answer`, then the
/// OpenAI-compatible completion shape.
pub fn extract_buffered(parsed: &Value) -> Option<Value> {
    parsed
        .get("value")
        .or_else(|| parsed.get("output"))
        .or_else(|| parsed.get("answer"))
        .or_else(|| {
            parsed
                .pointer("/choices/0/message/content")
        })
        .cloned()
}

/// Streaming extraction: same field precedence, but deltas instead of full
/// messages for the OpenAI-compatible shape.
pub fn extract_stream(parsed: &Value) -> Option<Value> {
    parsed
        .get("value")
        .or_else(|| parsed.get("output"))
        .or_else(|| parsed.get("answer"))
        .or_else(|| parsed.pointer("/choices/0/delta/content"))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::transform::Role;
    use serde_json::json;

    #[test]
    fn test_payload_uses_last_user_message_only() {
        let messages = vec![
            ChatMessage { role: Role::User, content: "first".into() },
            ChatMessage { role: Role::Assistant, content: "reply".into() },
            ChatMessage { role: Role::User, content: "How are you?".into() },
        ];
        let payload = build_payload(&messages).unwrap();
        assert_eq!(payload, json!({ "input_message": "How are you?" }));
    }

    #[test]
    fn test_payload_rejects_trailing_assistant() {
        let messages = vec![ChatMessage { role: Role::Assistant, content: "hi".into() }];
        assert!(matches!(
            build_payload(&messages),
            Err(BuildError::NoUserMessage)
        ));
    }

    #[test]
    fn test_extraction_precedence() {
        let all = json!({"value": "A", "output": "B", "answer": "C"});
        assert_eq!(extract_buffered(&all), Some(json!("A")));

        let no_value = json!({"output": "B", "answer": "C"});
        assert_eq!(extract_buffered(&no_value), Some(json!("B")));

        let answer_only = json!({"answer": "C"});
        assert_eq!(extract_buffered(&answer_only), Some(json!("C")));

        let openai_shape = json!({"choices": [{"message": {"content": "D"}}]});
        assert_eq!(extract_buffered(&openai_shape), Some(json!("D")));

        assert_eq!(extract_buffered(&json!({"unrelated": 1})), None);
    }

    #[test]
    fn test_stream_extraction_uses_delta() {
        let delta = json!({"choices": [{"delta": {"content": "partial"}}]});
        assert_eq!(extract_stream(&delta), Some(json!("partial")));
        assert_eq!(extract_stream(&json!({"value": "v"})), Some(json!("v")));
    }
}
