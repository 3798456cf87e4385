use serde_json::{json, Map, Value};

use crate::config::GatewayConfig;

use super::{last_user_message, BuildError, ChatMessage};

/// OpenAI-style chat completion payload. Depending on config the backend
/// receives the full history or only the final user turn. Caller-supplied
/// optional params are shallow-merged last so they can override `model`,
/// `temperature` and friends.
pub fn build_payload(
    messages: &[ChatMessage],
    optional_params: Option<&str>,
    stream: bool,
    config: &GatewayConfig,
) -> Result<Value, BuildError> {
    let last = last_user_message(messages)?;

    let outbound_messages = if config.send_full_history {
        serde_json::to_value(messages).unwrap_or_else(|_| json!([]))
    } else {
        json!([{ "role": "user", "content": last.content }])
    };

    let mut payload = json!({
        "messages": outbound_messages,
        "model": config.chat_model,
        "stream": stream,
        "temperature": 0.7,
    });

    if let Some(params) = optional_params {
        let base = payload.as_object_mut().expect("payload is an object");
        for (key, value) in parse_optional_params(params) {
            base.insert(key, value);
        }
    }

    Ok(payload)
}

/// Parses caller-supplied parameter overrides. A JSON object string is taken
/// as-is; otherwise the string is read as comma-separated `key=value` pairs
/// with best-effort coercion: booleans, then numbers, then strings.
pub fn parse_optional_params(params: &str) -> Map<String, Value> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(params) {
        return map;
    }

    let mut map = Map::new();
    for pair in params.split(',') {
        let Some((key, raw)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let raw = raw.trim();
        if key.is_empty() {
            continue;
        }
        map.insert(key.to_string(), coerce_value(raw));
    }
    map
}

fn coerce_value(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(n) = raw.parse::<i64>() {
                Value::from(n)
            } else if let Ok(f) = raw.parse::<f64>() {
                Value::from(f)
            } else {
                Value::String(raw.to_string())
            }
        }
    }
}

/// Buffered extraction: the OpenAI completion shape first, then the looser
/// fallbacks some backends use, then the whole object (re-serialized by the
/// caller) so the user at least sees what came back.
pub fn extract_buffered(parsed: &Value) -> Option<Value> {
    parsed
        .pointer("/choices/0/message/content")
        .or_else(|| parsed.pointer("/choices/0/delta/content"))
        .or_else(|| parsed.get("message"))
        .or_else(|| parsed.get("answer"))
        .or_else(|| parsed.get("value"))
        .cloned()
        .or_else(|| Some(parsed.clone()))
}

pub fn extract_stream(parsed: &Value) -> Option<Value> {
    parsed
        .pointer("/choices/0/delta/content")
        .or_else(|| parsed.pointer("/choices/0/message/content"))
        .cloned()
}
