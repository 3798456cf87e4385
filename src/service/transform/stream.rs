use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::utils::lines::LineBuffer;

use super::{chat, generate, value_to_text, BackendProtocol};

const DATA_PREFIX: &str = "data: ";
const INTERMEDIATE_PREFIX: &str = "intermediate_data: ";
const FINAL_ANSWER_PREFIX: &str = "final_answer: ";
const DONE_SENTINEL: &str = "[DONE]";
const STEP_OPEN: &str = "<intermediatestep>";
const STEP_CLOSE: &str = "</intermediatestep>";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IntermediateStepContent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub payload: String,
}

/// A backend telemetry event re-framed for the client. Every field the
/// backend omits defaults to empty; `index` is assigned locally per stream
/// and is never taken from the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IntermediateStepFrame {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: String,
    #[serde(rename = "type", default = "intermediate_type")]
    pub step_type: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub intermediate_parent_id: String,
    #[serde(default)]
    pub content: IntermediateStepContent,
    #[serde(default)]
    pub time_stamp: String,
    #[serde(default)]
    pub index: u64,
}

fn intermediate_type() -> String {
    "system_intermediate".to_string()
}

impl IntermediateStepFrame {
    /// Serialized inline as a framing marker the chat UI re-parses. Not
    /// HTML, despite the angle brackets.
    pub fn to_marker(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{STEP_OPEN}{json}{STEP_CLOSE}")
    }
}

/// Incrementally translates one backend stream into client text chunks.
///
/// Fed arbitrary byte chunks, it reassembles complete lines, classifies
/// them, and emits the pieces the client should see, in backend order. The
/// stream is finite: a `data: [DONE]` sentinel stops all further output.
#[derive(Debug)]
pub struct StreamTransformer {
    protocol: BackendProtocol,
    show_intermediate_steps: bool,
    lines: LineBuffer,
    next_index: u64,
    final_answer_emitted: bool,
    done: bool,
}

impl StreamTransformer {
    pub fn new(protocol: BackendProtocol, show_intermediate_steps: bool) -> Self {
        Self {
            protocol,
            show_intermediate_steps,
            lines: LineBuffer::new(),
            next_index: 0,
            final_answer_emitted: false,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one chunk from the backend; returns the client-facing outputs
    /// completed by it, in order.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        let lines = self.lines.push(chunk);
        lines
            .iter()
            .filter_map(|line| self.process_line(line))
            .collect()
    }

    /// Flush the unterminated tail once the backend stream ends.
    pub fn finish(&mut self) -> Vec<String> {
        match self.lines.finish() {
            Some(tail) => self.process_line(&tail).into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if self.done || line.is_empty() {
            return None;
        }

        if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
            if rest.trim() == DONE_SENTINEL {
                self.done = true;
                return None;
            }
            return match serde_json::from_str::<Value>(rest) {
                Ok(parsed) => self.extract_delta(&parsed).map(|v| value_to_text(&v)),
                Err(_) => {
                    // Malformed upstream frames must not abort the stream.
                    debug!("skipping unparseable data line");
                    None
                }
            };
        }

        if let Some(rest) = line.strip_prefix(INTERMEDIATE_PREFIX) {
            return match serde_json::from_str::<IntermediateStepFrame>(rest) {
                Ok(mut frame) => {
                    frame.index = self.next_index;
                    self.next_index += 1;
                    if frame.time_stamp.is_empty() {
                        frame.time_stamp = chrono::Utc::now().to_rfc3339();
                    }
                    Some(frame.to_marker())
                }
                Err(_) => {
                    debug!("skipping unparseable intermediate_data line");
                    None
                }
            };
        }

        if self.protocol == BackendProtocol::GenerateStream {
            if let Some(rest) = line.strip_prefix(FINAL_ANSWER_PREFIX) {
                if self.final_answer_emitted {
                    return None;
                }
                self.final_answer_emitted = true;
                return match serde_json::from_str::<Value>(rest) {
                    Ok(parsed) => generate::extract_buffered(&parsed)
                        .map(|v| value_to_text(&v))
                        .or_else(|| Some(rest.to_string())),
                    Err(_) => Some(rest.to_string()),
                };
            }
        }

        if contains_step_marker(line) {
            return self.show_intermediate_steps.then(|| line.to_string());
        }

        None
    }

    fn extract_delta(&self, parsed: &Value) -> Option<Value> {
        match self.protocol {
            BackendProtocol::Generate | BackendProtocol::GenerateStream => {
                generate::extract_stream(parsed)
            }
            BackendProtocol::Chat | BackendProtocol::ChatStream => chat::extract_stream(parsed),
            // RAG has no streaming variant; treat like a flat answer line.
            BackendProtocol::ContextAwareRag => super::rag::extract_buffered(parsed),
        }
    }
}

fn contains_step_marker(line: &str) -> bool {
    match (line.find(STEP_OPEN), line.rfind(STEP_CLOSE)) {
        (Some(open), Some(close)) => open + STEP_OPEN.len() <= close,
        _ => false,
    }
}
