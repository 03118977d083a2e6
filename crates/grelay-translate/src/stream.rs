//! Incremental extraction of JSON objects from an upstream byte stream and
//! their translation into OpenAI stream chunks.
//!
//! Gemini streams either a bare concatenation of JSON objects or a JSON
//! array of them, with no guarantee of newline separation, so framing is
//! done by brace counting rather than any line-based parser.

use serde_json::{Value as JsonValue, json};
use tracing::debug;

use grelay_protocol::gemini::generate_content::GenerateContentResponse;
use grelay_protocol::openai::chat::{
    CHAT_COMPLETION_CHUNK_OBJECT, ChatCompletionChunk, ChunkChoice, ChunkDelta, FinishReason,
    FunctionCallChunk, ToolCallChunk,
};

use crate::ids::{completion_id, now_epoch_seconds, tool_call_id};
use crate::response::map_finish_reason;

/// Extracts complete top-level JSON objects from a chunked byte stream.
///
/// Braces inside quoted strings are honored; array delimiters and other
/// bytes between objects are skipped. Progress is byte-by-byte, so an
/// object is emitted as soon as its closing brace arrives.
#[derive(Debug, Default)]
pub struct JsonObjectDecoder {
    pending: Vec<u8>,
    current: String,
    depth: usize,
    in_string: bool,
    escape: bool,
}

impl JsonObjectDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // Chunk boundaries may split multi-byte characters; carry the
        // incomplete suffix over to the next push.
        self.pending.extend_from_slice(chunk);
        let valid_len = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(err) => err.valid_up_to(),
        };
        let text: String = String::from_utf8_lossy(&self.pending[..valid_len]).into_owned();
        self.pending.drain(..valid_len);
        self.push_str(&text)
    }

    pub fn push_str(&mut self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for ch in text.chars() {
            if self.depth == 0 {
                // Between objects: only an opening brace matters; array
                // delimiters, commas and whitespace are skipped.
                if ch == '{' {
                    self.depth = 1;
                    self.current.push(ch);
                }
                continue;
            }

            self.current.push(ch);
            if self.in_string {
                if self.escape {
                    self.escape = false;
                } else if ch == '\\' {
                    self.escape = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
                continue;
            }

            match ch {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        out.push(std::mem::take(&mut self.current));
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Flush at end of stream. A malformed residual tail is discarded.
    pub fn finish(&mut self) -> Vec<String> {
        if !self.current.is_empty() || !self.pending.is_empty() {
            debug!(
                residual = self.current.len() + self.pending.len(),
                "discarding incomplete stream tail"
            );
            self.current.clear();
            self.pending.clear();
        }
        self.depth = 0;
        self.in_string = false;
        self.escape = false;
        Vec::new()
    }
}

/// One translated unit of the outgoing SSE stream. The `[DONE]` terminator
/// is appended by the response writer, never by the translator.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Chunk(Box<ChatCompletionChunk>),
    /// Already OpenAI-shaped payloads forwarded verbatim.
    Passthrough(String),
}

#[derive(Debug)]
pub struct StreamTranslator {
    id: String,
    model: String,
    created: i64,
    tool_index: i64,
}

impl StreamTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            model: model.into(),
            created: now_epoch_seconds(),
            tool_index: 0,
        }
    }

    pub fn translate_record(&mut self, record: &str) -> Vec<StreamFrame> {
        match serde_json::from_str::<JsonValue>(record) {
            Ok(value) => self.translate_value(&value),
            Err(err) => {
                debug!(error = %err, "dropping undecodable stream record");
                Vec::new()
            }
        }
    }

    pub fn translate_value(&mut self, value: &JsonValue) -> Vec<StreamFrame> {
        if let Some(items) = value.as_array() {
            return items
                .iter()
                .flat_map(|item| self.translate_value(item))
                .collect();
        }

        if value.get("candidates").is_some() {
            return match serde_json::from_value::<GenerateContentResponse>(value.clone()) {
                Ok(response) => self.translate_response(&response),
                Err(err) => {
                    debug!(error = %err, "dropping malformed upstream chunk");
                    Vec::new()
                }
            };
        }

        if value.get("done").and_then(JsonValue::as_bool) == Some(true) {
            // Backend-internal end-of-stream marker; the writer emits [DONE].
            return Vec::new();
        }

        if let Some(object) = value.as_object()
            && object.len() == 1
            && object.get("text").is_some_and(JsonValue::is_string)
        {
            let wrapped = json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": object["text"]}]}
                }]
            });
            return self.translate_value(&wrapped);
        }

        vec![StreamFrame::Passthrough(value.to_string())]
    }

    fn translate_response(&mut self, response: &GenerateContentResponse) -> Vec<StreamFrame> {
        let Some(candidate) = response.candidates.first() else {
            return Vec::new();
        };

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        if let Some(parts) = candidate.content.as_ref().map(|content| &content.parts) {
            for part in parts {
                if let Some(text) = &part.text {
                    content.push_str(text);
                }
                if let Some(call) = &part.function_call {
                    let index = self.tool_index;
                    self.tool_index += 1;
                    let arguments = call
                        .args
                        .as_ref()
                        .map(|args| args.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    tool_calls.push(ToolCallChunk {
                        index,
                        id: Some(tool_call_id(&call.name, index as usize)),
                        kind: Some("function".to_string()),
                        function: Some(FunctionCallChunk {
                            name: Some(call.name.clone()),
                            arguments: Some(arguments),
                        }),
                    });
                }
            }
        }

        let mut finish_reason = candidate.finish_reason.as_deref().and_then(map_finish_reason);
        if !tool_calls.is_empty()
            && !matches!(finish_reason, Some(FinishReason::Stop | FinishReason::Length))
        {
            finish_reason = Some(FinishReason::ToolCalls);
        }

        let has_payload = !content.is_empty() || !tool_calls.is_empty();
        let delta = ChunkDelta {
            role: has_payload.then(|| "assistant".to_string()),
            content: if content.is_empty() {
                None
            } else {
                Some(content)
            },
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        };

        if delta.is_empty() && finish_reason.is_none() {
            return Vec::new();
        }

        vec![StreamFrame::Chunk(Box::new(ChatCompletionChunk {
            id: self.id.clone(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: candidate.index.map(|value| value as i64).unwrap_or(0),
                delta,
                finish_reason,
            }],
        }))]
    }
}
