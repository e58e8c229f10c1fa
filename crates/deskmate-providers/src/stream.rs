//! Line-delimited model output: byte chunks in, semantic events out.
//!
//! Ollama streams one JSON record per line, but the transport cuts the body wherever it likes,
//! including in the middle of a record or of a multi-byte character. [`ChunkReassembler`]
//! buffers raw bytes and only hands out complete lines; [`decode_line`] turns one line into
//! events; [`model_event_stream`] glues both onto a byte stream.

use std::pin::Pin;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use deskmate_types::{NativeToolCall, TokenUsage};

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    ContentFragment(String),
    NativeToolCall(NativeToolCall),
    Done {
        reason: String,
        usage: Option<TokenUsage>,
    },
    UpstreamError(String),
}

pub type ModelEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<ModelEvent>> + Send>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("blank line")]
    Blank,
    #[error("invalid model record: {0}")]
    InvalidJson(String),
    #[error("model record is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Default)]
pub struct ChunkReassembler {
    buffer: Vec<u8>,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line whose `\n` has now been seen, without the
    /// terminator. Decoding happens per complete line, so a character split across chunks is
    /// reassembled before it is decoded.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(String::from_utf8_lossy(&self.buffer[start..end]).into_owned());
            start = end + 1;
        }
        if start > 0 {
            self.buffer.drain(..start);
        }
        lines
    }

    /// Hands out the unterminated remainder once, at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

pub fn decode_line(line: &str) -> Result<Vec<ModelEvent>, DecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Blank);
    }
    let value = serde_json::from_str::<Value>(trimmed)
        .map_err(|err| DecodeError::InvalidJson(err.to_string()))?;
    let Some(record) = value.as_object() else {
        return Err(DecodeError::NotAnObject);
    };

    if let Some(error) = record.get("error") {
        let detail = error
            .as_str()
            .map(str::to_string)
            .or_else(|| {
                error
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| error.to_string());
        return Ok(vec![ModelEvent::UpstreamError(detail)]);
    }

    let mut events = Vec::new();
    let message = record.get("message");
    let native_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(native_call_from_value)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if !native_calls.is_empty() {
        events.extend(native_calls.into_iter().map(ModelEvent::NativeToolCall));
    } else if let Some(content) = message
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
    {
        if !content.trim().is_empty() {
            events.push(ModelEvent::ContentFragment(content.to_string()));
        }
    }

    if record.get("done").and_then(|v| v.as_bool()) == Some(true) {
        let reason = record
            .get("done_reason")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("stop")
            .to_string();
        events.push(ModelEvent::Done {
            reason,
            usage: extract_usage(record),
        });
    }

    Ok(events)
}

fn native_call_from_value(entry: &Value) -> Option<NativeToolCall> {
    let call = entry.get("function").unwrap_or(entry);
    let name = call.get("name").and_then(|v| v.as_str())?.trim();
    if name.is_empty() {
        return None;
    }
    Some(NativeToolCall {
        name: name.to_string(),
        arguments: call.get("arguments").cloned().unwrap_or(Value::Null),
    })
}

fn extract_usage(record: &Map<String, Value>) -> Option<TokenUsage> {
    let prompt_tokens = record.get("prompt_eval_count").and_then(|v| v.as_u64());
    let completion_tokens = record.get("eval_count").and_then(|v| v.as_u64());
    if prompt_tokens.is_none() && completion_tokens.is_none() {
        return None;
    }
    let prompt_tokens = prompt_tokens.unwrap_or(0);
    let completion_tokens = completion_tokens.unwrap_or(0);
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens.saturating_add(completion_tokens),
    })
}

fn decode_or_skip(line: &str) -> Vec<ModelEvent> {
    match decode_line(line) {
        Ok(events) => events,
        Err(DecodeError::Blank) => Vec::new(),
        Err(err) => {
            tracing::debug!(
                "skipping model line ({}): {}",
                err,
                line.chars().take(200).collect::<String>()
            );
            Vec::new()
        }
    }
}

/// Decodes a chunked NDJSON body into model events.
///
/// Malformed lines are skipped, the trailing unterminated fragment is decoded once at end of
/// stream, and transport failures or upstream `error` records end the stream with an `Err`.
pub fn model_event_stream<S, B, E>(bytes: S, cancel: CancellationToken) -> ModelEventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let stream = try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut reassembler = ChunkReassembler::new();
        loop {
            if cancel.is_cancelled() {
                yield ModelEvent::Done {
                    reason: "cancelled".to_string(),
                    usage: None,
                };
                break;
            }
            let (lines, finished) = match bytes.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    (reassembler.feed(chunk.as_ref()), false)
                }
                None => {
                    if reassembler.pending_len() > 0 {
                        tracing::debug!(
                            bytes = reassembler.pending_len(),
                            "decoding unterminated final model line"
                        );
                    }
                    (reassembler.flush().into_iter().collect::<Vec<_>>(), true)
                }
            };
            for line in lines {
                for event in decode_or_skip(&line) {
                    if let ModelEvent::UpstreamError(detail) = &event {
                        Err(anyhow::anyhow!("model stream error: {detail}"))?;
                    }
                    yield event;
                }
            }
            if finished {
                break;
            }
        }
    };
    Box::pin(stream)
}
