//! Streaming Messages-API client.
//!
//! The completion endpoint streams server-sent events; this module turns the
//! byte stream into a lazy sequence of typed [`StreamEvent`]s driven by one
//! consumer. Text deltas surface as they arrive, tool-call arguments are
//! assembled from partial-JSON deltas, and the fully accumulated assistant
//! message is yielded once at the end.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use deskconf::AgentConfig;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("completion request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("completion endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed stream event: {0}")]
    Malformed(String),

    #[error("provider reported a stream error: {0}")]
    Provider(String),

    #[error("stream ended before the message completed")]
    Truncated,

    #[error("missing API key: set {0}")]
    MissingKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One content block of a chat message, mirroring the provider's wire shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Tool results travel back to the model as a single user-role turn.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: results,
        }
    }

    /// The tool_use blocks of this message, in order.
    pub fn tool_uses(&self) -> Vec<(String, String, Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

/// A tool declaration for the completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Client for the streaming completion endpoint.
pub struct ClaudeClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ClaudeClient {
    /// Build a client from config; the API key comes from the configured
    /// environment variable, never from a config file.
    pub fn from_config(config: &AgentConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| LlmError::MissingKey(config.api_key_env.clone()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    /// Open one streaming completion. Dropping the returned stream cancels
    /// the request.
    pub async fn stream_message(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<MessageStream, LlmError> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": messages,
            "tools": tools,
            "stream": true,
        });

        let response = self
            .http
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(MessageStream::new(
            response.bytes_stream().map(|r| r.map_err(LlmError::from)),
        ))
    }
}

/// One event from the lazy completion stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text token delta, in arrival order.
    TextDelta(String),
    /// The fully accumulated assistant message; always the last event.
    Completed(ChatMessage),
}

enum CurrentBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
}

/// Incremental SSE parser over the response body.
pub struct MessageStream {
    source: Pin<Box<dyn Stream<Item = Result<Bytes, LlmError>> + Send>>,
    buf: String,
    ready: VecDeque<StreamEvent>,
    blocks: Vec<ContentBlock>,
    current: Option<CurrentBlock>,
    done: bool,
}

impl MessageStream {
    pub fn new(source: impl Stream<Item = Result<Bytes, LlmError>> + Send + 'static) -> Self {
        Self {
            source: Box::pin(source),
            buf: String::new(),
            ready: VecDeque::new(),
            blocks: Vec::new(),
            current: None,
            done: false,
        }
    }

    /// Next stream event. `Ok(None)` after the completed message has been
    /// yielded; `Err(Truncated)` if the body ends early.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, LlmError> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }
            if self.done {
                return Ok(None);
            }

            match self.source.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    self.buf.push_str(&String::from_utf8_lossy(&chunk));
                    self.drain_frames()?;
                }
                None => return Err(LlmError::Truncated),
            }
        }
    }

    /// Parse every complete `\n\n`-delimited SSE frame in the buffer.
    fn drain_frames(&mut self) -> Result<(), LlmError> {
        while let Some(pos) = self.buf.find("\n\n") {
            let frame: String = self.buf.drain(..pos + 2).collect();
            let mut event_name = "";
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event_name = rest.trim();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data.push_str(rest.trim_start());
                }
            }
            if !event_name.is_empty() || !data.is_empty() {
                self.handle_frame(event_name, &data)?;
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, event_name: &str, data: &str) -> Result<(), LlmError> {
        match event_name {
            "ping" | "message_start" | "message_delta" => Ok(()),

            "content_block_start" => {
                let value: Value = parse_data(data)?;
                let block = &value["content_block"];
                match block["type"].as_str() {
                    Some("text") => {
                        self.current = Some(CurrentBlock::Text(
                            block["text"].as_str().unwrap_or_default().to_string(),
                        ));
                        Ok(())
                    }
                    Some("tool_use") => {
                        let id = str_field(block, "id")?;
                        let name = str_field(block, "name")?;
                        self.current = Some(CurrentBlock::ToolUse {
                            id,
                            name,
                            json: String::new(),
                        });
                        Ok(())
                    }
                    other => Err(LlmError::Malformed(format!(
                        "unknown content block type {:?}",
                        other
                    ))),
                }
            }

            "content_block_delta" => {
                let value: Value = parse_data(data)?;
                let delta = &value["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default().to_string();
                        if let Some(CurrentBlock::Text(buf)) = &mut self.current {
                            buf.push_str(&text);
                        }
                        self.ready.push_back(StreamEvent::TextDelta(text));
                        Ok(())
                    }
                    Some("input_json_delta") => {
                        if let Some(CurrentBlock::ToolUse { json, .. }) = &mut self.current {
                            json.push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                        Ok(())
                    }
                    other => {
                        debug!("ignoring delta type {:?}", other);
                        Ok(())
                    }
                }
            }

            "content_block_stop" => {
                match self.current.take() {
                    Some(CurrentBlock::Text(text)) => {
                        self.blocks.push(ContentBlock::Text { text });
                    }
                    Some(CurrentBlock::ToolUse { id, name, json }) => {
                        let input: Value = if json.trim().is_empty() {
                            json!({})
                        } else {
                            serde_json::from_str(&json).map_err(|e| {
                                LlmError::Malformed(format!(
                                    "tool input for {} is not valid JSON: {}",
                                    name, e
                                ))
                            })?
                        };
                        self.blocks.push(ContentBlock::ToolUse { id, name, input });
                    }
                    None => {}
                }
                Ok(())
            }

            "message_stop" => {
                let message = ChatMessage {
                    role: Role::Assistant,
                    content: std::mem::take(&mut self.blocks),
                };
                self.ready.push_back(StreamEvent::Completed(message));
                self.done = true;
                Ok(())
            }

            "error" => {
                let value: Value = parse_data(data)?;
                let message = value["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown provider error")
                    .to_string();
                Err(LlmError::Provider(message))
            }

            other => {
                debug!("ignoring stream event {:?}", other);
                Ok(())
            }
        }
    }
}

fn parse_data(data: &str) -> Result<Value, LlmError> {
    serde_json::from_str(data).map_err(|e| LlmError::Malformed(format!("bad event data: {}", e)))
}

fn str_field(value: &Value, field: &str) -> Result<String, LlmError> {
    value[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| LlmError::Malformed(format!("missing field {}", field)))
}
