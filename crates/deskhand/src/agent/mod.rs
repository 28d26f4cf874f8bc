//! The multi-turn tool loop driving one chat turn against the DAW.

pub mod claude;
pub mod tools;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use deskconf::AgentConfig;
use liveosc::LiveBridge;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::{PendingToolCall, SessionEvent};
use crate::sessions::SessionState;
use claude::{ChatMessage, ClaudeClient, ContentBlock, LlmError, StreamEvent, ToolSpec};
use tools::ToolExecutor;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a mixing assistant attached to a live DAW \
session. You can inspect the mixer with enumerate_mixer and get_device_parameters, and change \
it with set_device_parameter. Parameter values are in the DAW's native units; always check a \
parameter's min and max before setting it. Be concise, and confirm what you changed.";

/// Drives chat turns for every session. Stateless between turns; all
/// per-session state lives on [`SessionState`].
pub struct AgentLoop {
    client: ClaudeClient,
    bridge: Arc<LiveBridge>,
    system_prompt: String,
    tools: Vec<ToolSpec>,
}

impl AgentLoop {
    pub fn new(config: &AgentConfig, bridge: Arc<LiveBridge>) -> Result<Self, LlmError> {
        let system_prompt = if config.system_prompt.is_empty() {
            DEFAULT_SYSTEM_PROMPT.to_string()
        } else {
            config.system_prompt.clone()
        };
        Ok(Self {
            client: ClaudeClient::from_config(config)?,
            bridge,
            system_prompt,
            tools: tools::catalog(),
        })
    }

    /// Run one user turn: stream completions, execute tool calls, repeat
    /// until the assistant answers without tools. Cancelling the token (the
    /// client went away) aborts the in-flight completion and stops before
    /// any further tool executes.
    pub async fn run_turn(
        &self,
        session: Arc<SessionState>,
        message: String,
        cancel: CancellationToken,
    ) {
        // One turn at a time per session; later messages queue here.
        let _turn = tokio::select! {
            guard = session.turn_lock.lock() => guard,
            _ = cancel.cancelled() => return,
        };

        info!("session {}: user turn ({} chars)", session.id, message.len());
        session
            .history
            .lock()
            .await
            .push(ChatMessage::user_text(message));

        let executor = ToolExecutor::new(self.bridge.clone(), session.clone());

        loop {
            let messages = session.history.lock().await.clone();
            let opened = tokio::select! {
                opened = self.client.stream_message(&self.system_prompt, &messages, &self.tools) => opened,
                _ = cancel.cancelled() => return,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    session.emit(SessionEvent::Error {
                        message: e.to_string(),
                    });
                    return;
                }
            };

            let assistant = loop {
                let event = tokio::select! {
                    event = stream.next_event() => event,
                    _ = cancel.cancelled() => return,
                };
                match event {
                    Ok(Some(StreamEvent::TextDelta(text))) => {
                        session.emit(SessionEvent::Text { content: text });
                    }
                    Ok(Some(StreamEvent::Completed(message))) => break message,
                    Ok(None) => {
                        session.emit(SessionEvent::Error {
                            message: "stream ended without a completed message".to_string(),
                        });
                        return;
                    }
                    Err(e) => {
                        session.emit(SessionEvent::Error {
                            message: e.to_string(),
                        });
                        return;
                    }
                }
            };

            session.history.lock().await.push(assistant.clone());
            session.emit(SessionEvent::EndMessage);

            let tool_uses = assistant.tool_uses();
            if tool_uses.is_empty() {
                return;
            }
            debug!("session {}: {} tool calls", session.id, tool_uses.len());

            // Mutating calls gate on explicit approval; one payload may cover
            // all of them for this turn.
            let mutating: Vec<_> = tool_uses
                .iter()
                .filter(|(_, name, _)| tools::is_mutating(name))
                .collect();
            let mut decisions: HashMap<String, bool> = HashMap::new();
            if !mutating.is_empty() {
                let (tx, rx) = oneshot::channel();
                let ids: HashSet<String> = mutating.iter().map(|(id, _, _)| id.clone()).collect();
                session.set_pending_approval(ids, tx);
                session.emit(SessionEvent::ApprovalRequired {
                    requests: mutating
                        .iter()
                        .map(|(id, name, arguments)| PendingToolCall {
                            tool_call_id: id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                        })
                        .collect(),
                });
                decisions = tokio::select! {
                    decisions = rx => decisions.unwrap_or_default(),
                    _ = cancel.cancelled() => {
                        session.clear_pending_approval();
                        return;
                    }
                };
            }

            let mut results = Vec::with_capacity(tool_uses.len());
            for (id, name, arguments) in &tool_uses {
                let denied =
                    tools::is_mutating(name) && !decisions.get(id).copied().unwrap_or(false);
                let (content, is_error) = if denied {
                    ("denied by user".to_string(), false)
                } else {
                    match executor.execute(name, arguments).await {
                        Ok(content) => (content, false),
                        Err(error) => (error, true),
                    }
                };

                session.emit(SessionEvent::FunctionCall {
                    tool_call_id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                });
                session.emit(SessionEvent::FunctionResult {
                    tool_call_id: id.clone(),
                    content: content.clone(),
                    is_error: is_error.then_some(true),
                });
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content,
                    is_error,
                });
            }

            session
                .history
                .lock()
                .await
                .push(ChatMessage::tool_results(results));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_mentions_every_tool() {
        for tool in [
            tools::TOOL_ENUMERATE_MIXER,
            tools::TOOL_GET_DEVICE_PARAMETERS,
            tools::TOOL_SET_DEVICE_PARAMETER,
        ] {
            assert!(DEFAULT_SYSTEM_PROMPT.contains(tool));
        }
    }
}
