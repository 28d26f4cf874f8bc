//! Session event stream: every outbound frame the client can receive.
//!
//! The `kind` spellings and field names are the wire contract with existing
//! clients; tool and parameter fields are snake_case throughout.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::observer::ParameterChange;

/// Fan-in capacity per session. Slow clients lag rather than block producers.
pub const EVENT_CAPACITY: usize = 256;

/// A tool call waiting on a human yes/no.
#[derive(Debug, Clone, Serialize)]
pub struct PendingToolCall {
    pub tool_call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Everything that can flow out on the client channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    /// One token delta from the agent.
    Text { content: String },

    /// The agent invoked a tool.
    FunctionCall {
        tool_call_id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// Result (or error text) of a tool invocation.
    FunctionResult {
        tool_call_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    /// Terminator for one complete assistant message.
    EndMessage,

    /// A coalesced parameter change observed on the DAW.
    ParameterChange {
        #[serde(flatten)]
        change: ParameterChange,
    },

    /// Indexing lifecycle, progress 0..100 while running.
    IndexingStatus {
        is_indexing: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
    },

    /// Human-readable failure notice.
    Error { message: String },

    /// Mutating tool calls awaiting approval decisions.
    ApprovalRequired { requests: Vec<PendingToolCall> },
}

/// Create a per-session event channel.
pub fn channel() -> broadcast::Sender<SessionEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}
