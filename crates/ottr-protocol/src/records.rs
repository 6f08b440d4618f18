//! Protocol record types.
//!
//! One JSON object per line, discriminated by a `type` field. Inbound records
//! come from the agent's stdout; the only outbound record is [`UserRecord`],
//! written to its stdin.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session id used before the agent has assigned a real one.
pub const SESSION_ID_PLACEHOLDER: &str = "default";

/// A record received from the agent, discriminated by `type`.
///
/// Record types this bridge does not consume decode to [`AgentRecord::Unknown`]
/// rather than failing, so protocol additions upstream stay harmless.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRecord {
    /// Informational/init record; may carry the agent-assigned session id.
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// One or more content blocks produced during a turn.
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Terminal record for one turn.
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Any record type this bridge does not consume.
    #[serde(other)]
    Unknown,
}

impl AgentRecord {
    /// The `session_id` carried by this record, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            AgentRecord::System { session_id, .. }
            | AgentRecord::Assistant { session_id, .. }
            | AgentRecord::Result { session_id, .. } => session_id.as_deref(),
            AgentRecord::Unknown => None,
        }
    }
}

/// The `message` payload of an `assistant` record.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// One content block inside an assistant message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// Block types this bridge does not consume (e.g. thinking).
    #[serde(other)]
    Unknown,
}

/// Parse one line into a record.
///
/// Returns `None` for anything that is not a protocol record: the subprocess
/// may interleave plain diagnostic text with its output, and such lines are
/// skipped, not treated as errors.
pub fn decode_line(line: &str) -> Option<AgentRecord> {
    serde_json::from_str(line).ok()
}

/// The outbound input record wrapping one user turn.
///
/// Serializes to
/// `{"type":"user","message":{"role":"user","content":...},"session_id":...,
/// "parent_tool_use_id":null}`.
#[derive(Debug, Clone, Serialize)]
pub struct UserRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: UserMessage<'a>,
    session_id: &'a str,
    parent_tool_use_id: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> UserRecord<'a> {
    pub fn new(content: &'a str, session_id: &'a str) -> Self {
        Self {
            kind: "user",
            message: UserMessage {
                role: "user",
                content,
            },
            session_id,
            parent_tool_use_id: None,
        }
    }
}
