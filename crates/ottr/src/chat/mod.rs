//! Chat platform collaborator seam.
//!
//! The bridge never talks to a chat platform directly; it delivers typed
//! outbound events through an injected [`ChatPort`] and receives
//! [`InboundMessage`]s from whatever owns the platform connection. Tests
//! inject recording ports; `ottr serve` uses the terminal port.

mod terminal;

pub use terminal::TerminalChatPort;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// One user message routed to one conversation.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Stable identifier for the chat thread this message belongs to.
    pub conversation_key: String,
    pub text: String,
    /// File attachments already fetched by the platform side; their text is
    /// appended inline to the prompt.
    pub attachments: Vec<Attachment>,
    /// Platform reference to the originating message, echoed back on the
    /// turn's completion so the platform can acknowledge it.
    pub origin: Option<String>,
}

impl InboundMessage {
    pub fn new(conversation_key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_key: conversation_key.into(),
            text: text.into(),
            attachments: Vec::new(),
            origin: None,
        }
    }

    /// The prompt actually sent to the agent: the message text with any
    /// attachment contents appended inline.
    pub fn prompt_text(&self) -> String {
        if self.attachments.is_empty() {
            return self.text.clone();
        }
        let mut prompt = self.text.clone();
        for attachment in &self.attachments {
            prompt.push_str("\n\n--- attachment: ");
            prompt.push_str(&attachment.name);
            prompt.push_str(" ---\n");
            prompt.push_str(&attachment.text);
        }
        prompt
    }
}

/// Text content of one inbound file attachment.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub text: String,
}

/// Outbound seam to the chat platform.
///
/// Implementations own rendering, threading, and delivery; the bridge only
/// distinguishes the event kinds. Delivery failures are returned so the
/// manager can log them, but they never affect session state.
#[async_trait]
pub trait ChatPort: Send + Sync {
    /// The agent is asking the user something; deliver with low latency.
    async fn post_question(&self, conversation_key: &str, text: &str) -> anyhow::Result<()>;

    /// One turn finished; `origin` references the inbound message being
    /// answered, `success` distinguishes failed turns for styling.
    async fn post_completion(
        &self,
        conversation_key: &str,
        origin: Option<&str>,
        text: &str,
        success: bool,
    ) -> anyhow::Result<()>;

    /// The agent invoked a tool; a short notice, not debounced.
    async fn post_tool_notice(
        &self,
        conversation_key: &str,
        tool: &str,
        input: &Value,
    ) -> anyhow::Result<()>;

    /// Informational notice (e.g. a message arrived while a turn was still
    /// running).
    async fn post_notice(&self, conversation_key: &str, text: &str) -> anyhow::Result<()>;

    /// The agent process died and will not be restarted automatically.
    async fn post_fatal(&self, conversation_key: &str, detail: &str) -> anyhow::Result<()>;

    /// Present a multiple-choice prompt and wait up to `timeout` for a
    /// selection. `None` means timeout or an other/free-text choice with no
    /// input; the manager substitutes the fallback answer.
    async fn ask_choice(
        &self,
        conversation_key: &str,
        question: &str,
        options: &[String],
        timeout: Duration,
    ) -> anyhow::Result<Option<String>>;
}
