//! Terminal chat port for local development.
//!
//! `ottr serve` drives the bridge from stdin; this port renders outbound
//! events to stdout. A pending choice prompt claims the next input line, so
//! choices work without a second input stream.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};

use super::ChatPort;

/// Renders bridge events to the terminal and answers choice prompts from the
/// next stdin line the serve loop offers.
#[derive(Default)]
pub struct TerminalChatPort {
    pending_choice: Mutex<Option<oneshot::Sender<String>>>,
}

impl TerminalChatPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer one input line; returns true when a pending choice consumed it.
    pub async fn offer_line(&self, line: &str) -> bool {
        let mut pending = self.pending_choice.lock().await;
        if let Some(tx) = pending.take() {
            let _ = tx.send(line.to_string());
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl ChatPort for TerminalChatPort {
    async fn post_question(&self, conversation_key: &str, text: &str) -> anyhow::Result<()> {
        println!("[{conversation_key}] agent asks:\n{text}");
        Ok(())
    }

    async fn post_completion(
        &self,
        conversation_key: &str,
        _origin: Option<&str>,
        text: &str,
        success: bool,
    ) -> anyhow::Result<()> {
        let marker = if success { "done" } else { "failed" };
        println!("[{conversation_key}] {marker}:\n{text}");
        Ok(())
    }

    async fn post_tool_notice(
        &self,
        conversation_key: &str,
        tool: &str,
        input: &Value,
    ) -> anyhow::Result<()> {
        println!("[{conversation_key}] tool {tool}: {input}");
        Ok(())
    }

    async fn post_notice(&self, conversation_key: &str, text: &str) -> anyhow::Result<()> {
        println!("[{conversation_key}] {text}");
        Ok(())
    }

    async fn post_fatal(&self, conversation_key: &str, detail: &str) -> anyhow::Result<()> {
        println!("[{conversation_key}] agent process died ({detail}); send /restart to start over");
        Ok(())
    }

    async fn ask_choice(
        &self,
        conversation_key: &str,
        question: &str,
        options: &[String],
        timeout: Duration,
    ) -> anyhow::Result<Option<String>> {
        println!("[{conversation_key}] agent asks: {question}");
        for (i, option) in options.iter().enumerate() {
            println!("  {}. {option}", i + 1);
        }
        println!("(type an answer within {}s)", timeout.as_secs());

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_choice.lock().await;
            *pending = Some(tx);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(line)) => {
                let line = line.trim();
                // A numeric reply picks the option by index.
                if let Ok(index) = line.parse::<usize>()
                    && index >= 1
                    && index <= options.len()
                {
                    return Ok(Some(options[index - 1].clone()));
                }
                if line.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(line.to_string()))
                }
            }
            _ => {
                // Timeout or serve loop gone; drop the stale waiter.
                let mut pending = self.pending_choice.lock().await;
                *pending = None;
                Ok(None)
            }
        }
    }
}
