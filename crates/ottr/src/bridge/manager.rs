//! Conversation registry and session supervision.
//!
//! The manager maps conversation keys to live sessions, creates sessions on
//! demand, and runs one event loop per conversation. Two recovery policies
//! live here: context-overflow restart-and-retry (invisible to the user) and
//! fatal-exit deregistration (surfaced once, no automatic retry).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use regex::Regex;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;

use super::output::{CHOICE_TOOL, DeltaOutcome, OutputBuffer, parse_choice_questions};
use crate::chat::{ChatPort, InboundMessage};
use crate::sandbox::SandboxLifecycle;
use crate::session::{
    AgentCommand, AgentSession, SessionError, SessionEvent, SessionState, format_exit_status,
};

/// Diagnostics the agent emits when its input exceeds the model's context
/// window. Pattern-based because the protocol exposes no structured signal.
pub const DEFAULT_OVERFLOW_MARKERS: &[&str] = &[
    "Prompt is too long",
    "(?i)context window (?:exceeded|overflowed?)",
];

/// Compile the default overflow patterns.
pub fn default_overflow_patterns() -> Vec<Regex> {
    DEFAULT_OVERFLOW_MARKERS
        .iter()
        .map(|pattern| Regex::new(pattern).expect("default overflow pattern compiles"))
        .collect()
}

/// Tuning knobs for the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How to launch the agent CLI (before sandbox wrapping).
    pub agent: AgentCommand,
    /// Silence required after a question-ending delta before it is flushed.
    pub question_debounce: Duration,
    /// Bounded wait for a choice-prompt selection.
    pub choice_timeout: Duration,
    /// Patterns identifying a context-overflow turn.
    pub overflow_patterns: Vec<Regex>,
    /// Input sent when a choice prompt times out or resolves without text.
    pub fallback_answer: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            agent: AgentCommand::default(),
            question_debounce: Duration::from_millis(800),
            choice_timeout: Duration::from_secs(300),
            overflow_patterns: default_overflow_patterns(),
            fallback_answer: "skip".to_string(),
        }
    }
}

/// Snapshot of one registered conversation (for status queries).
#[derive(Debug, Clone)]
pub struct ConversationInfo {
    pub conversation_key: String,
    pub state: SessionState,
    pub busy: bool,
}

/// Registry entry: the session plus all per-conversation side state.
struct ConversationEntry {
    session: AgentSession,
    /// Bumped on every session replacement; event loops carry the epoch they
    /// were spawned for and ignore the registry once it moves on.
    epoch: u64,
    output: OutputBuffer,
    /// Last input actually sent, kept for the one in-flight overflow retry.
    last_input: Option<String>,
    /// Platform reference for the message the current turn answers.
    origin: Option<String>,
    /// An overflow restart is in flight; suppresses a second retry and the
    /// fatal-exit policy until the retried turn resolves.
    retrying: bool,
    /// Pending debounced question flush.
    flush_task: Option<JoinHandle<()>>,
    /// Signalled when a turn finalizes, for choice answers waiting on Ready.
    ready: Arc<Notify>,
}

impl ConversationEntry {
    fn cancel_flush(&mut self) {
        if let Some(task) = self.flush_task.take() {
            task.abort();
        }
    }
}

/// Owns every conversation's session and side state.
///
/// No ambient state: independent managers can coexist (tests rely on this).
pub struct SessionManager {
    registry: RwLock<HashMap<String, ConversationEntry>>,
    /// Serializes session creation so two concurrent messages for the same
    /// key cannot spawn two processes.
    creating: Mutex<()>,
    chat: Arc<dyn ChatPort>,
    sandbox: Arc<dyn SandboxLifecycle>,
    config: ManagerConfig,
    epochs: AtomicU64,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        chat: Arc<dyn ChatPort>,
        sandbox: Arc<dyn SandboxLifecycle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            creating: Mutex::new(()),
            chat,
            sandbox,
            config,
            epochs: AtomicU64::new(0),
        })
    }

    /// Route one inbound message to its conversation's session, creating the
    /// session first if none is alive for the key.
    ///
    /// A message arriving while a turn is outstanding is rejected with a
    /// notice to the chat side; it is not queued and not recorded for retry.
    pub async fn handle_message(self: &Arc<Self>, message: InboundMessage) -> Result<()> {
        let key = message.conversation_key.clone();
        let prompt = message.prompt_text();

        self.ensure_session(&key).await?;

        let rejected_busy = {
            let mut registry = self.registry.write().await;
            let entry = registry
                .get_mut(&key)
                .context("conversation disappeared during send")?;
            match entry.session.send(&prompt).await {
                Ok(()) => {
                    entry.last_input = Some(prompt);
                    entry.origin = message.origin.clone();
                    // A fresh user turn gets a fresh retry budget.
                    entry.retrying = false;
                    false
                }
                Err(SessionError::Busy) => true,
                Err(e) => return Err(e).context("sending message to agent"),
            }
        };

        if rejected_busy {
            debug!("conversation {key}: message rejected, turn still in flight");
            if let Err(e) = self
                .chat
                .post_notice(
                    &key,
                    "Still working on the previous message; send that again once this turn finishes.",
                )
                .await
            {
                warn!("conversation {key}: failed to post busy notice: {e:#}");
            }
        }
        Ok(())
    }

    /// Stop and deregister one conversation; the next message starts fresh.
    pub async fn remove_conversation(&self, key: &str) {
        let entry = { self.registry.write().await.remove(key) };
        if let Some(mut entry) = entry {
            entry.cancel_flush();
            entry.session.stop().await;
            info!("conversation {key}: deregistered");
        }
    }

    /// Stop every session and clear the registry.
    pub async fn shutdown(&self) {
        info!("shutting down session manager");
        let keys: Vec<String> = { self.registry.read().await.keys().cloned().collect() };
        for key in keys {
            self.remove_conversation(&key).await;
        }
    }

    /// Snapshot all registered conversations.
    pub async fn list_conversations(&self) -> Vec<ConversationInfo> {
        let registry = self.registry.read().await;
        let mut infos = Vec::with_capacity(registry.len());
        for (key, entry) in registry.iter() {
            infos.push(ConversationInfo {
                conversation_key: key.clone(),
                state: entry.session.state().await,
                busy: entry.session.is_busy().await,
            });
        }
        infos
    }

    /// State of one conversation's session, or `None` if unregistered.
    pub async fn conversation_state(&self, key: &str) -> Option<SessionState> {
        let registry = self.registry.read().await;
        match registry.get(key) {
            Some(entry) => Some(entry.session.state().await),
            None => None,
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Creation-on-demand: make sure a live session exists for the key.
    async fn ensure_session(self: &Arc<Self>, key: &str) -> Result<()> {
        let _guard = self.creating.lock().await;
        {
            let registry = self.registry.read().await;
            if let Some(entry) = registry.get(key)
                && entry.session.is_alive()
            {
                return Ok(());
            }
        }
        self.spawn_session(key).await
    }

    /// Replace the session for a key regardless of its state (overflow
    /// recovery path).
    async fn restart_session(self: &Arc<Self>, key: &str) -> Result<()> {
        let _guard = self.creating.lock().await;
        self.spawn_session(key).await
    }

    /// Spawn a new session for the key and register it, superseding any
    /// previous one. Side state (last input, origin, retry flag) survives the
    /// replacement; per-turn output does not.
    fn spawn_session<'a>(
        self: &'a Arc<Self>,
        key: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        self.sandbox
            .ensure_running()
            .await
            .context("execution environment unavailable")?;

        let command = self.sandbox.wrap_command(&self.config.agent);
        let mut session = AgentSession::new(key, command);
        let events = session.start().await.context("starting agent session")?;
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut registry = self.registry.write().await;
            match registry.get_mut(key) {
                Some(entry) => {
                    entry.cancel_flush();
                    entry.session.stop().await;
                    entry.session = session;
                    entry.epoch = epoch;
                    entry.output.clear();
                }
                None => {
                    registry.insert(
                        key.to_string(),
                        ConversationEntry {
                            session,
                            epoch,
                            output: OutputBuffer::new(),
                            last_input: None,
                            origin: None,
                            retrying: false,
                            flush_task: None,
                            ready: Arc::new(Notify::new()),
                        },
                    );
                }
            }
        }

        info!("conversation {key}: agent session started (epoch {epoch})");
        let manager = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            manager.event_loop(key, epoch, events).await;
        });
        Ok(())
        })
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    /// Per-conversation loop draining one session's event channel. Ends when
    /// the session's process exits (the channel always closes after the
    /// `Exited` event).
    async fn event_loop(
        self: Arc<Self>,
        key: String,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::TextDelta { text } => self.on_delta(&key, epoch, &text).await,
                SessionEvent::ToolUse { name, input } => {
                    self.on_tool_use(&key, epoch, name, input).await;
                }
                SessionEvent::TurnResult { text, is_error } => {
                    self.on_turn_result(&key, epoch, text, is_error).await;
                }
                // Already logged by the session's stderr reader.
                SessionEvent::Diagnostic { .. } => {}
                SessionEvent::Exited { code, signal } => {
                    self.on_exit(&key, epoch, code, signal).await;
                    break;
                }
            }
        }
    }

    async fn on_delta(self: &Arc<Self>, key: &str, epoch: u64, text: &str) {
        let mut registry = self.registry.write().await;
        let Some(entry) = registry.get_mut(key) else {
            return;
        };
        if entry.epoch != epoch {
            return;
        }
        match entry.output.push_delta(text) {
            DeltaOutcome::Narrative => {}
            DeltaOutcome::QuestionArmed => {
                // Re-arm the debounce: the question flushes only after the
                // agent stops adding to it.
                entry.cancel_flush();
                let manager = Arc::clone(self);
                let key = key.to_string();
                let delay = self.config.question_debounce;
                entry.flush_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    manager.flush_question(&key, epoch).await;
                }));
            }
        }
    }

    async fn flush_question(self: &Arc<Self>, key: &str, epoch: u64) {
        let question = {
            let mut registry = self.registry.write().await;
            let Some(entry) = registry.get_mut(key) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }
            entry.flush_task = None;
            entry.output.take_question()
        };
        if let Some(question) = question
            && let Err(e) = self.chat.post_question(key, &question).await
        {
            warn!("conversation {key}: failed to post question: {e:#}");
        }
    }

    async fn on_tool_use(self: &Arc<Self>, key: &str, epoch: u64, name: String, input: Value) {
        {
            let registry = self.registry.read().await;
            let Some(entry) = registry.get(key) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }
        }

        if name == CHOICE_TOOL
            && let Some(questions) = parse_choice_questions(&input)
        {
            // Bounded-wait choice prompts run off the event loop so the
            // turn's remaining events are not held up behind the user.
            let manager = Arc::clone(self);
            let key = key.to_string();
            tokio::spawn(async move {
                for question in questions {
                    let selection = match manager
                        .chat
                        .ask_choice(
                            &key,
                            &question.question,
                            &question.options,
                            manager.config.choice_timeout,
                        )
                        .await
                    {
                        Ok(selection) => selection,
                        Err(e) => {
                            warn!("conversation {key}: choice prompt failed: {e:#}");
                            None
                        }
                    };
                    let answer = match selection {
                        Some(choice) if !choice.trim().is_empty() => choice,
                        _ => manager.config.fallback_answer.clone(),
                    };
                    manager.deliver_answer(&key, answer).await;
                }
            });
            return;
        }

        if let Err(e) = self.chat.post_tool_notice(key, &name, &input).await {
            warn!("conversation {key}: failed to post tool notice: {e:#}");
        }
    }

    /// Send a choice answer as the conversation's next input, waiting briefly
    /// for the current turn to finalize if one is still outstanding.
    async fn deliver_answer(self: &Arc<Self>, key: &str, text: String) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        loop {
            let mut registry = self.registry.write().await;
            let Some(entry) = registry.get_mut(key) else {
                debug!("conversation {key}: gone before choice answer could be delivered");
                return;
            };
            match entry.session.send(&text).await {
                Ok(()) => {
                    entry.last_input = Some(text);
                    return;
                }
                Err(SessionError::Busy) => {
                    let notify = Arc::clone(&entry.ready);
                    let mut notified = std::pin::pin!(notify.notified());
                    // Register interest before releasing the lock so the
                    // finalize signal cannot slip between the two.
                    notified.as_mut().enable();
                    drop(registry);
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        warn!("conversation {key}: turn never finalized, dropping choice answer");
                        return;
                    }
                }
                Err(e) => {
                    warn!("conversation {key}: could not deliver choice answer: {e}");
                    return;
                }
            }
        }
    }

    async fn on_turn_result(self: &Arc<Self>, key: &str, epoch: u64, text: String, is_error: bool) {
        enum Finalize {
            Overflow { last_input: Option<String> },
            Normal {
                question: Option<String>,
                completion: String,
                origin: Option<String>,
                success: bool,
            },
        }

        let action = {
            let mut registry = self.registry.write().await;
            let Some(entry) = registry.get_mut(key) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }

            let overflow = self.is_overflow(&entry.output.combined_turn_text(&text));
            if overflow && !entry.retrying {
                info!("conversation {key}: context overflow detected, restarting session");
                entry.retrying = true;
                entry.cancel_flush();
                entry.output.clear();
                Finalize::Overflow {
                    last_input: entry.last_input.clone(),
                }
            } else {
                if overflow {
                    warn!("conversation {key}: overflow persisted after retry, giving up");
                }
                entry.retrying = false;
                entry.cancel_flush();
                let question = entry.output.take_question();
                let completion = entry.output.completion_text(&text);
                let origin = entry.origin.take();
                entry.ready.notify_waiters();
                Finalize::Normal {
                    question,
                    completion,
                    origin,
                    success: !is_error && !overflow,
                }
            }
        };

        match action {
            Finalize::Overflow { last_input } => {
                self.recover_from_overflow(key, last_input).await;
            }
            Finalize::Normal {
                question,
                completion,
                origin,
                success,
            } => {
                // A question still pending at turn end flushes ahead of the
                // completion message.
                if let Some(question) = question
                    && let Err(e) = self.chat.post_question(key, &question).await
                {
                    warn!("conversation {key}: failed to post question: {e:#}");
                }
                if let Err(e) = self
                    .chat
                    .post_completion(key, origin.as_deref(), &completion, success)
                    .await
                {
                    warn!("conversation {key}: failed to post completion: {e:#}");
                }
            }
        }
    }

    /// Replace the session and silently resend the last input. The user sees
    /// nothing but a delay unless the restart itself fails.
    async fn recover_from_overflow(self: &Arc<Self>, key: &str, last_input: Option<String>) {
        if let Err(e) = self.restart_session(key).await {
            error!("conversation {key}: overflow restart failed: {e:#}");
            self.clear_retrying(key).await;
            if let Err(e) = self
                .chat
                .post_completion(
                    key,
                    None,
                    "The agent ran out of context and could not be restarted.",
                    false,
                )
                .await
            {
                warn!("conversation {key}: failed to post restart failure: {e:#}");
            }
            return;
        }

        let Some(input) = last_input else {
            debug!("conversation {key}: no recorded input to retry after overflow");
            self.clear_retrying(key).await;
            return;
        };

        let send_result = {
            let mut registry = self.registry.write().await;
            match registry.get_mut(key) {
                Some(entry) => entry.session.send(&input).await,
                None => return,
            }
        };
        if let Err(e) = send_result {
            error!("conversation {key}: failed to resend input after overflow restart: {e}");
            self.clear_retrying(key).await;
            if let Err(e) = self
                .chat
                .post_completion(key, None, "The agent restarted but the retry failed.", false)
                .await
            {
                warn!("conversation {key}: failed to post retry failure: {e:#}");
            }
        }
    }

    async fn clear_retrying(&self, key: &str) {
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.get_mut(key) {
            entry.retrying = false;
        }
    }

    async fn on_exit(self: &Arc<Self>, key: &str, epoch: u64, code: Option<i32>, signal: Option<i32>) {
        let fatal = {
            let mut registry = self.registry.write().await;
            let Some(entry) = registry.get_mut(key) else {
                return;
            };
            if entry.epoch != epoch {
                debug!("conversation {key}: exit from superseded session ignored");
                return;
            }
            let abnormal = code.is_some_and(|c| c != 0) || signal.is_some();
            let fatal = abnormal && !entry.retrying;
            if fatal {
                entry.cancel_flush();
            }
            if fatal {
                registry.remove(key);
            }
            fatal
        };

        if fatal {
            let detail = format_exit_status(code, signal);
            warn!("conversation {key}: agent {detail}; conversation deregistered");
            if let Err(e) = self.chat.post_fatal(key, &detail).await {
                warn!("conversation {key}: failed to post fatal notice: {e:#}");
            }
        } else {
            debug!(
                "conversation {key}: agent {}",
                format_exit_status(code, signal)
            );
        }
    }

    fn is_overflow(&self, text: &str) -> bool {
        self.config
            .overflow_patterns
            .iter()
            .any(|pattern| pattern.is_match(text))
    }
}
