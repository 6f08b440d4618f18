//! End-to-end bridge tests.
//!
//! Each test drives a real subprocess: a `/bin/sh` script standing in for the
//! agent CLI, emitting scripted stream-JSON on stdout. A recording chat port
//! captures everything the bridge sends outward.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use ottr::bridge::{ManagerConfig, SessionManager};
use ottr::chat::{ChatPort, InboundMessage};
use ottr::sandbox::HostSandbox;
use ottr::session::{AgentCommand, SessionState};

// ============================================================================
// Test harness
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum PortEvent {
    Question {
        key: String,
        text: String,
    },
    Completion {
        key: String,
        origin: Option<String>,
        text: String,
        success: bool,
    },
    ToolNotice {
        key: String,
        tool: String,
    },
    Notice {
        key: String,
        text: String,
    },
    Fatal {
        key: String,
        detail: String,
    },
    Choice {
        key: String,
        question: String,
        options: Vec<String>,
    },
}

/// Records every outbound event; `ask_choice` replies with a canned answer.
#[derive(Default)]
struct RecordingPort {
    events: Mutex<Vec<PortEvent>>,
    choice_answer: Mutex<Option<String>>,
}

impl RecordingPort {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_choice_answer(answer: &str) -> Arc<Self> {
        let port = Self::default();
        *port.choice_answer.lock().unwrap() = Some(answer.to_string());
        Arc::new(port)
    }

    fn events(&self) -> Vec<PortEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: PortEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn completions(&self) -> Vec<PortEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, PortEvent::Completion { .. }))
            .collect()
    }

    fn questions(&self) -> Vec<PortEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, PortEvent::Question { .. }))
            .collect()
    }

    fn fatals(&self) -> Vec<PortEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, PortEvent::Fatal { .. }))
            .collect()
    }
}

#[async_trait]
impl ChatPort for RecordingPort {
    async fn post_question(&self, key: &str, text: &str) -> anyhow::Result<()> {
        self.push(PortEvent::Question {
            key: key.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn post_completion(
        &self,
        key: &str,
        origin: Option<&str>,
        text: &str,
        success: bool,
    ) -> anyhow::Result<()> {
        self.push(PortEvent::Completion {
            key: key.to_string(),
            origin: origin.map(String::from),
            text: text.to_string(),
            success,
        });
        Ok(())
    }

    async fn post_tool_notice(&self, key: &str, tool: &str, _input: &Value) -> anyhow::Result<()> {
        self.push(PortEvent::ToolNotice {
            key: key.to_string(),
            tool: tool.to_string(),
        });
        Ok(())
    }

    async fn post_notice(&self, key: &str, text: &str) -> anyhow::Result<()> {
        self.push(PortEvent::Notice {
            key: key.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn post_fatal(&self, key: &str, detail: &str) -> anyhow::Result<()> {
        self.push(PortEvent::Fatal {
            key: key.to_string(),
            detail: detail.to_string(),
        });
        Ok(())
    }

    async fn ask_choice(
        &self,
        key: &str,
        question: &str,
        options: &[String],
        _timeout: Duration,
    ) -> anyhow::Result<Option<String>> {
        self.push(PortEvent::Choice {
            key: key.to_string(),
            question: question.to_string(),
            options: options.to_vec(),
        });
        Ok(self.choice_answer.lock().unwrap().clone())
    }
}

fn sh_agent(script: &str) -> AgentCommand {
    AgentCommand::new("sh").with_args(["-c", script])
}

fn manager_for(
    script: &str,
    port: &Arc<RecordingPort>,
    debounce_ms: u64,
) -> Arc<SessionManager> {
    let config = ManagerConfig {
        agent: sh_agent(script),
        question_debounce: Duration::from_millis(debounce_ms),
        choice_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let chat: Arc<dyn ChatPort> = Arc::clone(port) as Arc<dyn ChatPort>;
    SessionManager::new(config, chat, Arc::new(HostSandbox))
}

/// Poll until `predicate` holds or ten seconds elapse.
async fn wait_for(predicate: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

// ============================================================================
// Turn completion
// ============================================================================

#[tokio::test]
async fn simple_turn_yields_exactly_one_completion() {
    let script = r#"read -r line
echo '{"type":"system","subtype":"init","session_id":"sess-1"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"4"}]},"session_id":"sess-1"}'
echo '{"type":"result","result":"4","is_error":false,"session_id":"sess-1"}'
"#;
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 100);

    let mut message = InboundMessage::new("thread-1", "What is 2+2?");
    message.origin = Some("msg-1".to_string());
    manager.handle_message(message).await.unwrap();

    assert!(wait_for(|| !port.completions().is_empty()).await);
    // Give any stray duplicate a chance to show up.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let completions = port.completions();
    assert_eq!(completions.len(), 1, "events: {:?}", port.events());
    assert_eq!(
        completions[0],
        PortEvent::Completion {
            key: "thread-1".to_string(),
            origin: Some("msg-1".to_string()),
            text: "4".to_string(),
            success: true,
        }
    );
    assert!(port.questions().is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn failed_turn_is_styled_as_failure() {
    let script = r#"read -r line
echo '{"type":"result","result":"tool crashed","is_error":true,"session_id":"s"}'
sleep 30
"#;
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 100);

    manager
        .handle_message(InboundMessage::new("thread-1", "break"))
        .await
        .unwrap();

    assert!(wait_for(|| !port.completions().is_empty()).await);
    let completions = port.completions();
    assert_eq!(completions.len(), 1);
    let PortEvent::Completion { text, success, .. } = &completions[0] else {
        unreachable!();
    };
    assert_eq!(text, "tool crashed");
    assert!(!success);
    // A turn error leaves the session alive.
    assert_eq!(
        manager.conversation_state("thread-1").await,
        Some(SessionState::Ready)
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn dead_session_is_recreated_on_next_message() {
    // The script answers one turn and exits cleanly; the next message needs a
    // fresh process.
    let script = r#"read -r line
echo '{"type":"result","result":"done","is_error":false,"session_id":"s"}'
"#;
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 100);

    manager
        .handle_message(InboundMessage::new("thread-1", "first"))
        .await
        .unwrap();
    assert!(wait_for(|| port.completions().len() == 1).await);

    // Wait until the clean exit has been observed so the next message takes
    // the recreation path instead of racing the dying process.
    let manager_ref = &manager;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if manager_ref.conversation_state("thread-1").await == Some(SessionState::Terminated) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "session never terminated");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    manager
        .handle_message(InboundMessage::new("thread-1", "second"))
        .await
        .unwrap();
    assert!(wait_for(|| port.completions().len() == 2).await);
    assert!(port.fatals().is_empty());

    manager.shutdown().await;
}

// ============================================================================
// Question classification and debounce
// ============================================================================

#[tokio::test]
async fn question_flushes_after_debounce_with_empty_narrative() {
    let script = r#"read -r line
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Should I use TypeScript or "}]},"session_id":"s"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Python?"}]},"session_id":"s"}'
sleep 30
"#;
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 200);

    manager
        .handle_message(InboundMessage::new("thread-1", "set up the project"))
        .await
        .unwrap();

    assert!(wait_for(|| !port.questions().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let questions = port.questions();
    assert_eq!(questions.len(), 1, "events: {:?}", port.events());
    assert_eq!(
        questions[0],
        PortEvent::Question {
            key: "thread-1".to_string(),
            text: "Should I use TypeScript or Python?".to_string(),
        }
    );
    // No result arrived, so nothing else was flushed.
    assert!(port.completions().is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn pending_question_flushes_before_completion_at_turn_end() {
    // The result arrives well inside the debounce window; finalization must
    // flush the question first, then the completion.
    let script = r#"read -r line
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Proceed with the migration?"}]},"session_id":"s"}'
echo '{"type":"result","result":"stopping here","is_error":false,"session_id":"s"}'
sleep 30
"#;
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 5_000);

    manager
        .handle_message(InboundMessage::new("thread-1", "migrate"))
        .await
        .unwrap();

    assert!(wait_for(|| !port.completions().is_empty()).await);
    let events = port.events();
    let question_pos = events
        .iter()
        .position(|e| matches!(e, PortEvent::Question { .. }))
        .expect("question flushed at turn end");
    let completion_pos = events
        .iter()
        .position(|e| matches!(e, PortEvent::Completion { .. }))
        .unwrap();
    assert!(question_pos < completion_pos);

    manager.shutdown().await;
}

// ============================================================================
// Tool notices and choice prompts
// ============================================================================

#[tokio::test]
async fn tool_use_is_forwarded_immediately() {
    let script = r#"read -r line
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]},"session_id":"s"}'
sleep 30
"#;
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 100);

    manager
        .handle_message(InboundMessage::new("thread-1", "list files"))
        .await
        .unwrap();

    // The notice arrives without waiting for a result.
    assert!(wait_for(|| !port.events().is_empty()).await);
    assert_eq!(
        port.events()[0],
        PortEvent::ToolNotice {
            key: "thread-1".to_string(),
            tool: "Bash".to_string(),
        }
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn choice_prompt_routes_selection_back_to_the_agent() {
    let script = r#"read -r line
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"AskUserQuestion","input":{"questions":[{"question":"Which language?","options":["TypeScript","Python"]}]}}]},"session_id":"s"}'
echo '{"type":"result","result":"asked","is_error":false,"session_id":"s"}'
read -r answer
case "$answer" in
  *TypeScript*) echo '{"type":"result","result":"picked-ts","is_error":false,"session_id":"s"}' ;;
  *) echo '{"type":"result","result":"picked-other","is_error":false,"session_id":"s"}' ;;
esac
sleep 30
"#;
    let port = RecordingPort::with_choice_answer("TypeScript");
    let manager = manager_for(script, &port, 100);

    manager
        .handle_message(InboundMessage::new("thread-1", "set up the project"))
        .await
        .unwrap();

    assert!(wait_for(|| port.completions().len() == 2).await);

    let events = port.events();
    let choice = events
        .iter()
        .find(|e| matches!(e, PortEvent::Choice { .. }))
        .expect("choice prompt surfaced");
    assert_eq!(
        *choice,
        PortEvent::Choice {
            key: "thread-1".to_string(),
            question: "Which language?".to_string(),
            options: vec!["TypeScript".to_string(), "Python".to_string()],
        }
    );
    // The selection reached the agent as its next input.
    assert!(
        port.completions()
            .iter()
            .any(|e| matches!(e, PortEvent::Completion { text, .. } if text == "picked-ts")),
        "events: {events:?}"
    );
    // Parsed choice input never falls through to a tool notice.
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, PortEvent::ToolNotice { .. }))
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn choice_timeout_sends_fallback_answer() {
    let script = r#"read -r line
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"AskUserQuestion","input":{"questions":[{"question":"Deploy now?","options":["Yes","No"]}]}}]},"session_id":"s"}'
echo '{"type":"result","result":"asked","is_error":false,"session_id":"s"}'
read -r answer
case "$answer" in
  *skip*) echo '{"type":"result","result":"skipped","is_error":false,"session_id":"s"}' ;;
  *) echo '{"type":"result","result":"unexpected","is_error":false,"session_id":"s"}' ;;
esac
sleep 30
"#;
    // No canned answer: ask_choice resolves to None, as on timeout.
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 100);

    manager
        .handle_message(InboundMessage::new("thread-1", "ship it"))
        .await
        .unwrap();

    assert!(wait_for(|| port.completions().len() == 2).await);
    assert!(
        port.completions()
            .iter()
            .any(|e| matches!(e, PortEvent::Completion { text, .. } if text == "skipped")),
        "events: {:?}",
        port.events()
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn unparseable_choice_input_falls_back_to_tool_notice() {
    let script = r#"read -r line
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"AskUserQuestion","input":{"freeform":true}}]},"session_id":"s"}'
echo '{"type":"result","result":"done","is_error":false,"session_id":"s"}'
sleep 30
"#;
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 100);

    manager
        .handle_message(InboundMessage::new("thread-1", "go"))
        .await
        .unwrap();

    assert!(wait_for(|| !port.completions().is_empty()).await);
    let events = port.events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, PortEvent::ToolNotice { tool, .. } if tool == "AskUserQuestion"))
    );
    assert!(!events.iter().any(|e| matches!(e, PortEvent::Choice { .. })));

    manager.shutdown().await;
}

// ============================================================================
// Overflow recovery
// ============================================================================

#[tokio::test]
async fn overflow_replaces_session_and_retries_last_input() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("first-run-done");
    let script = format!(
        r#"read -r line
if [ -f "{marker}" ]; then
  echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"recovered ok"}}]}},"session_id":"s2"}}'
  echo '{{"type":"result","result":"recovered ok","is_error":false,"session_id":"s2"}}'
  sleep 30
else
  touch "{marker}"
  echo '{{"type":"result","result":"API Error: Prompt is too long","is_error":true,"session_id":"s1"}}'
  sleep 30
fi
"#,
        marker = marker.display()
    );
    let port = RecordingPort::new();
    let manager = manager_for(&script, &port, 100);

    let mut message = InboundMessage::new("thread-1", "summarize the repo");
    message.origin = Some("msg-7".to_string());
    manager.handle_message(message).await.unwrap();

    assert!(wait_for(|| !port.completions().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The overflow turn itself produced no outbound message; only the retried
    // turn completed, and it kept the original origin reference.
    let completions = port.completions();
    assert_eq!(completions.len(), 1, "events: {:?}", port.events());
    assert_eq!(
        completions[0],
        PortEvent::Completion {
            key: "thread-1".to_string(),
            origin: Some("msg-7".to_string()),
            text: "recovered ok".to_string(),
            success: true,
        }
    );
    assert!(port.fatals().is_empty());

    // The replacement session is registered and idle again.
    assert_eq!(
        manager.conversation_state("thread-1").await,
        Some(SessionState::Ready)
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn persistent_overflow_finalizes_as_failed_turn() {
    // Every run overflows; the bridge must retry exactly once, then give up.
    let script = r#"read -r line
echo '{"type":"result","result":"API Error: Prompt is too long","is_error":true,"session_id":"s"}'
sleep 30
"#;
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 100);

    manager
        .handle_message(InboundMessage::new("thread-1", "huge request"))
        .await
        .unwrap();

    assert!(wait_for(|| !port.completions().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let completions = port.completions();
    assert_eq!(completions.len(), 1, "events: {:?}", port.events());
    let PortEvent::Completion { text, success, .. } = &completions[0] else {
        unreachable!();
    };
    assert!(text.contains("Prompt is too long"));
    assert!(!success);
    assert!(port.fatals().is_empty());

    manager.shutdown().await;
}

// ============================================================================
// Fatal exit
// ============================================================================

#[tokio::test]
async fn fatal_exit_deregisters_the_conversation() {
    let script = r#"read -r line
exit 137
"#;
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 100);

    manager
        .handle_message(InboundMessage::new("thread-1", "do work"))
        .await
        .unwrap();

    assert!(wait_for(|| !port.fatals().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let fatals = port.fatals();
    assert_eq!(fatals.len(), 1, "events: {:?}", port.events());
    let PortEvent::Fatal { key, detail } = &fatals[0] else {
        unreachable!();
    };
    assert_eq!(key, "thread-1");
    assert!(detail.contains("137"), "detail: {detail}");

    // The key is gone; the next message would start fresh.
    assert_eq!(manager.conversation_state("thread-1").await, None);
    assert!(manager.list_conversations().await.is_empty());

    manager.shutdown().await;
}

// ============================================================================
// Busy policy and registry management
// ============================================================================

#[tokio::test]
async fn second_message_during_turn_is_rejected_with_notice() {
    let script = r#"read -r line
sleep 30
"#;
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 100);

    manager
        .handle_message(InboundMessage::new("thread-1", "long job"))
        .await
        .unwrap();
    manager
        .handle_message(InboundMessage::new("thread-1", "are you done yet?"))
        .await
        .unwrap();

    assert!(wait_for(|| !port.events().is_empty()).await);
    let events = port.events();
    assert_eq!(events.len(), 1);
    assert!(
        matches!(&events[0], PortEvent::Notice { key, text }
            if key == "thread-1" && text.contains("Still working"))
    );
    assert_eq!(
        manager.conversation_state("thread-1").await,
        Some(SessionState::Busy)
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn conversations_are_independent() {
    let script = r#"read -r line
echo '{"type":"result","result":"done","is_error":false,"session_id":"s"}'
sleep 30
"#;
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 100);

    manager
        .handle_message(InboundMessage::new("thread-a", "one"))
        .await
        .unwrap();
    manager
        .handle_message(InboundMessage::new("thread-b", "two"))
        .await
        .unwrap();

    assert!(wait_for(|| port.completions().len() == 2).await);
    let keys: Vec<String> = port
        .completions()
        .iter()
        .map(|e| {
            let PortEvent::Completion { key, .. } = e else {
                unreachable!();
            };
            key.clone()
        })
        .collect();
    assert!(keys.contains(&"thread-a".to_string()));
    assert!(keys.contains(&"thread-b".to_string()));

    manager.shutdown().await;
}

#[tokio::test]
async fn remove_conversation_clears_all_state() {
    let script = r#"read -r line
sleep 30
"#;
    let port = RecordingPort::new();
    let manager = manager_for(script, &port, 100);

    manager
        .handle_message(InboundMessage::new("thread-1", "start"))
        .await
        .unwrap();
    assert_eq!(
        manager.conversation_state("thread-1").await,
        Some(SessionState::Busy)
    );

    manager.remove_conversation("thread-1").await;
    assert_eq!(manager.conversation_state("thread-1").await, None);

    // Removing an unknown key is a no-op.
    manager.remove_conversation("thread-1").await;

    manager.shutdown().await;
}
