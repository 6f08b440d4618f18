//! Output classification and buffering for one conversation turn.
//!
//! Streamed text deltas are coalesced so the chat side receives a minimal
//! number of messages: narrative is held until the turn's result arrives,
//! while a span that ends in a question is promoted to a pending question
//! and flushed early (after a debounce the manager drives).

use serde_json::Value;

/// Tool name reserved for structured multiple-choice questions.
pub const CHOICE_TOOL: &str = "AskUserQuestion";

/// What the manager should do after feeding a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Ordinary narrative; nothing to schedule.
    Narrative,
    /// A question span is pending; (re)arm the debounce flush.
    QuestionArmed,
}

/// Per-turn accumulator for one conversation.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    narrative: String,
    pending_question: Option<String>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one text delta.
    ///
    /// If a question span is already pending, the delta joins it (it will be
    /// part of the same flushed message) and the debounce is rescheduled.
    /// Otherwise the delta extends the narrative; when the narrative's last
    /// non-blank line now ends with `?`, the whole span becomes the pending
    /// question and the narrative is cleared.
    pub fn push_delta(&mut self, text: &str) -> DeltaOutcome {
        if let Some(question) = self.pending_question.as_mut() {
            question.push_str(text);
            return DeltaOutcome::QuestionArmed;
        }

        self.narrative.push_str(text);
        if ends_with_question(&self.narrative) {
            self.pending_question = Some(std::mem::take(&mut self.narrative));
            DeltaOutcome::QuestionArmed
        } else {
            DeltaOutcome::Narrative
        }
    }

    /// Take the pending question span, if any.
    pub fn take_question(&mut self) -> Option<String> {
        self.pending_question.take()
    }

    pub fn narrative(&self) -> &str {
        &self.narrative
    }

    /// Everything accumulated this turn plus the result text, for overflow
    /// marker matching.
    pub fn combined_turn_text(&self, result_text: &str) -> String {
        let mut combined = String::new();
        if let Some(ref question) = self.pending_question {
            combined.push_str(question);
            combined.push('\n');
        }
        combined.push_str(&self.narrative);
        combined.push('\n');
        combined.push_str(result_text);
        combined
    }

    /// Drain the narrative into the turn's completion message.
    ///
    /// The result record usually repeats the final assistant text, so the
    /// result text is appended only when it adds something the narrative does
    /// not already end with.
    pub fn completion_text(&mut self, result_text: &str) -> String {
        let narrative = std::mem::take(&mut self.narrative);
        let narrative = narrative.trim();
        let result_text = result_text.trim();

        if narrative.is_empty() {
            result_text.to_string()
        } else if result_text.is_empty() || narrative.ends_with(result_text) {
            narrative.to_string()
        } else {
            format!("{narrative}\n\n{result_text}")
        }
    }

    /// Discard everything buffered for this turn.
    pub fn clear(&mut self) {
        self.narrative.clear();
        self.pending_question = None;
    }
}

/// True when the last non-blank line of `text` ends with a question mark.
fn ends_with_question(text: &str) -> bool {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| line.trim_end().ends_with('?'))
}

/// One structured question from the choice tool's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceQuestion {
    pub question: String,
    pub options: Vec<String>,
}

/// Parse the choice tool's structured input into question entries.
///
/// Accepts `{"questions": [...]}` or a bare question object; each entry needs
/// a `question` string and an `options` array whose items are strings or
/// `{"label": ...}` objects. Returns `None` when the shape does not match, in
/// which case the caller treats the invocation as an ordinary tool notice.
pub fn parse_choice_questions(input: &Value) -> Option<Vec<ChoiceQuestion>> {
    let entries: Vec<&Value> = match input.get("questions") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(_) => return None,
        None => vec![input],
    };

    let mut questions = Vec::with_capacity(entries.len());
    for entry in entries {
        let question = entry.get("question")?.as_str()?.trim();
        if question.is_empty() {
            return None;
        }
        let options = entry.get("options")?.as_array()?;
        let mut labels = Vec::with_capacity(options.len());
        for option in options {
            let label = match option {
                Value::String(s) => s.as_str(),
                Value::Object(_) => option.get("label")?.as_str()?,
                _ => return None,
            };
            labels.push(label.to_string());
        }
        if labels.is_empty() {
            return None;
        }
        questions.push(ChoiceQuestion {
            question: question.to_string(),
            options: labels,
        });
    }

    if questions.is_empty() {
        None
    } else {
        Some(questions)
    }
}
