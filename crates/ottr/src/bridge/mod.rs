//! Session supervision and output shaping.
//!
//! [`SessionManager`] owns the conversation registry and the recovery
//! policies; [`OutputBuffer`] turns streamed deltas into a minimal number of
//! outbound chat messages.

mod manager;
mod output;

pub use manager::{
    ConversationInfo, DEFAULT_OVERFLOW_MARKERS, ManagerConfig, SessionManager,
    default_overflow_patterns,
};
pub use output::{CHOICE_TOOL, ChoiceQuestion, DeltaOutcome, OutputBuffer, parse_choice_questions};
