//! Wire-level types and framing for the agent stream-JSON protocol.
//!
//! The agent CLI speaks one JSON object per line over its standard streams:
//!
//! ```text
//! Bridge --[user records]--> agent stdin
//! Bridge <--[system/assistant/result records]-- agent stdout
//! ```
//!
//! This crate owns the two pieces that can be tested without a subprocess:
//!
//! 1. [`LineFramer`]: turns arbitrary byte chunks into complete lines,
//!    holding back an incomplete trailing fragment across reads.
//! 2. [`decode_line`]: parses one line into an [`AgentRecord`], returning
//!    `None` for anything that is not a record so interleaved diagnostic
//!    output is tolerated.
//!
//! Nothing here is async; the session layer feeds it from its reader task.

mod framing;
mod records;

pub use framing::LineFramer;
pub use records::{
    AgentRecord, AssistantMessage, ContentBlock, SESSION_ID_PLACEHOLDER, UserRecord, decode_line,
};
