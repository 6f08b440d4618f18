//! ottr: chat-thread bridge for sandboxed coding agent sessions.
//!
//! One chat thread maps to one long-running agent subprocess speaking a
//! newline-delimited JSON protocol. The pieces:
//!
//! ```text
//! Chat platform <--[ChatPort]-- SessionManager --[registry]--> AgentSession --> subprocess
//!                                     |                                           |
//!                               OutputBuffer  <--[SessionEvent channel]-- reader task
//! ```
//!
//! - [`session::AgentSession`] owns one subprocess: spawning, protocol framing
//!   over its standard streams, and the `Starting → Ready ⇄ Busy → Terminated`
//!   state machine.
//! - [`bridge::SessionManager`] owns the conversation registry, routes inbound
//!   messages, debounces question output, and recovers from context overflow
//!   and fatal process exits.
//! - [`chat::ChatPort`] and [`sandbox::SandboxLifecycle`] are the seams to the
//!   two external collaborators: the chat platform and the execution sandbox.

pub mod bridge;
pub mod chat;
pub mod config;
pub mod sandbox;
pub mod session;
