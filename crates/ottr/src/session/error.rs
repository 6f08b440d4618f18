//! Session error types.

use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by [`super::AgentSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// `send` was called before `start()` or after `stop()`.
    #[error("session not started")]
    NotStarted,

    /// A turn is already outstanding; the remote agent handles one at a time.
    #[error("a turn is already in flight")]
    Busy,

    /// The agent subprocess could not be spawned.
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Writing the input record to the subprocess failed (e.g. broken pipe).
    #[error("failed to write to agent stdin: {0}")]
    Stdin(#[source] std::io::Error),

    /// The outbound record could not be encoded.
    #[error("failed to encode user record: {0}")]
    Encode(#[from] serde_json::Error),
}
