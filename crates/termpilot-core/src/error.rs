//! Error taxonomy for the core.
//!
//! Process-level failures are surfaced to the caller that initiated the
//! operation; only classification non-matches and diagnostic read-backs are
//! ever swallowed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The OS could not create the PTY-backed child. Fatal to that agent.
    #[error("failed to spawn process: {0}")]
    SpawnFailure(String),

    /// Write attempted on a process that was never spawned.
    #[error("process not initialized")]
    NotInitialized,

    /// Write attempted on a process that has already exited.
    #[error("process already terminated")]
    AlreadyTerminated,

    /// Operation referenced an unknown agent id/name. Surfaced
    /// synchronously at the orchestrator surface; inside the injector a
    /// missing sink is treated as a retryable delivery failure.
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// An agent with the same id is already registered.
    #[error("agent already exists: {0}")]
    AgentExists(String),

    /// Input delivery exhausted its retry budget.
    #[error("injection failed after {retries} retries: {reason}")]
    InjectionFailed { retries: u32, reason: String },

    /// A workflow step could not be executed; aborts the remaining steps.
    #[error("workflow step '{step}' failed: {reason}")]
    WorkflowStep { step: String, reason: String },

    /// Caller-side wait expired. Bounds the wait, not the operation itself.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Underlying PTY layer error (resize, reader/writer handles).
    #[error("pty error: {0}")]
    Pty(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
