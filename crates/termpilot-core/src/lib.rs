//! termpilot-core: PTY-backed orchestration of terminal AI agents.
//!
//! The crate drives interactive CLIs (Claude Code, Aider, Codex, plain
//! shells) through pseudo-terminals: spawning them, classifying their
//! output into semantic states, detecting when they are ready for input,
//! injecting prompts with retries and human-like pacing, and running
//! multi-step workflows across a roster of agents.

pub mod classify;
pub mod error;
pub mod inject;
pub mod orchestrator;
pub mod process;
pub mod sanitize;
pub mod types;

pub use classify::{Detection, PatternGroup, ReadinessClassifier, ReadinessProfile, StateClassifier};
pub use error::{Error, Result};
pub use inject::{InjectionHandle, Injector, InputSink};
pub use orchestrator::{AgentHandle, Orchestrator, OrchestratorStats};
pub use process::{ProcessManager, ProcessSpec, ProcessState};
pub use types::{
    AgentConfig, AgentInfo, AgentKind, AgentMetrics, AgentStatus, InjectOptions,
    OrchestratorEvent, Workflow, WorkflowStep,
};
