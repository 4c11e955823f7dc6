//! Shared types: agent identity/configuration, metrics, workflow
//! definitions, and the orchestrator event enum.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ========== Agent identity ==========

/// The family of CLI an agent runs. Each family prints a different ready
/// prompt, so readiness pattern sets are keyed by kind. Unknown kinds are
/// carried as `Custom` and must register their own pattern set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AgentKind {
    Claude,
    Aider,
    Codex,
    Shell,
    Custom(String),
}

impl AgentKind {
    pub fn as_str(&self) -> &str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Aider => "aider",
            AgentKind::Codex => "codex",
            AgentKind::Shell => "shell",
            AgentKind::Custom(s) => s.as_str(),
        }
    }
}

impl From<String> for AgentKind {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "claude" | "claude-code" => AgentKind::Claude,
            "aider" => AgentKind::Aider,
            "codex" => AgentKind::Codex,
            "shell" | "bash" | "sh" | "zsh" => AgentKind::Shell,
            _ => AgentKind::Custom(s),
        }
    }
}

impl From<AgentKind> for String {
    fn from(k: AgentKind) -> Self {
        k.as_str().to_string()
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spawn configuration for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AgentKind,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Coarse agent availability, as seen by callers and the workflow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    Offline,
}

/// Running per-agent counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Rolling average of injection round-trip time in milliseconds.
    pub avg_response_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<i64>,
    pub created_at: i64,
}

/// Snapshot returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AgentKind,
    pub state: AgentStatus,
    pub ready: bool,
    pub metrics: AgentMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
}

// ========== Injection options ==========

/// Delivery options for an injection request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InjectOptions {
    /// Simulate per-character typing at `chars_per_minute` with jitter.
    pub human_like: bool,
    pub chars_per_minute: u32,
    /// Block delivery until the target's readiness classifier says go.
    pub wait_for_ready: bool,
    /// After delivery, wait for the next ready transition and capture the
    /// agent's reply. Consumed by the orchestrator, not the injector.
    pub wait_for_response: bool,
    /// Bounds the caller's wait only; the retry loop is not cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Append a line terminator unless the payload already ends in one.
    pub confirm_with_enter: bool,
    /// Write bytes verbatim, bypassing every other option.
    pub raw: bool,
}

impl Default for InjectOptions {
    fn default() -> Self {
        Self {
            human_like: false,
            chars_per_minute: 600,
            wait_for_ready: false,
            wait_for_response: false,
            timeout_ms: None,
            confirm_with_enter: true,
            raw: false,
        }
    }
}

// ========== Workflows ==========

/// One step of a workflow: a prompt routed to an explicit agent or to the
/// first idle one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub retries: u32,
    /// Memory key the step's result is stored under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A named ordered list of steps, executed strictly sequentially.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

// ========== Events ==========

/// Events fanned out by the orchestrator for any subscriber (transport
/// layer, dashboards, tests).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OrchestratorEvent {
    #[serde(rename_all = "camelCase")]
    AgentSpawned { agent_id: String, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    AgentTerminated { agent_id: String, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    AgentOutput {
        agent_id: String,
        data: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    AgentReady {
        agent_id: String,
        #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
        matched: Option<String>,
        confidence: f64,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    AgentBusy {
        agent_id: String,
        confidence: f64,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    StateChange {
        agent_id: String,
        new_state: String,
        confidence: f64,
    },
    #[serde(rename_all = "camelCase")]
    AgentError { agent_id: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_kind_roundtrip() {
        assert_eq!(AgentKind::from("claude-code".to_string()), AgentKind::Claude);
        assert_eq!(AgentKind::from("ZSH".to_string()), AgentKind::Shell);
        assert_eq!(
            AgentKind::from("mycli".to_string()),
            AgentKind::Custom("mycli".to_string())
        );
        assert_eq!(String::from(AgentKind::Aider), "aider");
    }

    #[test]
    fn test_agent_config_defaults() {
        let config: AgentConfig = serde_json::from_str(
            r#"{"id":"a1","name":"worker","type":"shell","command":"bash"}"#,
        )
        .unwrap();
        assert_eq!(config.kind, AgentKind::Shell);
        assert!(config.args.is_empty());
        assert!(config.env.is_none());
    }

    #[test]
    fn test_event_wire_format() {
        let event = OrchestratorEvent::AgentReady {
            agent_id: "a1".to_string(),
            matched: Some("shell-prompt".to_string()),
            confidence: 0.9,
            timestamp: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent-ready");
        assert_eq!(json["agentId"], "a1");
        assert_eq!(json["match"], "shell-prompt");
    }
}
