//! Agent orchestrator: spawns PTY-backed agents, wires their output into
//! the classifiers, routes prompts through the injector, and runs
//! sequential workflows over the roster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::classify::{Detection, ReadinessClassifier, ReadyTransition, StateClassifier};
use crate::error::{Error, Result};
use crate::inject::{InputSink, Injector};
use crate::process::{ProcessManager, ProcessSpec, ProcessState};
use crate::types::{
    AgentConfig, AgentInfo, AgentMetrics, AgentStatus, InjectOptions, OrchestratorEvent, Workflow,
};

/// Readiness wait used for reply capture when a step sets no timeout.
const DEFAULT_RESPONSE_WAIT_MS: u64 = 120_000;

/// Lines of trailing output captured as an agent's reply.
const RESPONSE_TAIL_LINES: usize = 40;

/// One live agent and everything wired to it.
pub struct AgentHandle {
    pub config: AgentConfig,
    pub process: Arc<ProcessManager>,
    pub classifier: Arc<StateClassifier>,
    pub readiness: Arc<ReadinessClassifier>,
    status: RwLock<AgentStatus>,
    metrics: RwLock<AgentMetrics>,
    last_prompt: RwLock<Option<String>>,
    last_response: RwLock<Option<String>>,
}

impl AgentHandle {
    pub async fn status(&self) -> AgentStatus {
        *self.status.read().await
    }

    pub async fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            kind: self.config.kind.clone(),
            state: *self.status.read().await,
            ready: self.readiness.is_ready(),
            metrics: self.metrics.read().await.clone(),
            last_prompt: self.last_prompt.read().await.clone(),
            last_response: self.last_response.read().await.clone(),
        }
    }
}

/// Injector sink backed by one agent's PTY and readiness classifier.
struct AgentSink {
    process: Arc<ProcessManager>,
    readiness: Arc<ReadinessClassifier>,
}

#[async_trait]
impl InputSink for AgentSink {
    async fn write_input(&self, data: &str) -> Result<()> {
        self.process.write(data).await
    }

    async fn wait_ready(&self, timeout: Duration) -> bool {
        self.readiness.wait_ready(timeout).await
    }
}

/// Roster-level counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub total_agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
    pub error_agents: usize,
    pub offline_agents: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

/// Central coordinator. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Orchestrator {
    agents: Arc<RwLock<HashMap<String, Arc<AgentHandle>>>>,
    injector: Injector,
    memory: Arc<RwLock<HashMap<String, serde_json::Value>>>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl Orchestrator {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            injector: Injector::new(),
            memory: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    // ========== Agent lifecycle ==========

    /// Spawn an agent and wire its output into both classifiers.
    pub async fn spawn_agent(&self, config: AgentConfig) -> Result<()> {
        {
            let agents = self.agents.read().await;
            if agents.contains_key(&config.id) {
                return Err(Error::AgentExists(config.id.clone()));
            }
        }

        let process = Arc::new(ProcessManager::new(ProcessSpec {
            command: config.command.clone(),
            args: config.args.clone(),
            cwd: config.cwd.clone(),
            env: config.env.clone(),
            ..Default::default()
        }));

        let classifier = Arc::new(StateClassifier::new());
        let readiness = Arc::new(ReadinessClassifier::new(config.kind.as_str()));

        let handle = Arc::new(AgentHandle {
            config: config.clone(),
            process: Arc::clone(&process),
            classifier: Arc::clone(&classifier),
            readiness: Arc::clone(&readiness),
            status: RwLock::new(AgentStatus::Idle),
            metrics: RwLock::new(AgentMetrics {
                created_at: Utc::now().timestamp_millis(),
                ..Default::default()
            }),
            last_prompt: RwLock::new(None),
            last_response: RwLock::new(None),
        });

        // Subscribe before spawning: the child's first output (typically
        // its prompt) can arrive before any task gets to run, and chunks
        // broadcast without a subscriber are gone.
        let output_rx = process.subscribe_output();
        let commit_rx = classifier.subscribe();
        let ready_rx = readiness.subscribe();

        if let Err(e) = process.spawn().await {
            self.emit(OrchestratorEvent::AgentError {
                agent_id: config.id.clone(),
                error: e.to_string(),
            });
            return Err(e);
        }

        self.wire_output(&config.id, &handle, output_rx);
        self.wire_state_commits(&config.id, &handle, commit_rx);
        self.wire_readiness(&config.id, &handle, ready_rx);

        self.injector
            .register_agent(
                &config.id,
                Arc::new(AgentSink {
                    process: Arc::clone(&process),
                    readiness: Arc::clone(&readiness),
                }),
            )
            .await;

        self.agents
            .write()
            .await
            .insert(config.id.clone(), Arc::clone(&handle));

        info!(agent_id = %config.id, kind = %config.kind, command = %config.command, "agent spawned");
        self.emit(OrchestratorEvent::AgentSpawned {
            agent_id: config.id.clone(),
            timestamp: Utc::now().timestamp_millis(),
        });
        Ok(())
    }

    /// Feed raw PTY output into both classifiers and fan it out verbatim.
    fn wire_output(
        &self,
        agent_id: &str,
        handle: &Arc<AgentHandle>,
        mut rx: broadcast::Receiver<Vec<u8>>,
    ) {
        let agent_id = agent_id.to_string();
        let classifier = Arc::clone(&handle.classifier);
        let readiness = Arc::clone(&handle.readiness);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(chunk) => {
                        classifier.feed(&chunk);
                        readiness.feed(&chunk);
                        let _ = event_tx.send(OrchestratorEvent::AgentOutput {
                            agent_id: agent_id.clone(),
                            data: String::from_utf8_lossy(&chunk).into_owned(),
                            timestamp: Utc::now().timestamp_millis(),
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(agent_id = %agent_id, skipped = n, "output fan-out lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Map committed state detections onto the process state machine.
    fn wire_state_commits(
        &self,
        agent_id: &str,
        handle: &Arc<AgentHandle>,
        mut rx: broadcast::Receiver<Detection>,
    ) {
        let agent_id = agent_id.to_string();
        let handle = Arc::clone(handle);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            loop {
                let detection = match rx.recv().await {
                    Ok(d) => d,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match detection.state.as_str() {
                    "ready" => handle.process.mark_ready().await,
                    "processing" => {
                        handle.process.set_state(ProcessState::Processing).await;
                        let _ = event_tx.send(OrchestratorEvent::AgentBusy {
                            agent_id: agent_id.clone(),
                            confidence: detection.confidence,
                            timestamp: detection.timestamp,
                        });
                    }
                    "complete" => handle.process.set_state(ProcessState::Waiting).await,
                    "error" => handle.process.mark_error().await,
                    _ => {}
                }

                let _ = event_tx.send(OrchestratorEvent::StateChange {
                    agent_id: agent_id.clone(),
                    new_state: detection.state,
                    confidence: detection.confidence,
                });
            }
        });
    }

    /// Surface readiness flips, and move the process to Ready on a flip up.
    fn wire_readiness(
        &self,
        agent_id: &str,
        handle: &Arc<AgentHandle>,
        mut rx: broadcast::Receiver<ReadyTransition>,
    ) {
        let agent_id = agent_id.to_string();
        let process = Arc::clone(&handle.process);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            loop {
                let transition = match rx.recv().await {
                    Ok(t) => t,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if transition.ready {
                    process.mark_ready().await;
                    let _ = event_tx.send(OrchestratorEvent::AgentReady {
                        agent_id: agent_id.clone(),
                        matched: transition.matched,
                        confidence: transition.confidence,
                        timestamp: transition.timestamp,
                    });
                }
            }
        });
    }

    /// Kill and forget an agent. Unknown ids are a silent no-op so
    /// shutdown paths can be called repeatedly.
    pub async fn terminate_agent(&self, id: &str) {
        let handle = self.agents.write().await.remove(id);
        let Some(handle) = handle else {
            debug!(agent_id = %id, "terminate for unknown agent ignored");
            return;
        };
        self.injector.unregister_agent(id).await;
        handle.process.kill().await;
        *handle.status.write().await = AgentStatus::Offline;

        info!(agent_id = %id, "agent terminated");
        self.emit(OrchestratorEvent::AgentTerminated {
            agent_id: id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        });
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        for id in ids {
            self.terminate_agent(&id).await;
        }
        info!("orchestrator shut down");
    }

    // ========== Prompt routing ==========

    /// Send a prompt to one agent. Returns the captured reply when
    /// `wait_for_response` is set and a fresh ready flip followed the
    /// delivery in time, `None` otherwise.
    pub async fn inject_to_agent(
        &self,
        id: &str,
        prompt: &str,
        options: InjectOptions,
    ) -> Result<Option<String>> {
        let handle = self
            .agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;

        *handle.status.write().await = AgentStatus::Busy;
        *handle.last_prompt.write().await = Some(prompt.to_string());
        let started = tokio::time::Instant::now();

        let wait_for_response = options.wait_for_response;
        let response_wait = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_RESPONSE_WAIT_MS));

        // Subscribed before delivery so the flip that follows the prompt
        // cannot slip past between delivery and the wait below.
        let mut ready_rx = handle.readiness.subscribe();

        let outcome = self.injector.inject(id, prompt, options).wait().await;

        match outcome {
            Ok(()) => {
                let response = if wait_for_response {
                    // The agent is usually still at its prompt here, so the
                    // already-ready state says nothing about the reply.
                    // Drop flips queued before delivery finished and wait
                    // for a fresh one caused by the prompt's output cycle.
                    while ready_rx.try_recv().is_ok() {}
                    if Self::next_ready_flip(&mut ready_rx, response_wait).await {
                        let tail = handle.process.recent_output(RESPONSE_TAIL_LINES).join("\n");
                        *handle.last_response.write().await = Some(tail.clone());
                        Some(tail)
                    } else {
                        debug!(agent_id = %id, "no ready transition after delivery");
                        None
                    }
                } else {
                    None
                };

                let elapsed_ms = started.elapsed().as_millis() as f64;
                {
                    let mut metrics = handle.metrics.write().await;
                    metrics.tasks_completed += 1;
                    metrics.avg_response_ms +=
                        (elapsed_ms - metrics.avg_response_ms) / metrics.tasks_completed as f64;
                    metrics.last_activity = Some(Utc::now().timestamp_millis());
                }
                *handle.status.write().await = AgentStatus::Idle;
                Ok(response)
            }
            Err(e) => {
                {
                    let mut metrics = handle.metrics.write().await;
                    metrics.tasks_failed += 1;
                    metrics.last_activity = Some(Utc::now().timestamp_millis());
                }
                *handle.status.write().await = AgentStatus::Error;
                error!(agent_id = %id, error = %e, "injection to agent failed");
                self.emit(OrchestratorEvent::AgentError {
                    agent_id: id.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Resolve `true` on the next transition to ready, ignoring the
    /// current readiness state and any not-ready transitions in between.
    async fn next_ready_flip(
        rx: &mut broadcast::Receiver<ReadyTransition>,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(transition)) if transition.ready => return true,
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return false,
                Err(_) => return false,
            }
        }
    }

    /// Send an interrupt (Ctrl-C) to the agent's PTY.
    pub async fn interrupt_agent(&self, id: &str) -> Result<()> {
        let handle = self
            .agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        handle.process.write("\x03").await
    }

    // ========== Workflows ==========

    /// Execute the steps strictly in order. Each step goes to its named
    /// agent, or to the first idle one. A step failing after its retries,
    /// an unmet dependency, or no eligible agent aborts the workflow.
    pub async fn execute_workflow(
        &self,
        workflow: &Workflow,
    ) -> Result<HashMap<String, serde_json::Value>> {
        info!(workflow_id = %workflow.id, steps = workflow.steps.len(), "workflow started");
        let mut results: HashMap<String, serde_json::Value> = HashMap::new();

        for step in &workflow.steps {
            for dep in &step.depends_on {
                if !results.contains_key(dep) {
                    return Err(Error::WorkflowStep {
                        step: step.id.clone(),
                        reason: format!("unmet dependency: {dep}"),
                    });
                }
            }

            let agent_id = match &step.agent {
                Some(id) => {
                    if !self.agents.read().await.contains_key(id) {
                        return Err(Error::WorkflowStep {
                            step: step.id.clone(),
                            reason: format!("agent not found: {id}"),
                        });
                    }
                    id.clone()
                }
                None => self.first_idle_agent().await.ok_or_else(|| Error::WorkflowStep {
                    step: step.id.clone(),
                    reason: "no suitable agent".to_string(),
                })?,
            };

            let options = InjectOptions {
                wait_for_response: true,
                timeout_ms: step.timeout_ms,
                ..Default::default()
            };

            let mut reply = None;
            let mut last_error: Option<Error> = None;
            for attempt in 0..=step.retries {
                match self
                    .inject_to_agent(&agent_id, &step.prompt, options.clone())
                    .await
                {
                    Ok(response) => {
                        reply = response;
                        last_error = None;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            workflow_id = %workflow.id,
                            step = %step.id,
                            attempt = attempt + 1,
                            error = %e,
                            "workflow step attempt failed"
                        );
                        last_error = Some(e);
                    }
                }
            }
            if let Some(e) = last_error {
                return Err(Error::WorkflowStep {
                    step: step.id.clone(),
                    reason: e.to_string(),
                });
            }

            // Reply when one was captured, a delivery marker otherwise.
            let value = match reply {
                Some(text) => serde_json::Value::String(text),
                None => serde_json::json!({ "delivered": true }),
            };
            if let Some(key) = &step.output_key {
                self.memory
                    .write()
                    .await
                    .insert(key.clone(), value.clone());
            }
            results.insert(step.id.clone(), value);
            debug!(workflow_id = %workflow.id, step = %step.id, agent_id = %agent_id, "workflow step done");
        }

        info!(workflow_id = %workflow.id, "workflow finished");
        Ok(results)
    }

    /// First idle agent in id order, for deterministic selection.
    async fn first_idle_agent(&self) -> Option<String> {
        let agents = self.agents.read().await;
        let mut ids: Vec<&String> = agents.keys().collect();
        ids.sort();
        for id in ids {
            if let Some(handle) = agents.get(id) {
                if *handle.status.read().await == AgentStatus::Idle {
                    return Some(id.clone());
                }
            }
        }
        None
    }

    // ========== Queries and controls ==========

    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let agents = self.agents.read().await;
        let mut infos = Vec::with_capacity(agents.len());
        for handle in agents.values() {
            infos.push(handle.info().await);
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn agent_info(&self, id: &str) -> Result<AgentInfo> {
        let handle = self
            .agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        Ok(handle.info().await)
    }

    pub async fn is_agent_ready(&self, id: &str) -> Result<bool> {
        let handle = self
            .agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        Ok(handle.readiness.is_ready())
    }

    pub async fn wait_for_agent_ready(&self, id: &str, timeout: Duration) -> Result<bool> {
        let handle = self
            .agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        Ok(handle.readiness.wait_ready(timeout).await)
    }

    pub async fn resize_agent(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let handle = self
            .agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        handle.process.resize(cols, rows).await
    }

    /// Administrative override for a stuck classifier: force it (and the
    /// coarse process state, when the name maps onto one) to `state`
    /// without touching the child.
    pub async fn reset_agent_state(&self, id: &str, state: &str) -> Result<()> {
        let handle = self
            .agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        handle.classifier.set_state(state);
        match state {
            "ready" => handle.process.set_state(ProcessState::Ready).await,
            "processing" => handle.process.set_state(ProcessState::Processing).await,
            "waiting" => handle.process.set_state(ProcessState::Waiting).await,
            "error" => handle.process.set_state(ProcessState::Error).await,
            _ => {}
        }
        *handle.status.write().await = if state == "error" {
            AgentStatus::Error
        } else {
            AgentStatus::Idle
        };
        info!(agent_id = %id, state = %state, "agent state reset");
        Ok(())
    }

    pub async fn recent_detections(&self, id: &str) -> Result<Vec<Detection>> {
        let handle = self
            .agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        Ok(handle.classifier.recent_detections())
    }

    pub async fn stats(&self) -> OrchestratorStats {
        let agents = self.agents.read().await;
        let mut stats = OrchestratorStats {
            total_agents: agents.len(),
            ..Default::default()
        };
        for handle in agents.values() {
            match *handle.status.read().await {
                AgentStatus::Idle => stats.idle_agents += 1,
                AgentStatus::Busy => stats.busy_agents += 1,
                AgentStatus::Error => stats.error_agents += 1,
                AgentStatus::Offline => stats.offline_agents += 1,
            }
            let metrics = handle.metrics.read().await;
            stats.tasks_completed += metrics.tasks_completed;
            stats.tasks_failed += metrics.tasks_failed;
        }
        stats
    }

    // ========== Shared memory ==========

    pub async fn save_to_memory(&self, key: &str, value: serde_json::Value) {
        self.memory.write().await.insert(key.to_string(), value);
    }

    pub async fn load_from_memory(&self, key: &str) -> Option<serde_json::Value> {
        self.memory.read().await.get(key).cloned()
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentKind, WorkflowStep};

    fn cat_config(id: &str) -> AgentConfig {
        AgentConfig {
            id: id.to_string(),
            name: format!("{id}-worker"),
            kind: AgentKind::Shell,
            command: "cat".to_string(),
            args: Vec::new(),
            cwd: None,
            env: None,
            tags: Vec::new(),
        }
    }

    /// An interactive shell that actually prints a prompt, unlike `cat`.
    fn shell_config(id: &str) -> AgentConfig {
        AgentConfig {
            command: "sh".to_string(),
            args: vec!["-i".to_string()],
            ..cat_config(id)
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_duplicate_id_rejected() {
        let orch = Orchestrator::new();
        orch.spawn_agent(cat_config("a1")).await.unwrap();
        let err = orch.spawn_agent(cat_config("a1")).await.unwrap_err();
        assert!(matches!(err, Error::AgentExists(_)));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_error() {
        let orch = Orchestrator::new();
        let mut events = orch.subscribe();
        let mut config = cat_config("broken");
        config.command = "definitely-not-a-real-binary-xyz".to_string();

        let err = orch.spawn_agent(config).await.unwrap_err();
        assert!(matches!(err, Error::SpawnFailure(_)));
        assert!(orch.list_agents().await.is_empty());

        let event = events.recv().await.unwrap();
        assert!(matches!(event, OrchestratorEvent::AgentError { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_inject_updates_metrics_and_emits_output() {
        let orch = Orchestrator::new();
        let mut events = orch.subscribe();
        orch.spawn_agent(cat_config("a1")).await.unwrap();

        orch.inject_to_agent("a1", "hello", InjectOptions::default())
            .await
            .unwrap();

        // Spawned event first, then echoed output.
        let mut saw_output = false;
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Ok(OrchestratorEvent::AgentOutput { agent_id, .. })) => {
                    assert_eq!(agent_id, "a1");
                    saw_output = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_output);

        let info = orch.agent_info("a1").await.unwrap();
        assert_eq!(info.metrics.tasks_completed, 1);
        assert_eq!(info.state, AgentStatus::Idle);
        assert_eq!(info.last_prompt.as_deref(), Some("hello"));
        orch.shutdown().await;
    }

    // The initial prompt arrives as the very first output chunk; it must
    // not be lost to a subscription that starts after the spawn.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_shell_becomes_ready() {
        let orch = Orchestrator::new();
        orch.spawn_agent(shell_config("sh1")).await.unwrap();

        assert!(orch
            .wait_for_agent_ready("sh1", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(orch.is_agent_ready("sh1").await.unwrap());
        orch.shutdown().await;
    }

    // The reply snapshot has to be taken after the prompt's output cycle,
    // not from the pre-delivery tail the fast already-ready path sees.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_reply_captured_after_prompt_returns() {
        let orch = Orchestrator::new();
        orch.spawn_agent(shell_config("sh1")).await.unwrap();
        assert!(orch
            .wait_for_agent_ready("sh1", Duration::from_secs(10))
            .await
            .unwrap());

        // The marker only exists in the output once the command has run;
        // the echoed command line spells it differently.
        let options = InjectOptions {
            wait_for_response: true,
            timeout_ms: Some(15_000),
            ..Default::default()
        };
        let reply = orch
            .inject_to_agent("sh1", "sleep 1 && echo rc_$((40+2))", options)
            .await
            .unwrap()
            .expect("reply should be captured");
        assert!(reply.contains("rc_42"), "reply was: {reply}");

        let info = orch.agent_info("sh1").await.unwrap();
        assert!(info.last_response.unwrap().contains("rc_42"));
        orch.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_workflow_explicit_agent_stores_result() {
        let orch = Orchestrator::new();
        orch.spawn_agent(cat_config("w1")).await.unwrap();

        let workflow = Workflow {
            id: "wf1".to_string(),
            name: "smoke".to_string(),
            steps: vec![WorkflowStep {
                id: "s1".to_string(),
                prompt: "hello".to_string(),
                agent: Some("w1".to_string()),
                depends_on: Vec::new(),
                retries: 0,
                output_key: Some("greeting".to_string()),
                timeout_ms: Some(400),
            }],
        };

        let results = orch.execute_workflow(&workflow).await.unwrap();
        assert!(results.contains_key("s1"));
        // cat never prints a prompt, so the step records delivery only.
        let stored = orch.load_from_memory("greeting").await.unwrap();
        assert_eq!(stored["delivered"], true);
        orch.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_workflow_aborts_without_idle_agent() {
        let orch = Orchestrator::new();
        orch.spawn_agent(cat_config("w1")).await.unwrap();
        {
            let agents = orch.agents.read().await;
            *agents.get("w1").unwrap().status.write().await = AgentStatus::Busy;
        }

        let workflow = Workflow {
            id: "wf2".to_string(),
            name: "starved".to_string(),
            steps: vec![WorkflowStep {
                id: "s1".to_string(),
                prompt: "hello".to_string(),
                agent: None,
                depends_on: Vec::new(),
                retries: 0,
                output_key: None,
                timeout_ms: Some(200),
            }],
        };

        let err = orch.execute_workflow(&workflow).await.unwrap_err();
        match err {
            Error::WorkflowStep { step, reason } => {
                assert_eq!(step, "s1");
                assert!(reason.contains("no suitable agent"));
            }
            other => panic!("unexpected error: {other}"),
        }
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_workflow_unmet_dependency() {
        let orch = Orchestrator::new();
        let workflow = Workflow {
            id: "wf3".to_string(),
            name: "deps".to_string(),
            steps: vec![WorkflowStep {
                id: "s2".to_string(),
                prompt: "hello".to_string(),
                agent: None,
                depends_on: vec!["s1".to_string()],
                retries: 0,
                output_key: None,
                timeout_ms: None,
            }],
        };

        let err = orch.execute_workflow(&workflow).await.unwrap_err();
        match err {
            Error::WorkflowStep { reason, .. } => assert!(reason.contains("unmet dependency")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_and_respawn_same_id() {
        let orch = Orchestrator::new();
        orch.spawn_agent(cat_config("a1")).await.unwrap();
        orch.terminate_agent("a1").await;
        assert!(orch.list_agents().await.is_empty());

        // Unknown id is a silent no-op.
        orch.terminate_agent("a1").await;

        orch.spawn_agent(cat_config("a1")).await.unwrap();
        assert_eq!(orch.list_agents().await.len(), 1);
        orch.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reset_agent_state_override() {
        let orch = Orchestrator::new();
        orch.spawn_agent(cat_config("a1")).await.unwrap();
        let handle = orch.agents.read().await.get("a1").cloned().unwrap();
        *handle.status.write().await = AgentStatus::Error;

        orch.reset_agent_state("a1", "ready").await.unwrap();
        assert_eq!(handle.status().await, AgentStatus::Idle);
        assert_eq!(handle.classifier.current_state(), "ready");
        assert_eq!(handle.process.state().await, ProcessState::Ready);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let orch = Orchestrator::new();
        orch.save_to_memory("key", serde_json::json!({"n": 7})).await;
        let value = orch.load_from_memory("key").await.unwrap();
        assert_eq!(value["n"], 7);
        assert!(orch.load_from_memory("missing").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stats_counts_statuses() {
        let orch = Orchestrator::new();
        orch.spawn_agent(cat_config("a1")).await.unwrap();
        orch.spawn_agent(cat_config("a2")).await.unwrap();

        let stats = orch.stats().await;
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.idle_agents, 2);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_agent_queries_fail() {
        let orch = Orchestrator::new();
        assert!(matches!(
            orch.agent_info("ghost").await.unwrap_err(),
            Error::AgentNotFound(_)
        ));
        assert!(matches!(
            orch.is_agent_ready("ghost").await.unwrap_err(),
            Error::AgentNotFound(_)
        ));
        assert!(matches!(
            orch.interrupt_agent("ghost").await.unwrap_err(),
            Error::AgentNotFound(_)
        ));
    }
}
