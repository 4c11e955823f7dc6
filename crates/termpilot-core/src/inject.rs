//! Input injection: a single FIFO queue feeding registered agents.
//!
//! One worker drains the queue in order. A failed delivery is retried
//! with backoff at the front of the queue, so ordering is preserved and
//! later requests wait out the retries of earlier ones.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::InjectOptions;

/// Delivery attempts per request: one initial try plus `MAX_RETRIES`.
pub const MAX_RETRIES: u32 = 3;

/// Default readiness wait when the caller sets no timeout.
const DEFAULT_READY_WAIT_MS: u64 = 30_000;

/// Destination for injected input. The orchestrator registers one sink
/// per agent; tests substitute fakes.
#[async_trait]
pub trait InputSink: Send + Sync {
    async fn write_input(&self, data: &str) -> Result<()>;

    /// Wait until the destination can accept a prompt. Sinks without a
    /// readiness signal accept immediately.
    async fn wait_ready(&self, _timeout: Duration) -> bool {
        true
    }
}

struct InjectionRequest {
    id: String,
    agent: String,
    payload: String,
    options: InjectOptions,
    attempt: u32,
    first_error: Option<String>,
    done: Option<oneshot::Sender<Result<()>>>,
}

/// Handle for one queued injection.
pub struct InjectionHandle {
    pub id: String,
    rx: oneshot::Receiver<Result<()>>,
    timeout: Option<Duration>,
}

impl InjectionHandle {
    /// Resolve the injection outcome, honoring the request timeout.
    pub async fn wait(self) -> Result<()> {
        let recv = async {
            self.rx
                .await
                .unwrap_or_else(|_| Err(Error::InjectionFailed {
                    retries: MAX_RETRIES,
                    reason: "injection worker dropped the request".to_string(),
                }))
        };
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, recv)
                .await
                .map_err(|_| Error::Timeout(format!("injection timed out after {timeout:?}")))?,
            None => recv.await,
        }
    }
}

/// FIFO input injector shared by all agents.
#[derive(Clone)]
pub struct Injector {
    sinks: Arc<RwLock<HashMap<String, Arc<dyn InputSink>>>>,
    queue_tx: mpsc::UnboundedSender<InjectionRequest>,
}

impl Injector {
    pub fn new() -> Self {
        let sinks: Arc<RwLock<HashMap<String, Arc<dyn InputSink>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let worker_sinks = Arc::clone(&sinks);
        tokio::spawn(Self::worker(worker_sinks, queue_rx));

        Self { sinks, queue_tx }
    }

    pub async fn register_agent(&self, id: &str, sink: Arc<dyn InputSink>) {
        self.sinks.write().await.insert(id.to_string(), sink);
    }

    pub async fn unregister_agent(&self, id: &str) {
        self.sinks.write().await.remove(id);
    }

    /// Enqueue input for an agent. The returned handle resolves when
    /// delivery succeeds or retries are exhausted.
    pub fn inject(&self, agent: &str, payload: &str, options: InjectOptions) -> InjectionHandle {
        let id = Uuid::new_v4().to_string();
        let (done_tx, done_rx) = oneshot::channel();
        let timeout = options.timeout_ms.map(Duration::from_millis);

        let request = InjectionRequest {
            id: id.clone(),
            agent: agent.to_string(),
            payload: payload.to_string(),
            options,
            attempt: 0,
            first_error: None,
            done: Some(done_tx),
        };
        debug!(injection_id = %id, agent = %agent, "injection queued");
        let _ = self.queue_tx.send(request);

        InjectionHandle {
            id,
            rx: done_rx,
            timeout,
        }
    }

    /// Single worker: strict FIFO, with retried requests re-queued at the
    /// front of a local backlog.
    async fn worker(
        sinks: Arc<RwLock<HashMap<String, Arc<dyn InputSink>>>>,
        mut queue_rx: mpsc::UnboundedReceiver<InjectionRequest>,
    ) {
        let mut backlog: VecDeque<InjectionRequest> = VecDeque::new();

        loop {
            let mut request = match backlog.pop_front() {
                Some(request) => request,
                None => match queue_rx.recv().await {
                    Some(request) => request,
                    None => return,
                },
            };

            let sink = sinks.read().await.get(&request.agent).cloned();
            // A missing sink is retryable: the agent may register before
            // the backoff expires.
            let outcome = match sink {
                Some(sink) => Self::deliver(&sink, &request).await,
                None => Err(Error::AgentNotFound(request.agent.clone())),
            };

            match outcome {
                Ok(()) => {
                    debug!(injection_id = %request.id, agent = %request.agent, "injection delivered");
                    Self::finish(&mut request, Ok(()));
                }
                Err(e) => {
                    if request.first_error.is_none() {
                        request.first_error = Some(e.to_string());
                    }
                    if request.attempt >= MAX_RETRIES {
                        let reason = request
                            .first_error
                            .take()
                            .unwrap_or_else(|| e.to_string());
                        warn!(
                            injection_id = %request.id,
                            agent = %request.agent,
                            retries = MAX_RETRIES,
                            error = %reason,
                            "injection failed, retries exhausted"
                        );
                        Self::finish(
                            &mut request,
                            Err(Error::InjectionFailed {
                                retries: MAX_RETRIES,
                                reason,
                            }),
                        );
                        continue;
                    }

                    request.attempt += 1;
                    let backoff = Self::backoff(request.attempt);
                    info!(
                        injection_id = %request.id,
                        agent = %request.agent,
                        attempt = request.attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "injection delivery failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backlog.push_front(request);
                }
            }
        }
    }

    /// 2s * attempt, capped at 5s, plus up to 250ms of jitter.
    fn backoff(attempt: u32) -> Duration {
        let base = (2000u64 * attempt as u64).min(5000);
        let jitter = rand::thread_rng().gen_range(0..=250);
        Duration::from_millis(base + jitter)
    }

    async fn deliver(sink: &Arc<dyn InputSink>, request: &InjectionRequest) -> Result<()> {
        let options = &request.options;

        if options.wait_for_ready {
            let wait = options
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(DEFAULT_READY_WAIT_MS));
            if !sink.wait_ready(wait).await {
                return Err(Error::Timeout(format!(
                    "agent {} not ready within {wait:?}",
                    request.agent
                )));
            }
        }

        if options.raw {
            return sink.write_input(&request.payload).await;
        }

        let mut payload = request.payload.clone();
        if options.confirm_with_enter && !payload.ends_with('\n') && !payload.ends_with('\r') {
            payload.push('\r');
        }

        if options.human_like {
            Self::type_human(sink, &payload, options.chars_per_minute).await
        } else {
            sink.write_input(&payload).await
        }
    }

    /// Per-character delivery paced at roughly `cpm` characters per
    /// minute, each delay jittered by ±30%.
    async fn type_human(sink: &Arc<dyn InputSink>, payload: &str, cpm: u32) -> Result<()> {
        let base_ms = 60_000.0 / cpm.max(1) as f64;
        for ch in payload.chars() {
            sink.write_input(&ch.to_string()).await?;
            let factor: f64 = rand::thread_rng().gen_range(0.7..=1.3);
            tokio::time::sleep(Duration::from_millis((base_ms * factor) as u64)).await;
        }
        Ok(())
    }

    fn finish(request: &mut InjectionRequest, outcome: Result<()>) {
        if let Some(done) = request.done.take() {
            let _ = done.send(outcome);
        }
    }
}

impl Default for Injector {
    fn default() -> Self {
        Self::new()
    }
}
