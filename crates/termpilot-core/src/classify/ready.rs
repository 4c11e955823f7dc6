//! Boolean readiness detection: is the CLI sitting at its input prompt?
//!
//! Unlike state classification this is a pure function of the trailing
//! output at each quiet period, so readiness can flip back off as soon
//! as the prompt scrolls away under new output.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::sanitize;

use super::patterns::ReadinessProfile;
use super::{Debouncer, DEBOUNCE_MS};

/// A readiness flip. Only transitions are broadcast, never repeats.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyTransition {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<String>,
    pub confidence: f64,
    pub timestamp: i64,
}

struct ReadyInner {
    profile: ReadinessProfile,
    registry: HashMap<String, ReadinessProfile>,
    buffer: String,
    ready: bool,
}

/// Prompt detector for one agent, parameterized by flavor profile.
pub struct ReadinessClassifier {
    inner: Arc<Mutex<ReadyInner>>,
    transition_tx: broadcast::Sender<ReadyTransition>,
    debouncer: Debouncer,
}

impl ReadinessClassifier {
    /// Unknown kinds fall back to the generic shell profile.
    pub fn new(kind: &str) -> Self {
        Self::with_quiet_period(kind, Duration::from_millis(DEBOUNCE_MS))
    }

    pub fn with_quiet_period(kind: &str, quiet: Duration) -> Self {
        let profile = ReadinessProfile::builtin(kind)
            .unwrap_or_else(|| ReadinessProfile::builtin("shell").expect("builtin shell profile"));

        let inner = Arc::new(Mutex::new(ReadyInner {
            profile,
            registry: HashMap::new(),
            buffer: String::new(),
            ready: false,
        }));
        let (transition_tx, _) = broadcast::channel(256);

        let eval_inner = Arc::clone(&inner);
        let tx = transition_tx.clone();
        let debouncer = Debouncer::new(quiet, move || {
            let Ok(mut inner) = eval_inner.lock() else {
                return;
            };
            let tail = sanitize::sanitize_tail(inner.buffer.as_bytes(), inner.profile.buffer_budget);
            let matched = inner.profile.find_match(&tail).map(|m| m.to_string());
            let now_ready = matched.is_some();
            if now_ready == inner.ready {
                return;
            }
            inner.ready = now_ready;
            debug!(ready = now_ready, kind = %inner.profile.kind, "readiness flip");
            let _ = tx.send(ReadyTransition {
                ready: now_ready,
                matched,
                confidence: inner.profile.confidence,
                timestamp: Utc::now().timestamp_millis(),
            });
        });

        Self {
            inner,
            transition_tx,
            debouncer,
        }
    }

    /// Feed a raw output chunk; evaluation happens after the quiet period.
    pub fn feed(&self, chunk: &[u8]) {
        let text = sanitize::sanitize(chunk);
        if let Ok(mut inner) = self.inner.lock() {
            inner.buffer.push_str(&text);
            let budget = inner.profile.buffer_budget;
            if inner.buffer.chars().count() > budget {
                inner.buffer = sanitize::sanitize_tail(inner.buffer.as_bytes(), budget);
            }
        }
        self.debouncer.ping();
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().map(|inner| inner.ready).unwrap_or(false)
    }

    /// Switch the active profile. Resets the buffer and readiness without
    /// emitting a transition.
    pub fn set_kind(&self, kind: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            let profile = inner
                .registry
                .get(kind)
                .cloned()
                .or_else(|| ReadinessProfile::builtin(kind));
            if let Some(profile) = profile {
                inner.profile = profile;
                inner.buffer.clear();
                inner.ready = false;
            }
        }
    }

    /// Install a custom profile, addressable by kind through `set_kind`.
    pub fn register_profile(&self, profile: ReadinessProfile) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.registry.insert(profile.kind.clone(), profile);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReadyTransition> {
        self.transition_tx.subscribe()
    }

    /// Subscribe-then-check wait: returns immediately if already ready,
    /// otherwise waits for the next transition to `true` within `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.transition_tx.subscribe();
        if self.is_ready() {
            return true;
        }
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn classifier(kind: &str) -> ReadinessClassifier {
        ReadinessClassifier::with_quiet_period(kind, Duration::from_millis(30))
    }

    #[tokio::test]
    async fn test_prompt_flips_ready() {
        let c = classifier("shell");
        let mut rx = c.subscribe();
        assert!(!c.is_ready());

        c.feed(b"user@host:~$ ");
        let transition = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(transition.ready);
        assert!(transition.matched.is_some());
        assert!(c.is_ready());
    }

    #[tokio::test]
    async fn test_output_after_prompt_flips_back() {
        let c = classifier("shell");
        c.feed(b"user@host:~$ ");
        assert!(c.wait_ready(Duration::from_secs(2)).await);

        c.feed(b"building project\nstep 1 of 3\n");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!c.is_ready());
    }

    #[tokio::test]
    async fn test_no_repeat_events_while_ready() {
        let c = classifier("shell");
        let mut rx = c.subscribe();
        c.feed(b"$ ");
        tokio::time::sleep(Duration::from_millis(100)).await;
        rx.recv().await.unwrap();

        c.feed(b"$ ");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_ready_immediate_and_timeout() {
        let c = classifier("shell");
        assert!(!c.wait_ready(Duration::from_millis(50)).await);

        c.feed(b"$ ");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(c.wait_ready(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_set_kind_resets_silently() {
        let c = classifier("shell");
        let mut rx = c.subscribe();
        c.feed(b"$ ");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(c.is_ready());
        let _ = rx.recv().await;

        c.set_kind("claude");
        assert!(!c.is_ready());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_custom_registered_profile() {
        let c = classifier("shell");
        c.register_profile(ReadinessProfile {
            kind: "repl".to_string(),
            buffer_budget: 512,
            confidence: 0.8,
            patterns: vec![Regex::new(r"(?m)^>>> $").unwrap()],
        });
        c.set_kind("repl");

        c.feed(b"Python 3.12\n>>> ");
        assert!(c.wait_ready(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_unknown_kind_falls_back_to_shell() {
        let c = classifier("mystery-cli");
        c.feed(b"$ ");
        assert!(c.wait_ready(Duration::from_secs(2)).await);
    }
}
