//! Semantic state classification over sanitized PTY output.
//!
//! Output chunks accumulate in a bounded tail buffer. Each chunk is
//! matched against prioritized pattern groups; the winning detection is
//! held pending and only committed after a quiet period, so mid-burst
//! flicker (spinner frames, partial lines) never surfaces.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::sanitize;

use super::patterns::{default_state_groups, PatternGroup};
use super::{Debouncer, DEBOUNCE_MS};

/// Trailing output kept for matching, in chars.
const BUFFER_MAX_CHARS: usize = 4096;

/// Context preceding the current chunk included when matching, so a
/// pattern split across a chunk boundary is still seen. Kept small: text
/// further back has already had its chance to match and must not
/// resurrect a state the stream has since moved past.
const BOUNDARY_OVERLAP_CHARS: usize = 256;

/// Detections kept for diagnostics.
const HISTORY_MAX: usize = 50;

/// One committed classification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub state: String,
    pub confidence: f64,
    pub pattern: String,
    pub matched: String,
    pub timestamp: i64,
}

struct StateInner {
    buffer: String,
    groups: Vec<PatternGroup>,
    current: String,
    pending: Option<Detection>,
    history: VecDeque<Detection>,
}

impl StateInner {
    /// Highest-priority group with a match against the text wins.
    /// Groups are kept sorted by descending priority.
    fn classify(&self, text: &str) -> Option<Detection> {
        for group in &self.groups {
            if let Some((pattern, matched)) = group.find_match(text) {
                return Some(Detection {
                    state: group.name.clone(),
                    confidence: group.confidence,
                    pattern: pattern.as_str().to_string(),
                    matched: matched.to_string(),
                    timestamp: Utc::now().timestamp_millis(),
                });
            }
        }
        None
    }
}

/// Debounced prioritized state classifier for one process's output.
pub struct StateClassifier {
    inner: Arc<Mutex<StateInner>>,
    commit_tx: broadcast::Sender<Detection>,
    debouncer: Debouncer,
}

impl StateClassifier {
    pub fn new() -> Self {
        Self::with_quiet_period(Duration::from_millis(DEBOUNCE_MS))
    }

    pub fn with_quiet_period(quiet: Duration) -> Self {
        let inner = Arc::new(Mutex::new(StateInner {
            buffer: String::new(),
            groups: default_state_groups(),
            current: "initializing".to_string(),
            pending: None,
            history: VecDeque::with_capacity(HISTORY_MAX),
        }));
        let (commit_tx, _) = broadcast::channel(256);

        let commit_inner = Arc::clone(&inner);
        let tx = commit_tx.clone();
        let debouncer = Debouncer::new(quiet, move || {
            let Ok(mut inner) = commit_inner.lock() else {
                return;
            };
            let Some(detection) = inner.pending.take() else {
                return;
            };
            if detection.state == inner.current {
                return;
            }
            debug!(
                from = %inner.current,
                to = %detection.state,
                matched = %detection.matched,
                "state detection committed"
            );
            inner.current = detection.state.clone();
            inner.history.push_back(detection.clone());
            if inner.history.len() > HISTORY_MAX {
                inner.history.pop_front();
            }
            let _ = tx.send(detection);
        });

        Self {
            inner,
            commit_tx,
            debouncer,
        }
    }

    /// Feed a raw output chunk. Matching runs against the sanitized chunk
    /// first, then against a bounded overlap window of the tail; the
    /// commit is deferred until the quiet period elapses.
    pub fn feed(&self, chunk: &[u8]) {
        let text = sanitize::sanitize(chunk);

        if let Ok(mut inner) = self.inner.lock() {
            inner.buffer.push_str(&text);
            if inner.buffer.chars().count() > BUFFER_MAX_CHARS {
                inner.buffer = sanitize::sanitize_tail(inner.buffer.as_bytes(), BUFFER_MAX_CHARS);
            }

            // Re-evaluated on every chunk so a detection invalidated by
            // newer output never commits. The fallback window covers the
            // chunk plus a bounded overlap, never the whole tail.
            let current = inner.current.clone();
            let window_chars = text.chars().count() + BOUNDARY_OVERLAP_CHARS;
            let skip = inner.buffer.chars().count().saturating_sub(window_chars);
            let window: String = inner.buffer.chars().skip(skip).collect();
            let detection = inner.classify(&text).or_else(|| inner.classify(&window));
            inner.pending = detection.filter(|d| d.state != current);
        }

        // Every chunk restarts the quiet window, match or not.
        self.debouncer.ping();
    }

    pub fn current_state(&self) -> String {
        self.inner
            .lock()
            .map(|inner| inner.current.clone())
            .unwrap_or_else(|_| "initializing".to_string())
    }

    /// Force the state without pattern evidence. Clears any pending
    /// detection so a stale match does not immediately override it.
    pub fn set_state(&self, state: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.current = state.to_string();
            inner.pending = None;
        }
    }

    /// Install a custom group, replacing any group with the same name.
    pub fn add_group(&self, group: PatternGroup) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.groups.retain(|g| g.name != group.name);
            inner.groups.push(group);
            inner.groups.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
    }

    pub fn remove_group(&self, name: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.groups.retain(|g| g.name != name);
        }
    }

    pub fn recent_detections(&self) -> Vec<Detection> {
        self.inner
            .lock()
            .map(|inner| inner.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Detection> {
        self.commit_tx.subscribe()
    }
}

impl Default for StateClassifier {
    fn default() -> Self {
        Self::new()
    }
}
