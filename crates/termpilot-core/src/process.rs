//! Process manager: owns and mediates all I/O with one PTY-backed child.
//!
//! Each instance wraps exactly one spawned process for its whole lifetime.
//! Output is fanned out over a broadcast channel in the order the OS
//! produces it; a bounded rolling buffer keeps only the most recent bytes
//! for diagnostic read-backs.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write as IoWrite};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::sanitize;

/// Default terminal dimensions.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Rolling output buffer capacity in bytes. Older output is discarded;
/// only recent context is needed for read-backs and reply capture.
const OUTPUT_BUFFER_MAX: usize = 64 * 1024;

/// Coarse process lifecycle state.
///
/// `Ready` and `Error` are entered on explicit external triggers (a
/// classifier deciding "ready", a fatal I/O error). `Terminated` is
/// terminal and irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Initializing,
    Ready,
    Processing,
    Waiting,
    Error,
    Terminated,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Initializing => "initializing",
            ProcessState::Ready => "ready",
            ProcessState::Processing => "processing",
            ProcessState::Waiting => "waiting",
            ProcessState::Error => "error",
            ProcessState::Terminated => "terminated",
        }
    }
}

/// Spawn configuration for the child process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for ProcessSpec {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            cwd: None,
            env: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// Snapshot of I/O counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetrics {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub commands_sent: u64,
    pub read_errors: u64,
    pub spawn_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
}

#[derive(Default)]
struct Counters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    commands_sent: AtomicU64,
    read_errors: AtomicU64,
    spawn_failures: AtomicU64,
}

/// Owns one PTY-backed child process: writes, reads, resizes, kills.
pub struct ProcessManager {
    spec: ProcessSpec,

    state: Arc<RwLock<ProcessState>>,
    spawned: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    pid: Arc<RwLock<Option<u32>>>,

    writer: Arc<Mutex<Option<Box<dyn IoWrite + Send>>>>,
    master: Arc<Mutex<Option<Box<dyn MasterPty + Send>>>>,
    killer: Arc<Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>>,

    // Most-recent-bytes rolling buffer, shared with the blocking read loop.
    output_buffer: Arc<std::sync::Mutex<VecDeque<u8>>>,

    counters: Arc<Counters>,
    started_at: Arc<RwLock<Option<i64>>>,
    ended_at: Arc<RwLock<Option<i64>>>,

    output_tx: broadcast::Sender<Vec<u8>>,
    state_tx: broadcast::Sender<ProcessState>,
}

impl ProcessManager {
    pub fn new(spec: ProcessSpec) -> Self {
        let (output_tx, _) = broadcast::channel(1024);
        let (state_tx, _) = broadcast::channel(64);

        Self {
            spec,
            state: Arc::new(RwLock::new(ProcessState::Initializing)),
            spawned: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            pid: Arc::new(RwLock::new(None)),
            writer: Arc::new(Mutex::new(None)),
            master: Arc::new(Mutex::new(None)),
            killer: Arc::new(Mutex::new(None)),
            output_buffer: Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(
                OUTPUT_BUFFER_MAX,
            ))),
            counters: Arc::new(Counters::default()),
            started_at: Arc::new(RwLock::new(None)),
            ended_at: Arc::new(RwLock::new(None)),
            output_tx,
            state_tx,
        }
    }

    // ========== Getters ==========

    pub async fn state(&self) -> ProcessState {
        *self.state.read().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn pid(&self) -> Option<u32> {
        *self.pid.read().await
    }

    pub async fn metrics(&self) -> ProcessMetrics {
        ProcessMetrics {
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            commands_sent: self.counters.commands_sent.load(Ordering::Relaxed),
            read_errors: self.counters.read_errors.load(Ordering::Relaxed),
            spawn_failures: self.counters.spawn_failures.load(Ordering::Relaxed),
            started_at: *self.started_at.read().await,
            ended_at: *self.ended_at.read().await,
        }
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    // ========== Lifecycle ==========

    /// Launch the configured command on a new PTY with the requested
    /// terminal dimensions and merged environment.
    pub async fn spawn(&self) -> Result<()> {
        if self.spawned.load(Ordering::SeqCst) {
            return Err(Error::SpawnFailure("process already spawned".to_string()));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: self.spec.rows,
                cols: self.spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| self.record_spawn_failure(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.spec.command);
        cmd.args(&self.spec.args);
        if let Some(cwd) = &self.spec.cwd {
            cmd.cwd(cwd);
        }
        // CommandBuilder starts with an empty env: copy the parent's, then
        // apply overrides, then force a sane TERM.
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        if let Some(env) = &self.spec.env {
            for (key, value) in env {
                cmd.env(key, value);
            }
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| self.record_spawn_failure(e.to_string()))?;

        let pid = child.process_id();
        *self.pid.write().await = pid;
        *self.started_at.write().await = Some(Utc::now().timestamp_millis());
        *self.killer.lock().await = Some(child.clone_killer());

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| self.record_spawn_failure(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| self.record_spawn_failure(e.to_string()))?;

        *self.writer.lock().await = Some(writer);
        *self.master.lock().await = Some(pair.master);

        self.spawned.store(true, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        info!(command = %self.spec.command, pid = ?pid, "process spawned");

        self.spawn_read_loop(reader);
        self.spawn_exit_watcher(child);

        Ok(())
    }

    fn record_spawn_failure(&self, reason: String) -> Error {
        self.counters.spawn_failures.fetch_add(1, Ordering::Relaxed);
        let state = Arc::clone(&self.state);
        let state_tx = self.state_tx.clone();
        tokio::spawn(async move {
            *state.write().await = ProcessState::Error;
            let _ = state_tx.send(ProcessState::Error);
        });
        error!(command = %self.spec.command, error = %reason, "spawn failed");
        Error::SpawnFailure(reason)
    }

    /// Bridge the blocking PTY reader onto the runtime. Chunks are appended
    /// to the rolling buffer and broadcast in OS order.
    fn spawn_read_loop(&self, reader: Box<dyn Read + Send>) {
        let running = Arc::clone(&self.running);
        let buffer = Arc::clone(&self.output_buffer);
        let counters = Arc::clone(&self.counters);
        let output_tx = self.output_tx.clone();

        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; 4096];

            while running.load(Ordering::SeqCst) {
                match reader.read(&mut buf) {
                    Ok(0) => break, // EOF
                    Ok(n) => {
                        let data = buf[..n].to_vec();
                        counters.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                        if let Ok(mut rb) = buffer.lock() {
                            rb.extend(&data);
                            if rb.len() > OUTPUT_BUFFER_MAX {
                                let drain = rb.len() - OUTPUT_BUFFER_MAX;
                                rb.drain(..drain);
                            }
                        }
                        let _ = output_tx.send(data);
                    }
                    Err(e) => {
                        counters.read_errors.fetch_add(1, Ordering::Relaxed);
                        if running.load(Ordering::SeqCst) {
                            error!(error = %e, "pty read error");
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Wait for child exit in the background: record the end time, move to
    /// `Terminated`, and release the writer so pending listeners unblock.
    fn spawn_exit_watcher(&self, child: Box<dyn portable_pty::Child + Send + Sync>) {
        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);
        let ended_at = Arc::clone(&self.ended_at);
        let writer = Arc::clone(&self.writer);
        let state_tx = self.state_tx.clone();

        tokio::spawn(async move {
            let exit_status = tokio::task::spawn_blocking(move || {
                let mut child = child;
                child.wait()
            })
            .await
            .ok()
            .and_then(|r| r.ok());

            let exit_code = exit_status.map(|s| s.exit_code()).unwrap_or(u32::MAX);

            running.store(false, Ordering::SeqCst);
            *ended_at.write().await = Some(Utc::now().timestamp_millis());
            *state.write().await = ProcessState::Terminated;
            *writer.lock().await = None;
            let _ = state_tx.send(ProcessState::Terminated);

            info!(exit_code = exit_code, "process exited");
        });
    }

    // ========== I/O ==========

    /// Write text to the PTY. Payloads containing a line terminator count
    /// as a command and move the coarse state to `Processing`.
    pub async fn write(&self, data: &str) -> Result<()> {
        if !self.spawned.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::AlreadyTerminated);
        }

        {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(Error::AlreadyTerminated)?;
            writer.write_all(data.as_bytes())?;
            writer.flush()?;
        }

        self.counters
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        if data.contains('\n') || data.contains('\r') {
            self.counters.commands_sent.fetch_add(1, Ordering::Relaxed);
            self.set_state(ProcessState::Processing).await;
        }

        debug!(len = data.len(), "wrote to pty");
        Ok(())
    }

    /// Resize the terminal. No-op with a warning before spawn.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let guard = self.master.lock().await;
        let Some(master) = guard.as_ref() else {
            warn!(cols = cols, rows = rows, "resize before spawn ignored");
            return Ok(());
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Pty(e.to_string()))
    }

    /// Request termination and release listeners.
    pub async fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(killer) = self.killer.lock().await.as_mut() {
            if let Err(e) = killer.kill() {
                debug!(error = %e, "kill signal delivery failed");
            }
        }
        *self.writer.lock().await = None;
        info!("process killed");
    }

    // ========== State ==========

    /// Set the coarse state. `Terminated` is never left once entered.
    pub async fn set_state(&self, new_state: ProcessState) {
        let mut state = self.state.write().await;
        if *state == ProcessState::Terminated || *state == new_state {
            return;
        }
        debug!(from = %state.as_str(), to = %new_state.as_str(), "process state change");
        *state = new_state;
        drop(state);
        let _ = self.state_tx.send(new_state);
    }

    /// External trigger from a classifier deciding the CLI is ready.
    pub async fn mark_ready(&self) {
        self.set_state(ProcessState::Ready).await;
    }

    /// External trigger on a fatal I/O or delivery error.
    pub async fn mark_error(&self) {
        self.set_state(ProcessState::Error).await;
    }

    // ========== Diagnostics ==========

    /// Tail of the rolling buffer split into lines. For debugging and
    /// snapshotting only; classification consumes the live stream.
    pub fn recent_output(&self, lines: usize) -> Vec<String> {
        let bytes: Vec<u8> = match self.output_buffer.lock() {
            Ok(buffer) => buffer.iter().copied().collect(),
            Err(_) => return Vec::new(),
        };
        let text = sanitize::sanitize(&bytes);
        let all: Vec<&str> = text.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].iter().map(|s| s.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(command: &str, args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_write_before_spawn_is_not_initialized() {
        let pm = ProcessManager::new(spec("cat", &[]));
        let err = pm.write("hello").await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
    }

    #[tokio::test]
    async fn test_resize_before_spawn_is_noop() {
        let pm = ProcessManager::new(spec("cat", &[]));
        pm.resize(120, 40).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_records_metric_and_error_state() {
        let pm = ProcessManager::new(spec("definitely-not-a-real-binary-xyz", &[]));
        let err = pm.spawn().await.unwrap_err();
        assert!(matches!(err, Error::SpawnFailure(_)));
        assert_eq!(pm.metrics().await.spawn_failures, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pm.state().await, ProcessState::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_write_read_kill() {
        let pm = ProcessManager::new(spec("cat", &[]));
        let mut rx = pm.subscribe_output();
        pm.spawn().await.unwrap();
        assert!(pm.is_running());
        assert!(pm.pid().await.is_some());

        pm.write("hello\n").await.unwrap();

        // The PTY echoes input; wait for any output.
        let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("expected echoed output")
            .unwrap();
        assert!(!chunk.is_empty());

        let metrics = pm.metrics().await;
        assert_eq!(metrics.bytes_written, 6);
        assert_eq!(metrics.commands_sent, 1);
        assert_eq!(pm.state().await, ProcessState::Processing);

        pm.kill().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = pm.write("more\n").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyTerminated));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recent_output_tail() {
        let pm = ProcessManager::new(spec("sh", &["-c", "printf 'a\\nb\\nc\\n'; sleep 5"]));
        pm.spawn().await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let tail = pm.recent_output(2);
        assert_eq!(tail, vec!["b".to_string(), "c".to_string()]);

        pm.kill().await;
    }

    #[tokio::test]
    async fn test_terminated_state_is_irreversible() {
        let pm = ProcessManager::new(spec("cat", &[]));
        pm.set_state(ProcessState::Terminated).await;
        pm.mark_ready().await;
        assert_eq!(pm.state().await, ProcessState::Terminated);
    }
}
