//! Worker Bridge
//!
//! Executes generation tasks in an isolated external runtime: one
//! short-lived Python process per invocation, exchanging a structured
//! JSON payload over stdout. Each child runs with a sanitized
//! environment, capped output capture, and a hard deadline that
//! force-terminates it.
//!
//! Every live child is tracked in an active-process registry so the
//! shutdown sweep can terminate all outstanding workers before exit.
//! The bridge itself enforces no cap on concurrent workers; admission
//! control upstream (the rate limiter) is the backpressure mechanism.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ChatError;

/// Worker bridge configuration
#[derive(Debug, Clone)]
pub struct WorkerBridgeConfig {
    /// Directory holding the worker scripts
    pub script_dir: PathBuf,
    /// Interpreter used to run them
    pub interpreter: String,
    /// Hard per-invocation deadline
    pub timeout: Duration,
    /// Maximum bytes captured per stream
    pub max_output_bytes: usize,
    /// Environment variables forwarded to the child; everything else is
    /// cleared
    pub env_passthrough: Vec<String>,
}

impl Default for WorkerBridgeConfig {
    fn default() -> Self {
        Self {
            script_dir: std::env::var("WORKER_SCRIPT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./python_scripts")),
            interpreter: std::env::var("WORKER_INTERPRETER")
                .unwrap_or_else(|_| "python3".to_string()),
            timeout: Duration::from_secs(
                std::env::var("WORKER_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            max_output_bytes: 1024 * 1024, // 1 MB
            env_passthrough: vec![
                "PATH".to_string(),
                "HOME".to_string(),
                "LANG".to_string(),
                "GOOGLE_API_KEY".to_string(),
                "OPENAI_API_KEY".to_string(),
                "DEEPSEEK_API_KEY".to_string(),
                "QDRANT_URL".to_string(),
                "QDRANT_API_KEY".to_string(),
                "QDRANT_COLLECTION_NAME".to_string(),
                "EMBEDDING_MODEL".to_string(),
            ],
        }
    }
}

/// Result of one worker invocation
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    /// Parsed stdout payload, if stdout was valid JSON
    pub payload: Option<serde_json::Value>,
    /// Raw captured stdout (fallback for scripts emitting plain text)
    pub raw_stdout: String,
    /// Captured stderr (diagnostics)
    pub stderr: String,
}

/// Subprocess executor with an active-process registry
pub struct WorkerBridge {
    config: WorkerBridgeConfig,
    active: Mutex<HashMap<u64, Child>>,
    next_id: AtomicU64,
}

impl WorkerBridge {
    /// Create the bridge. A missing script directory is an unrecoverable
    /// startup condition.
    pub fn new(config: WorkerBridgeConfig) -> Result<Self> {
        if !config.script_dir.is_dir() {
            anyhow::bail!(
                "Worker script directory does not exist: {}",
                config.script_dir.display()
            );
        }

        info!(
            "Worker bridge ready: {} via {} ({}s timeout)",
            config.script_dir.display(),
            config.interpreter,
            config.timeout.as_secs()
        );

        Ok(Self {
            config,
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn script_path(&self, script_id: &str) -> PathBuf {
        self.config.script_dir.join(format!("{}.py", script_id))
    }

    /// Number of currently tracked child processes
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Run one worker script to completion.
    ///
    /// Clean exit: stdout is parsed as JSON, falling back to raw text
    /// for scripts that emit unstructured output. Non-zero exit, spawn
    /// failure and deadline expiry map to their own error variants; in
    /// every case the child is removed from the registry.
    pub async fn execute(
        &self,
        script_id: &str,
        args: &[String],
    ) -> Result<WorkerOutput, ChatError> {
        let path = self.script_path(script_id);
        if !path.is_file() {
            return Err(ChatError::ScriptNotFound(script_id.to_string()));
        }

        let mut cmd = Command::new(&self.config.interpreter);
        cmd.arg(&path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .kill_on_drop(true);

        for var in &self.config.env_passthrough {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ChatError::WorkerSpawn(e.to_string()))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChatError::WorkerSpawn("stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ChatError::WorkerSpawn("stderr not captured".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.lock().await.insert(id, child);
        debug!("Worker {} started: {} {:?}", id, script_id, args);

        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let max_bytes = self.config.max_output_bytes;

        let capture = tokio::time::timeout_at(deadline, async {
            let stdout_buf = read_capped(&mut stdout, max_bytes).await;
            let stderr_buf = read_capped(&mut stderr, max_bytes / 4).await;
            (stdout_buf, stderr_buf)
        })
        .await;

        let (stdout_buf, stderr_buf) = match capture {
            Ok(bufs) => bufs,
            Err(_) => {
                self.kill_and_forget(id).await;
                warn!(
                    "Worker {} ({}) timed out after {}s",
                    id,
                    script_id,
                    self.config.timeout.as_secs()
                );
                return Err(ChatError::WorkerTimeout(self.config.timeout.as_secs()));
            }
        };

        // Reclaim the child; absence means the shutdown sweep got there first
        let child = self.active.lock().await.remove(&id);
        let mut child = match child {
            Some(child) => child,
            None => {
                return Err(ChatError::WorkerExit {
                    code: -1,
                    stderr: "worker terminated during shutdown".to_string(),
                })
            }
        };

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(ChatError::WorkerExit {
                    code: -1,
                    stderr: format!("wait failed: {}", e),
                })
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(ChatError::WorkerTimeout(self.config.timeout.as_secs()));
            }
        };

        let raw_stdout = String::from_utf8_lossy(&stdout_buf).to_string();
        let stderr_text = String::from_utf8_lossy(&stderr_buf).to_string();

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            warn!("Worker {} ({}) exited with code {}", id, script_id, code);
            return Err(ChatError::WorkerExit {
                code,
                stderr: stderr_text,
            });
        }

        let payload = serde_json::from_str::<serde_json::Value>(raw_stdout.trim()).ok();
        if payload.is_none() && !raw_stdout.trim().is_empty() {
            debug!("Worker {} stdout was not JSON, keeping raw text", id);
        }

        Ok(WorkerOutput {
            payload,
            raw_stdout,
            stderr: stderr_text,
        })
    }

    async fn kill_and_forget(&self, id: u64) {
        if let Some(mut child) = self.active.lock().await.remove(&id) {
            let _ = child.kill().await;
        }
    }

    /// Terminate every outstanding worker. Called on process shutdown.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        let count = active.len();
        for (id, mut child) in active.drain() {
            debug!("Killing worker {}", id);
            let _ = child.kill().await;
        }
        if count > 0 {
            info!("Terminated {} outstanding worker processes", count);
        }
    }
}

async fn read_capped<R: AsyncReadExt + Unpin>(reader: &mut R, max_bytes: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() + n <= max_bytes {
                    buf.extend_from_slice(&chunk[..n]);
                } else {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    buf
}
