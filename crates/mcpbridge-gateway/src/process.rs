//! Spawning bridge-managed client processes
//!
//! A `ProcessSpawner` starts a command and reports its lifecycle as
//! `ProcessEvent`s. The bridge treats exit or spawn failure as transport loss
//! for the client it pre-registered for that process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Spawned { pid: u32 },
    /// `code` is `None` when the process was killed by a signal
    Exited { code: Option<i32> },
    Error { message: String },
}

/// A running child. Cancelling `kill` terminates it; `events` ends after exit.
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub events: mpsc::Receiver<ProcessEvent>,
    pub kill: CancellationToken,
}

impl ProcessHandle {
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, spec: ProcessSpec) -> Result<ProcessHandle>;
}

/// Spawner backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct TokioProcessSpawner;

impl TokioProcessSpawner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessSpawner for TokioProcessSpawner {
    async fn spawn(&self, spec: ProcessSpec) -> Result<ProcessHandle> {
        let command_path = which::which(&spec.command)
            .or_else(|_| which::which(format!("{}.exe", &spec.command)))
            .with_context(|| {
                format!(
                    "Command not found: {}. Ensure it's installed and in PATH.",
                    spec.command
                )
            })?;
        debug!(command = %spec.command, path = ?command_path, "[Process] Found command");

        let mut command = Command::new(&command_path);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn process: {}", spec.command))?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel(8);
        if let Some(pid) = pid {
            let _ = tx.try_send(ProcessEvent::Spawned { pid });
        }
        info!(command = %spec.command, pid = ?pid, "[Process] Spawned");

        if let Some(stderr) = child.stderr.take() {
            let command_name = spec.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(command = %command_name, "[Process] stderr: {}", line);
                }
            });
        }

        let kill = CancellationToken::new();
        let kill_signal = kill.clone();
        let command_name = spec.command;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.cancelled() => {
                    if let Err(e) = child.kill().await {
                        debug!(command = %command_name, error = %e, "[Process] Kill failed");
                    }
                    child.wait().await
                }
            };
            let event = match status {
                Ok(status) => {
                    info!(command = %command_name, code = ?status.code(), "[Process] Exited");
                    ProcessEvent::Exited {
                        code: status.code(),
                    }
                }
                Err(e) => {
                    error!(command = %command_name, error = %e, "[Process] Wait failed");
                    ProcessEvent::Error {
                        message: e.to_string(),
                    }
                }
            };
            let _ = tx.send(event).await;
        });

        Ok(ProcessHandle {
            pid,
            events: rx,
            kill,
        })
    }
}
