// Scripted Gateway - Command Execution
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Named project commands, streamed as they run.
//
// State machine per execution:
//   Pending -> Running -> Completed | Failed | Cancelled
//
// Output travels through a bounded channel: a slow consumer suspends the
// producer instead of growing a buffer. The terminal event is always last.
// Dropping the Execution handle cancels it.

use crate::confine;
use crate::error::{GatewayError, GatewayResult};
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// PROJECT COMMANDS
// ============================================================================

/// One entry of the project's command file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CommandFile {
    #[serde(default)]
    commands: BTreeMap<String, CommandSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSummary {
    pub name: String,
    pub description: Option<String>,
}

// ============================================================================
// EXECUTION STATE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Running,
    Completed { code: i32 },
    Failed { code: Option<i32>, reason: String },
    Cancelled { reason: String },
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed { .. } | ExecutionState::Failed { .. } | ExecutionState::Cancelled { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    Output(Bytes),
    /// Always terminal, always last
    Finished(ExecutionState),
}

impl ExecutionEvent {
    /// One newline-terminated JSON frame of the console stream
    pub fn to_frame(&self) -> Bytes {
        let value = match self {
            ExecutionEvent::Output(chunk) => match std::str::from_utf8(chunk) {
                Ok(text) => json!({ "type": "output", "data": text }),
                Err(_) => json!({
                    "type": "output",
                    "base64": base64::engine::general_purpose::STANDARD.encode(chunk),
                }),
            },
            ExecutionEvent::Finished(state) => {
                let (code, reason) = match state {
                    ExecutionState::Completed { code } => (Some(*code), None),
                    ExecutionState::Failed { code, reason } => (*code, Some(reason.as_str())),
                    ExecutionState::Cancelled { reason } => (None, Some(reason.as_str())),
                    ExecutionState::Pending | ExecutionState::Running => (None, None),
                };
                let state = match state {
                    ExecutionState::Pending => "pending",
                    ExecutionState::Running => "running",
                    ExecutionState::Completed { .. } => "completed",
                    ExecutionState::Failed { .. } => "failed",
                    ExecutionState::Cancelled { .. } => "cancelled",
                };
                json!({ "type": "exit", "state": state, "code": code, "reason": reason })
            }
        };
        let mut line = value.to_string();
        line.push('\n');
        Bytes::from(line)
    }
}

// ============================================================================
// RUNNER SEAM
// ============================================================================

#[derive(Debug, Error)]
#[error("console consumer is gone")]
pub struct SinkClosed;

/// Producer side of an execution. Not Clone: nothing outlives the runner.
pub struct ChunkSink {
    tx: mpsc::Sender<ExecutionEvent>,
}

impl ChunkSink {
    /// Suspends while the consumer's buffer is full.
    pub async fn send(&mut self, chunk: impl Into<Bytes>) -> Result<(), SinkClosed> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx.send(ExecutionEvent::Output(chunk)).await.map_err(|_| SinkClosed)
    }
}

/// Runs one command to completion, writing output into `sink`.
/// Returns the exit code. The future may be dropped at any await point.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &CommandSpec,
        cwd: &Path,
        sink: &mut ChunkSink,
        cancel: CancellationToken,
    ) -> anyhow::Result<i32>;
}

/// Spawns the program in the project root. stdout and stderr are
/// interleaved in arrival order.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

const READ_CHUNK: usize = 8 * 1024;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        command: &CommandSpec,
        cwd: &Path,
        sink: &mut ChunkSink,
        cancel: CancellationToken,
    ) -> anyhow::Result<i32> {
        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", command.program))?;

        let mut stdout = child.stdout.take().context("stdout not captured")?;
        let mut stderr = child.stderr.take().context("stderr not captured")?;
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let (mut out_open, mut err_open) = (true, true);

        while out_open || err_open {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    anyhow::bail!("cancelled");
                }
                n = stdout.read(&mut out_buf), if out_open => {
                    let n = n?;
                    if n == 0 {
                        out_open = false;
                    } else {
                        sink.send(Bytes::copy_from_slice(&out_buf[..n])).await?;
                    }
                }
                n = stderr.read(&mut err_buf), if err_open => {
                    let n = n?;
                    if n == 0 {
                        err_open = false;
                    } else {
                        sink.send(Bytes::copy_from_slice(&err_buf[..n])).await?;
                    }
                }
            }
        }

        let status = child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

// ============================================================================
// EXECUTION HANDLE
// ============================================================================

/// Consumer side of a running command.
pub struct Execution {
    rx: mpsc::Receiver<ExecutionEvent>,
    cancel: CancellationToken,
    state: ExecutionState,
}

impl Execution {
    /// Last state this consumer observed
    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    /// Stop delivery. Chunks still buffered are discarded; only the
    /// terminal event follows.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next event in production order. None once the terminal event was seen.
    pub async fn next(&mut self) -> Option<ExecutionEvent> {
        if self.state.is_terminal() {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Some(ExecutionEvent::Output(chunk)) => {
                    if self.cancel.is_cancelled() {
                        continue;
                    }
                    self.state = ExecutionState::Running;
                    return Some(ExecutionEvent::Output(chunk));
                }
                Some(ExecutionEvent::Finished(state)) => {
                    self.state = state.clone();
                    return Some(ExecutionEvent::Finished(state));
                }
                None => {
                    let state = ExecutionState::Failed { code: None, reason: "execution aborted".to_string() };
                    self.state = state.clone();
                    return Some(ExecutionEvent::Finished(state));
                }
            }
        }
    }

    /// Stream of events; dropping the stream cancels the execution.
    pub fn into_stream(mut self) -> impl Stream<Item = ExecutionEvent> + Send + 'static {
        async_stream::stream! {
            while let Some(event) = self.next().await {
                yield event;
            }
        }
    }
}

impl Drop for Execution {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// COMMAND SERVICE
// ============================================================================

pub struct CommandService {
    runner: Arc<dyn CommandRunner>,
    commands_file: String,
    buffer: usize,
    timeout: Option<Duration>,
}

impl CommandService {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        commands_file: impl Into<String>,
        buffer: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self { runner, commands_file: commands_file.into(), buffer: buffer.max(1), timeout }
    }

    /// Commands defined for a project, sorted by name
    pub async fn list(&self, root: &Path) -> GatewayResult<Vec<CommandSummary>> {
        let commands = self.load(root).await?;
        Ok(commands
            .into_iter()
            .map(|(name, command)| CommandSummary { name, description: command.description })
            .collect())
    }

    /// Validate `name` and start it. Unknown names never reach Running.
    pub async fn start(&self, root: &Path, name: &str) -> GatewayResult<Execution> {
        let mut commands = self.load(root).await?;
        let command = commands
            .remove(name)
            .ok_or_else(|| GatewayError::CommandUndefined(name.to_string()))?;

        let cwd = confine::resolve_async(root.to_path_buf(), String::new()).await?;
        let cwd = cwd.absolute().to_path_buf();

        let (tx, rx) = mpsc::channel(self.buffer);
        let cancel = CancellationToken::new();

        log::info!("Command '{}' starting in {:?}", name, cwd);
        tokio::spawn(drive(
            Arc::clone(&self.runner),
            name.to_string(),
            command,
            cwd,
            tx,
            cancel.clone(),
            self.timeout,
        ));

        Ok(Execution { rx, cancel, state: ExecutionState::Pending })
    }

    async fn load(&self, root: &Path) -> GatewayResult<BTreeMap<String, CommandSpec>> {
        let path = confine::resolve_async(root.to_path_buf(), self.commands_file.clone()).await?;
        let content = match tokio::fs::read_to_string(path.absolute()).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<CommandFile>(&content) {
            Ok(file) => Ok(file.commands),
            Err(e) => {
                log::warn!("Ignoring malformed command file {:?}: {}", path.relative(), e);
                Ok(BTreeMap::new())
            }
        }
    }
}

async fn drive(
    runner: Arc<dyn CommandRunner>,
    name: String,
    command: CommandSpec,
    cwd: PathBuf,
    tx: mpsc::Sender<ExecutionEvent>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) {
    let mut sink = ChunkSink { tx: tx.clone() };

    let outcome = {
        let run = runner.run(&command, &cwd, &mut sink, cancel.clone());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => ExecutionState::Cancelled { reason: "cancelled".to_string() },
            _ = deadline(timeout) => ExecutionState::Cancelled { reason: "timed out".to_string() },
            result = run => match result {
                Ok(0) => ExecutionState::Completed { code: 0 },
                Ok(code) => ExecutionState::Failed {
                    code: Some(code),
                    reason: format!("exited with status {}", code),
                },
                Err(e) => ExecutionState::Failed { code: None, reason: e.to_string() },
            },
        }
    };
    // Runner future is gone; nothing can emit after this point
    drop(sink);

    match &outcome {
        ExecutionState::Completed { .. } => log::info!("Command '{}' completed", name),
        other => log::warn!("Command '{}' ended: {:?}", name, other),
    }
    let _ = tx.send(ExecutionEvent::Finished(outcome)).await;
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

// ============================================================================
// TESTS
// ============================================================================
