//! Agent runtime port.
//!
//! The runtime runs the coding agent inside the sandbox and exposes its output
//! as a stream of [`RuntimeFrame`]s. [`SandboxAgentRuntime`] launches the
//! runner in the background, appending JSON lines to a per-run log, and
//! follows that log. Re-opening the stream replays the log from the start.

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use sandbox_studio_agent_schema::{parse_frame_line, AgentMessage, RuntimeFrame};
use sandbox_studio_error::SandboxError;
use tracing::{debug, info, warn};

use crate::sandbox::{shell_quote, CommandRequest, SandboxHandle};

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<RuntimeFrame, SandboxError>> + Send>>;

const DEFAULT_RUNNER: &str = "claude";
const DEFAULT_LOG_DIR: &str = "/tmp/sandbox-studio/runs";
const DEFAULT_REMOTE_HEARTBEAT_SECS: u64 = 10;

/// Everything the runtime needs to start one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub run_id: String,
    pub project_id: String,
    pub cwd: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: String,
    /// Sandbox paths of downloaded image attachments.
    pub image_paths: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl StreamRequest {
    /// Prompt text with attachment paths appended.
    pub fn full_prompt(&self) -> String {
        if self.image_paths.is_empty() {
            return self.prompt.clone();
        }
        let mut prompt = self.prompt.clone();
        prompt.push_str("\n\nAttached images:");
        for path in &self.image_paths {
            prompt.push_str("\n- ");
            prompt.push_str(path);
        }
        prompt
    }
}

#[async_trait]
pub trait AgentRuntime: Send + Sync + std::fmt::Debug {
    /// Opens the frame stream for a run. `attempt` is 0 for the first open
    /// and increases for every reconnect after a transient failure.
    async fn open_stream(
        &self,
        sandbox: &SandboxHandle,
        request: &StreamRequest,
        attempt: u32,
    ) -> Result<FrameStream, SandboxError>;

    /// Stops the remote agent process for a run.
    async fn cancel(
        &self,
        sandbox: &SandboxHandle,
        request: &StreamRequest,
    ) -> Result<(), SandboxError>;
}

/// Runs a Claude Code compatible CLI inside the sandbox.
#[derive(Debug, Clone)]
pub struct SandboxAgentRuntime {
    runner_command: String,
    log_dir: String,
    remote_heartbeat_secs: u64,
}

impl Default for SandboxAgentRuntime {
    fn default() -> Self {
        Self::new(DEFAULT_RUNNER)
    }
}

impl SandboxAgentRuntime {
    pub fn new(runner_command: impl Into<String>) -> Self {
        Self {
            runner_command: runner_command.into(),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            remote_heartbeat_secs: DEFAULT_REMOTE_HEARTBEAT_SECS,
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<String>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    pub fn with_remote_heartbeat_secs(mut self, secs: u64) -> Self {
        self.remote_heartbeat_secs = secs.max(1);
        self
    }

    fn log_path(&self, run_id: &str) -> String {
        format!("{}/{run_id}.jsonl", self.log_dir.trim_end_matches('/'))
    }

    fn agent_command(&self, request: &StreamRequest) -> String {
        let mut args = vec![
            self.runner_command.clone(),
            "-p".to_string(),
            shell_quote(&request.full_prompt()),
            "--output-format stream-json --verbose".to_string(),
            "--model".to_string(),
            shell_quote(&request.model),
        ];
        if let Some(system_prompt) = &request.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(shell_quote(system_prompt));
        }
        args.join(" ")
    }

    /// Shell script that starts the agent, writes heartbeats while it is
    /// alive, and records a `runError` line if it exits non-zero.
    fn launch_script(&self, request: &StreamRequest) -> String {
        let log = shell_quote(&self.log_path(&request.run_id));
        let err = shell_quote(&format!("{}.stderr", self.log_path(&request.run_id)));
        let pid = shell_quote(&format!("{}.pid", self.log_path(&request.run_id)));
        [
            format!(
                "mkdir -p {} && cd {} || exit 1",
                shell_quote(&self.log_dir),
                shell_quote(&request.cwd)
            ),
            format!("{} >> {log} 2>> {err} &", self.agent_command(request)),
            "pid=$!".to_string(),
            format!("echo $pid > {pid}"),
            format!(
                "while kill -0 $pid 2>/dev/null; do printf '%s\\n' '{{\"type\":\"heartbeat\"}}' >> {log}; sleep {}; done",
                self.remote_heartbeat_secs
            ),
            format!(
                "wait $pid || printf '{{\"type\":\"runError\",\"message\":\"runner exited with status %s\"}}\\n' \"$?\" >> {log}"
            ),
        ]
        .join("\n")
    }
}

#[async_trait]
impl AgentRuntime for SandboxAgentRuntime {
    async fn open_stream(
        &self,
        sandbox: &SandboxHandle,
        request: &StreamRequest,
        attempt: u32,
    ) -> Result<FrameStream, SandboxError> {
        let log = self.log_path(&request.run_id);
        if attempt == 0 {
            let mut launch = CommandRequest::new(self.launch_script(request))
                .cwd(&request.cwd)
                .background();
            for (key, value) in &request.env {
                launch = launch.env(key, value);
            }
            sandbox.exec_checked(&launch).await?;
            info!(run_id = %request.run_id, sandbox_id = %sandbox.id, log = %log, "agent runner launched");
        } else {
            debug!(run_id = %request.run_id, attempt, "reopening agent log");
        }

        let follow = CommandRequest::new(format!("tail -n +1 -F {}", shell_quote(&log)))
            .cwd(&request.cwd);
        let lines = sandbox.exec_stream(&follow).await?;
        let run_id = request.run_id.clone();
        let frames = lines.flat_map(move |line| {
            let frames: Vec<Result<RuntimeFrame, SandboxError>> = match line {
                Ok(line) => match parse_frame_line(&line) {
                    Ok(frames) => frames.into_iter().map(Ok).collect(),
                    Err(err) => {
                        warn!(run_id = %run_id, error = %err, "skipping unreadable agent line");
                        Vec::new()
                    }
                },
                Err(err) => vec![Err(err)],
            };
            stream::iter(frames)
        });
        Ok(Box::pin(frames))
    }

    async fn cancel(
        &self,
        sandbox: &SandboxHandle,
        request: &StreamRequest,
    ) -> Result<(), SandboxError> {
        let pid = shell_quote(&format!("{}.pid", self.log_path(&request.run_id)));
        let command = format!(
            "[ -f {pid} ] && kill $(cat {pid}) 2>/dev/null; pkill -f {} || true",
            shell_quote(&request.run_id)
        );
        sandbox
            .exec_checked(&CommandRequest::new(command).cwd(&request.cwd))
            .await?;
        info!(run_id = %request.run_id, sandbox_id = %sandbox.id, "agent runner stopped");
        Ok(())
    }
}

/// One step of a scripted run.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Message(AgentMessage),
    Heartbeat,
    Sleep(Duration),
    Fail(SandboxError),
    /// Never yields again.
    Pending,
}

/// In-process runtime that replays scripted frames.
///
/// Each `open_stream` consumes the next queued script; once the queue is down
/// to one script that script is replayed for every later open. With no
/// scripts queued the runtime echoes the prompt and completes.
#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    requests: Mutex<Vec<(StreamRequest, u32)>>,
    cancelled: Mutex<Vec<String>>,
    opens: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, steps: Vec<ScriptStep>) -> Self {
        self.push_script(steps);
        self
    }

    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(steps);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(StreamRequest, u32)> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn next_script(&self, request: &StreamRequest) -> Vec<ScriptStep> {
        let mut scripts = self
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match scripts.len() {
            0 => vec![
                ScriptStep::Message(AgentMessage::AssistantText {
                    text: format!("received: {}", request.prompt),
                }),
                ScriptStep::Message(AgentMessage::RunComplete {
                    result: Some("done".to_string()),
                    duration_ms: None,
                }),
            ],
            1 => scripts.front().cloned().unwrap_or_default(),
            _ => scripts.pop_front().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn open_stream(
        &self,
        _sandbox: &SandboxHandle,
        request: &StreamRequest,
        attempt: u32,
    ) -> Result<FrameStream, SandboxError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((request.clone(), attempt));
        let steps = self.next_script(request);
        let frames = stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    ScriptStep::Message(message) => {
                        return Some((Ok(RuntimeFrame::Message(message)), steps))
                    }
                    ScriptStep::Heartbeat => return Some((Ok(RuntimeFrame::Heartbeat), steps)),
                    ScriptStep::Fail(err) => return Some((Err(err), steps)),
                    ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Pending => futures::future::pending::<()>().await,
                }
            }
        });
        Ok(Box::pin(frames))
    }

    async fn cancel(
        &self,
        _sandbox: &SandboxHandle,
        request: &StreamRequest,
    ) -> Result<(), SandboxError> {
        self.cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.run_id.clone());
        Ok(())
    }
}
