//! Agent run execution.
//!
//! A run moves `Idle -> Starting -> Running` and ends in exactly one of
//! `Completed`, `Failed` or `Cancelled`. While running, messages are
//! forwarded to the caller in arrival order, file edits are published to the
//! project's event streams, and a heartbeat ticks every interval. A run whose
//! stream has been silent for `interval * missed_ticks_threshold` fails with a
//! timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sandbox_studio_agent_schema::{AgentMessage, FileTouch, RuntimeFrame};
use sandbox_studio_error::SandboxError;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use utoipa::ToSchema;

use crate::attachments::{attachment_client, download_images};
use crate::broadcaster::{FileChangeBroadcaster, FileChangeEvent, FileChangeKind};
use crate::hooks::{HookEvent, HookEventName, HookPipeline, HooksExecutionResult};
use crate::projects::ProjectLocks;
use crate::run_spec::{load_system_prompt, ExecutionSpec};
use crate::runtime::{AgentRuntime, FrameStream, StreamRequest};
use crate::sandbox::{SandboxHandle, SandboxSessionManager};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub heartbeat_interval: Duration,
    pub missed_ticks_threshold: u32,
    pub max_stream_retries: u32,
    /// First retry delay; doubles on every further retry.
    pub retry_backoff: Duration,
    /// How long cancellation waits for the remote process to stop.
    pub cancel_grace: Duration,
    /// Variables that must be present in `agent_env` before a run starts.
    pub required_env: Vec<String>,
    pub agent_env: BTreeMap<String, String>,
    pub default_model: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            missed_ticks_threshold: 3,
            max_stream_retries: 3,
            retry_backoff: Duration::from_millis(500),
            cancel_grace: Duration::from_secs(5),
            required_env: Vec::new(),
            agent_env: BTreeMap::new(),
            default_model: Some(DEFAULT_MODEL.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

/// Progress delivered to a run's consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunEvent {
    State { state: RunState },
    Message { message: AgentMessage },
    Heartbeat { tick: u64 },
}

/// One run to execute.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub project_id: String,
    pub sandbox_id: String,
    /// Project working tree, used by hooks that checkpoint.
    pub working_dir: String,
    pub spec: ExecutionSpec,
    pub hooks: HookPipeline,
}

/// Terminal result of a run.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: String,
    pub state: RunState,
    pub success: bool,
    pub messages: Vec<AgentMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HooksExecutionResult>,
    #[serde(skip)]
    pub failure: Option<SandboxError>,
}

impl RunOutcome {
    /// HTTP status for the outcome: 200 unless the run failed.
    pub fn status_code(&self) -> u16 {
        match (&self.failure, self.state) {
            (Some(err), _) => err.status_code(),
            (None, RunState::Failed) => 500,
            _ => 200,
        }
    }
}

enum StreamEnd {
    Completed,
    /// The agent reported its own failure; session-end hooks still run.
    AgentFailed(SandboxError),
    Failed(SandboxError),
    Cancelled,
}

struct RunTracker {
    run_id: String,
    state: RunState,
    messages: Vec<AgentMessage>,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl RunTracker {
    fn transition(&mut self, state: RunState) {
        debug!(run_id = %self.run_id, from = %self.state.as_str(), to = %state.as_str(), "run state");
        self.state = state;
        self.emit(RunEvent::State { state });
    }

    fn deliver(&mut self, message: AgentMessage) {
        self.messages.push(message.clone());
        self.emit(RunEvent::Message { message });
    }

    fn emit(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            // The consumer may have gone away; the run carries on.
            let _ = events.send(event);
        }
    }

    fn finish(
        mut self,
        state: RunState,
        failure: Option<SandboxError>,
        hooks: Option<HooksExecutionResult>,
    ) -> RunOutcome {
        self.transition(state);
        RunOutcome {
            run_id: self.run_id,
            state,
            success: state == RunState::Completed,
            messages: self.messages,
            error: failure.as_ref().map(|err| err.to_string()),
            hooks,
            failure,
        }
    }
}

#[derive(Debug)]
pub struct AgentExecutor {
    sessions: Arc<SandboxSessionManager>,
    runtime: Arc<dyn AgentRuntime>,
    broadcaster: Arc<FileChangeBroadcaster>,
    locks: Arc<ProjectLocks>,
    http: reqwest::Client,
    config: ExecutorConfig,
}

impl AgentExecutor {
    pub fn new(
        sessions: Arc<SandboxSessionManager>,
        runtime: Arc<dyn AgentRuntime>,
        broadcaster: Arc<FileChangeBroadcaster>,
        locks: Arc<ProjectLocks>,
        config: ExecutorConfig,
    ) -> Result<Self, SandboxError> {
        Ok(Self {
            sessions,
            runtime,
            broadcaster,
            locks,
            http: attachment_client()?,
            config,
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes one run to its terminal state. Never returns an error: every
    /// failure is reported on the outcome.
    pub async fn run(
        &self,
        ctx: RunContext,
        cancel: CancellationToken,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> RunOutcome {
        let span = info_span!(
            "agent.run",
            run_id = %ctx.run_id,
            project_id = %ctx.project_id,
            sandbox_id = %ctx.sandbox_id
        );
        self.run_inner(ctx, cancel, events).instrument(span).await
    }

    async fn run_inner(
        &self,
        ctx: RunContext,
        cancel: CancellationToken,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> RunOutcome {
        let _busy = self.locks.begin_run(&ctx.project_id);
        let mut run = RunTracker {
            run_id: ctx.run_id.clone(),
            state: RunState::Idle,
            messages: Vec::new(),
            events,
        };
        run.transition(RunState::Starting);

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("run cancelled before start");
                return run.finish(RunState::Cancelled, None, None);
            }
            started = self.start(&ctx) => started,
        };
        let (sandbox, request) = match started {
            Ok(started) => started,
            Err(err) => {
                warn!(error = %err, "run failed to start");
                return run.finish(RunState::Failed, Some(err), None);
            }
        };

        run.transition(RunState::Running);
        let end = self.stream(&sandbox, &request, &cancel, &mut run).await;

        let hook_event = |name: HookEventName, success: bool| HookEvent {
            name,
            cwd: ctx.spec.cwd.clone(),
            project_id: ctx.project_id.clone(),
            run_id: ctx.run_id.clone(),
            prompt: ctx.spec.prompt.clone(),
            success,
            sandbox: sandbox.clone(),
        };
        match end {
            StreamEnd::Completed => {
                info!(messages = run.messages.len(), "run completed");
                let hooks = ctx
                    .hooks
                    .run(&hook_event(HookEventName::SessionEnd, true), &cancel)
                    .await;
                run.finish(RunState::Completed, None, Some(hooks))
            }
            StreamEnd::AgentFailed(err) => {
                warn!(error = %err, "agent reported failure");
                let hooks = ctx
                    .hooks
                    .run(&hook_event(HookEventName::SessionEnd, false), &cancel)
                    .await;
                run.finish(RunState::Failed, Some(err), Some(hooks))
            }
            StreamEnd::Failed(err) => {
                warn!(error = %err, "run failed");
                self.stop_remote(&sandbox, &request).await;
                run.finish(RunState::Failed, Some(err), None)
            }
            StreamEnd::Cancelled => {
                info!("run cancelled");
                self.stop_remote(&sandbox, &request).await;
                let hooks = ctx
                    .hooks
                    .run(&hook_event(HookEventName::Cancelled, false), &cancel)
                    .await;
                run.finish(RunState::Cancelled, None, Some(hooks))
            }
        }
    }

    async fn start(&self, ctx: &RunContext) -> Result<(SandboxHandle, StreamRequest), SandboxError> {
        let sandbox = self
            .sessions
            .connect(&ctx.sandbox_id)
            .await?
            .with_working_dir(&ctx.working_dir);

        for name in &self.config.required_env {
            if !self.config.agent_env.contains_key(name) {
                return Err(SandboxError::configuration(format!(
                    "missing required environment variable {name}"
                )));
            }
        }
        let model = ctx
            .spec
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .ok_or_else(|| SandboxError::configuration("no model configured"))?;

        let system_prompt = load_system_prompt(&ctx.spec, &sandbox).await?;
        let image_paths =
            download_images(&self.http, &sandbox, &ctx.run_id, &ctx.spec.image_urls).await?;

        let request = StreamRequest {
            run_id: ctx.run_id.clone(),
            project_id: ctx.project_id.clone(),
            cwd: ctx.spec.cwd.clone(),
            prompt: ctx.spec.prompt.clone(),
            system_prompt,
            model,
            image_paths,
            env: self.config.agent_env.clone(),
        };
        Ok((sandbox, request))
    }

    async fn stream(
        &self,
        sandbox: &SandboxHandle,
        request: &StreamRequest,
        cancel: &CancellationToken,
        run: &mut RunTracker,
    ) -> StreamEnd {
        let period = self.config.heartbeat_interval;
        let stall_after = period * self.config.missed_ticks_threshold.max(1);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = 0u64;
        let mut last_frame = Instant::now();
        let mut delivered = 0usize;
        let mut retries = 0u32;
        let mut attempt = 0u32;

        loop {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                opened = self.runtime.open_stream(sandbox, request, attempt) => opened,
            };
            let mut frames: FrameStream = match opened {
                Ok(frames) => frames,
                Err(err) => match self.retry(err, &mut retries, cancel).await {
                    Ok(()) => {
                        attempt += 1;
                        continue;
                    }
                    Err(end) => return end,
                },
            };
            // Reopened streams replay from the start.
            let mut seen = 0usize;

            let failure = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return StreamEnd::Cancelled,
                    _ = ticker.tick() => {
                        tick += 1;
                        run.emit(RunEvent::Heartbeat { tick });
                        if last_frame.elapsed() >= stall_after {
                            return StreamEnd::Failed(SandboxError::Timeout {
                                message: format!(
                                    "no agent output for {}s",
                                    last_frame.elapsed().as_secs()
                                ),
                            });
                        }
                    }
                    frame = frames.next() => match frame {
                        Some(Ok(RuntimeFrame::Heartbeat)) => last_frame = Instant::now(),
                        Some(Ok(RuntimeFrame::Message(message))) => {
                            last_frame = Instant::now();
                            seen += 1;
                            if seen <= delivered {
                                continue;
                            }
                            delivered += 1;
                            self.publish_file_change(&request.project_id, &message);
                            let end = match &message {
                                AgentMessage::RunComplete { .. } => Some(StreamEnd::Completed),
                                AgentMessage::RunError { message } => Some(StreamEnd::AgentFailed(
                                    SandboxError::fatal_agent(message.clone()),
                                )),
                                _ => None,
                            };
                            run.deliver(message);
                            if let Some(end) = end {
                                return end;
                            }
                        }
                        Some(Err(err)) => break err,
                        None => break SandboxError::transient("agent stream closed before the run completed"),
                    },
                }
            };

            match self.retry(failure, &mut retries, cancel).await {
                Ok(()) => attempt += 1,
                Err(end) => return end,
            }
        }
    }

    /// Waits out the backoff for a retryable error, or returns how the run ends.
    async fn retry(
        &self,
        err: SandboxError,
        retries: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<(), StreamEnd> {
        if !err.is_retryable() || *retries >= self.config.max_stream_retries {
            return Err(StreamEnd::Failed(err));
        }
        *retries += 1;
        let delay = self.config.retry_backoff * 2u32.saturating_pow(*retries - 1);
        warn!(error = %err, retry = *retries, delay_ms = delay.as_millis() as u64, "agent stream interrupted; retrying");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamEnd::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn publish_file_change(&self, project_id: &str, message: &AgentMessage) {
        let Some((path, touch)) = message.touched_file() else {
            return;
        };
        let kind = match touch {
            FileTouch::Added => FileChangeKind::Added,
            FileTouch::Changed => FileChangeKind::Changed,
            FileTouch::Removed => FileChangeKind::Removed,
        };
        self.broadcaster.broadcast(
            project_id,
            &FileChangeEvent::new(project_id, kind, Some(path)),
        );
    }

    async fn stop_remote(&self, sandbox: &SandboxHandle, request: &StreamRequest) {
        match timeout(self.config.cancel_grace, self.runtime.cancel(sandbox, request)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to stop agent runner"),
            Err(_) => warn!(
                grace_ms = self.config.cancel_grace.as_millis() as u64,
                "agent runner did not stop within grace period"
            ),
        }
    }
}
