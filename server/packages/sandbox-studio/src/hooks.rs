//! Session hooks.
//!
//! Hooks are side effects run at the end of an agent run, in order, one at a
//! time. Later hooks may rely on files written by earlier ones. A hook can
//! stop the remaining hooks by returning [`HookDecision::Stop`]; a hook that
//! errors or panics is logged and treated as `Continue`.
//!
//! # Command hook environment
//!
//! Command hooks run inside the sandbox and receive:
//! - `SANDBOX_HOOK_TYPE` - `session_end` or `cancelled`
//! - `SANDBOX_HOOK_RUN_ID` - `<run id>-<event>-<position>`, unique per invocation
//! - `SANDBOX_PROJECT_ID`, `SANDBOX_RUN_ID`, `SANDBOX_ID`

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use sandbox_studio_error::SandboxError;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::checkpoint::CheckpointEngine;
use crate::sandbox::{tail, CommandRequest, SandboxHandle};

/// Default timeout for command hooks in seconds.
const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 30;

/// Maximum output size to capture from hooks (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

const COMMIT_SUBJECT_CHARS: usize = 72;

/// Definition of a shell command hook.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HookDefinition {
    /// Shell command to execute inside the sandbox.
    pub command: String,

    /// Timeout in seconds. Defaults to 30 seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Working directory. Defaults to the run's working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Whether later hooks still run if this one fails. Defaults to true.
    #[serde(default = "default_continue_on_failure")]
    pub continue_on_failure: bool,
}

fn default_continue_on_failure() -> bool {
    true
}

impl HookDefinition {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout_secs: None,
            working_dir: None,
            continue_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum HookEventName {
    SessionEnd,
    Cancelled,
}

impl HookEventName {
    /// Returns the string representation used in environment variables.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEventName::SessionEnd => "session_end",
            HookEventName::Cancelled => "cancelled",
        }
    }
}

/// What a hook is told about the run it belongs to.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub name: HookEventName,
    pub cwd: String,
    pub project_id: String,
    pub run_id: String,
    pub prompt: String,
    /// Whether the agent reported success.
    pub success: bool,
    pub sandbox: SandboxHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Continue,
    Stop { reason: String },
}

#[async_trait]
pub trait SessionHook: Send + Sync {
    fn name(&self) -> &str;

    fn handles(&self, event: HookEventName) -> bool {
        event == HookEventName::SessionEnd
    }

    async fn call(
        &self,
        event: &HookEvent,
        hook_run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<HookDecision, SandboxError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum HookOutcome {
    Continued,
    Stopped { reason: String },
    Failed { message: String },
    Panicked { message: String },
}

/// Result of executing a single hook.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HookResult {
    pub hook: String,
    pub hook_run_id: String,
    pub outcome: HookOutcome,
    pub duration_ms: u64,
}

/// Result of executing all hooks for a lifecycle event.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HooksExecutionResult {
    pub event: String,
    pub results: Vec<HookResult>,
    pub all_succeeded: bool,
    pub should_continue: bool,
}

/// Ordered hooks for one run.
#[derive(Clone, Default)]
pub struct HookPipeline {
    hooks: Vec<Arc<dyn SessionHook>>,
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Arc<dyn SessionHook>) {
        self.hooks.push(hook);
    }

    pub fn with(mut self, hook: Arc<dyn SessionHook>) -> Self {
        self.push(hook);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.iter().map(|hook| hook.name().to_string()).collect()
    }

    /// Runs every hook that handles `event.name`, strictly in order.
    pub async fn run(&self, event: &HookEvent, cancel: &CancellationToken) -> HooksExecutionResult {
        let mut results = Vec::new();
        let mut all_succeeded = true;
        let mut should_continue = true;

        let handling = self.hooks.iter().filter(|hook| hook.handles(event.name));
        for (position, hook) in handling.enumerate() {
            let hook_run_id = format!("{}-{}-{position}", event.run_id, event.name.as_str());
            let result = execute_single_hook(hook.as_ref(), event, &hook_run_id, cancel).await;
            match &result.outcome {
                HookOutcome::Continued => {}
                HookOutcome::Stopped { .. } => should_continue = false,
                HookOutcome::Failed { .. } | HookOutcome::Panicked { .. } => all_succeeded = false,
            }
            results.push(result);

            if !should_continue {
                break;
            }
        }

        HooksExecutionResult {
            event: event.name.as_str().to_string(),
            results,
            all_succeeded,
            should_continue,
        }
    }
}

async fn execute_single_hook(
    hook: &dyn SessionHook,
    event: &HookEvent,
    hook_run_id: &str,
    cancel: &CancellationToken,
) -> HookResult {
    let start = Instant::now();
    info!(
        hook = %hook.name(),
        hook_run_id = %hook_run_id,
        event = %event.name.as_str(),
        project_id = %event.project_id,
        "Executing hook"
    );

    let outcome = match AssertUnwindSafe(hook.call(event, hook_run_id, cancel))
        .catch_unwind()
        .await
    {
        Ok(Ok(HookDecision::Continue)) => HookOutcome::Continued,
        Ok(Ok(HookDecision::Stop { reason })) => {
            info!(hook = %hook.name(), hook_run_id = %hook_run_id, reason = %reason, "Hook stopped remaining hooks");
            HookOutcome::Stopped { reason }
        }
        Ok(Err(err)) => {
            warn!(hook = %hook.name(), hook_run_id = %hook_run_id, event = %event.name.as_str(), error = %err, "Hook failed");
            HookOutcome::Failed {
                message: err.to_string(),
            }
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(hook = %hook.name(), hook_run_id = %hook_run_id, event = %event.name.as_str(), panic = %message, "Hook panicked");
            HookOutcome::Panicked { message }
        }
    };

    HookResult {
        hook: hook.name().to_string(),
        hook_run_id: hook_run_id.to_string(),
        outcome,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs a shell command inside the sandbox.
#[derive(Debug, Clone)]
pub struct CommandHook {
    name: String,
    definition: HookDefinition,
    events: Vec<HookEventName>,
}

impl CommandHook {
    pub fn new(name: impl Into<String>, definition: HookDefinition) -> Self {
        Self {
            name: name.into(),
            definition,
            events: vec![HookEventName::SessionEnd],
        }
    }

    pub fn on(mut self, events: &[HookEventName]) -> Self {
        self.events = events.to_vec();
        self
    }
}

#[async_trait]
impl SessionHook for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, event: HookEventName) -> bool {
        self.events.contains(&event)
    }

    async fn call(
        &self,
        event: &HookEvent,
        hook_run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<HookDecision, SandboxError> {
        let timeout_duration = Duration::from_secs(
            self.definition
                .timeout_secs
                .unwrap_or(DEFAULT_HOOK_TIMEOUT_SECS),
        );
        let working_dir = self
            .definition
            .working_dir
            .clone()
            .unwrap_or_else(|| event.cwd.clone());
        let request = CommandRequest::new(self.definition.command.clone())
            .cwd(working_dir)
            .timeout_ms(timeout_duration.as_millis() as u64)
            .env("SANDBOX_HOOK_TYPE", event.name.as_str())
            .env("SANDBOX_HOOK_RUN_ID", hook_run_id)
            .env("SANDBOX_PROJECT_ID", event.project_id.clone())
            .env("SANDBOX_RUN_ID", event.run_id.clone())
            .env("SANDBOX_ID", event.sandbox.id.clone());

        let exec = timeout(timeout_duration, event.sandbox.exec(&request));
        // A cancelled run still runs its `cancelled` hooks to completion.
        let result = if event.name == HookEventName::Cancelled {
            exec.await
        } else {
            tokio::select! {
                result = exec => result,
                _ = cancel.cancelled() => {
                    debug!(hook = %self.name, hook_run_id = %hook_run_id, "Hook cancelled");
                    return Ok(HookDecision::Continue);
                }
            }
        };

        let failure = match result {
            Ok(Ok(output)) => {
                debug!(
                    hook = %self.name,
                    exit_code = output.exit_code,
                    stdout = %tail(&output.stdout, MAX_OUTPUT_SIZE),
                    stderr = %tail(&output.stderr, MAX_OUTPUT_SIZE),
                    "Hook output"
                );
                if output.success() {
                    return Ok(HookDecision::Continue);
                }
                SandboxError::internal(format!(
                    "`{}` exited with {}",
                    self.definition.command, output.exit_code
                ))
            }
            Ok(Err(err)) => err,
            Err(_) => SandboxError::Timeout {
                message: format!(
                    "`{}` exceeded {}s",
                    self.definition.command,
                    timeout_duration.as_secs()
                ),
            },
        };

        if self.definition.continue_on_failure {
            Err(failure)
        } else {
            Ok(HookDecision::Stop {
                reason: failure.to_string(),
            })
        }
    }
}

/// Runs the configured deploy command. Enabled per run by `withDeployHook`.
#[derive(Debug, Clone)]
pub struct DeployHook {
    inner: CommandHook,
}

impl DeployHook {
    pub fn new(definition: HookDefinition) -> Self {
        Self {
            inner: CommandHook::new("deploy", definition),
        }
    }
}

#[async_trait]
impl SessionHook for DeployHook {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn call(
        &self,
        event: &HookEvent,
        hook_run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<HookDecision, SandboxError> {
        if !event.success {
            debug!(hook_run_id = %hook_run_id, "Skipping deploy for failed run");
            return Ok(HookDecision::Continue);
        }
        self.inner.call(event, hook_run_id, cancel).await
    }
}

/// Commits the working tree after a successful run.
#[derive(Debug, Clone)]
pub struct CheckpointHook {
    engine: Arc<CheckpointEngine>,
    build_bundle: bool,
}

impl CheckpointHook {
    pub fn new(engine: Arc<CheckpointEngine>, build_bundle: bool) -> Self {
        Self {
            engine,
            build_bundle,
        }
    }
}

#[async_trait]
impl SessionHook for CheckpointHook {
    fn name(&self) -> &str {
        "checkpoint"
    }

    async fn call(
        &self,
        event: &HookEvent,
        hook_run_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<HookDecision, SandboxError> {
        if !event.success {
            debug!(hook_run_id = %hook_run_id, "Skipping checkpoint for failed run");
            return Ok(HookDecision::Continue);
        }
        let message = commit_message(&event.prompt);
        let result = if self.build_bundle {
            self.engine
                .create_commit_and_bundle(&event.project_id, &event.sandbox, &message)
                .await?
        } else {
            self.engine
                .create_commit(&event.project_id, &event.sandbox, &message)
                .await?
        };
        info!(
            hook_run_id = %hook_run_id,
            project_id = %event.project_id,
            commit_id = %result.commit.id,
            sha = %result.commit.github_sha,
            skipped = result.skipped,
            "Checkpoint created"
        );
        Ok(HookDecision::Continue)
    }
}

/// `Agent: <first line of the prompt>`, truncated to a commit subject.
pub fn commit_message(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or("").trim();
    let mut subject: String = first_line.chars().take(COMMIT_SUBJECT_CHARS).collect();
    if first_line.chars().count() > COMMIT_SUBJECT_CHARS {
        subject.push_str("...");
    }
    format!("Agent: {subject}")
}
