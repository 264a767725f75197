//! Sandbox session management.
//!
//! A sandbox is a remote, isolated execution environment that hosts a
//! project's working tree. This module owns the local bookkeeping for the
//! sandboxes the server talks to and the [`SandboxProvider`] port through
//! which every remote operation goes.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::Stream;
use sandbox_studio_error::SandboxError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

mod http;
mod memory;

pub use http::HttpSandboxProvider;
pub use memory::{CommandHandler, MemorySandboxProvider};

/// Lines of stdout produced by a streaming command.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, SandboxError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum SandboxStatus {
    Active,
    Paused,
    Destroyed,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Active => "active",
            SandboxStatus::Paused => "paused",
            SandboxStatus::Destroyed => "destroyed",
        }
    }
}

/// What the provider reports about a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub status: SandboxStatus,
    pub timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub working_dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Detach the command and return as soon as it has been started.
    #[serde(default)]
    pub background: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Remote control plane for sandboxes.
#[async_trait]
pub trait SandboxProvider: Send + Sync + std::fmt::Debug {
    async fn get_sandbox(&self, sandbox_id: &str) -> Result<SandboxInfo, SandboxError>;

    /// Pauses the sandbox and returns the id to resume it under.
    async fn pause(&self, sandbox_id: &str) -> Result<String, SandboxError>;

    async fn resume(&self, sandbox_id: &str) -> Result<SandboxInfo, SandboxError>;

    async fn exec(
        &self,
        sandbox_id: &str,
        request: &CommandRequest,
    ) -> Result<CommandOutput, SandboxError>;

    async fn exec_stream(
        &self,
        sandbox_id: &str,
        request: &CommandRequest,
    ) -> Result<LineStream, SandboxError>;

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, SandboxError>;

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), SandboxError>;

    /// Absolute paths of every regular file below `dir`.
    async fn list_files(&self, sandbox_id: &str, dir: &str) -> Result<Vec<String>, SandboxError>;
}

/// A connected sandbox. Cheap to clone; every call goes through the provider.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub id: String,
    pub working_dir: String,
    pub timeout_ms: u64,
    pub request_timeout_ms: u64,
    provider: Arc<dyn SandboxProvider>,
}

impl SandboxHandle {
    pub fn new(info: &SandboxInfo, provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            id: info.sandbox_id.clone(),
            working_dir: info.working_dir.clone(),
            timeout_ms: info.timeout_ms,
            request_timeout_ms: info.request_timeout_ms,
            provider,
        }
    }

    /// Same sandbox, rooted at a different directory.
    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    pub async fn exec(&self, request: &CommandRequest) -> Result<CommandOutput, SandboxError> {
        let mut request = request.clone();
        if request.timeout_ms.is_none() && self.request_timeout_ms > 0 {
            request.timeout_ms = Some(self.request_timeout_ms);
        }
        self.provider.exec(&self.id, &request).await
    }

    /// Runs a command and turns a non-zero exit into an error.
    pub async fn exec_checked(
        &self,
        request: &CommandRequest,
    ) -> Result<CommandOutput, SandboxError> {
        let output = self.exec(request).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(SandboxError::internal(format!(
                "`{}` exited with {}: {}",
                request.command,
                output.exit_code,
                tail(&output.stderr, 512)
            )))
        }
    }

    pub async fn exec_stream(&self, request: &CommandRequest) -> Result<LineStream, SandboxError> {
        self.provider.exec_stream(&self.id, request).await
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.provider.read_file(&self.id, path).await
    }

    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        self.provider.write_file(&self.id, path, contents).await
    }

    pub async fn list_files(&self, dir: &str) -> Result<Vec<String>, SandboxError> {
        self.provider.list_files(&self.id, dir).await
    }

    /// Resolves `path` against `cwd` unless it is already absolute.
    pub fn resolve_path(cwd: &str, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", cwd.trim_end_matches('/'), path)
        }
    }
}

/// Local bookkeeping for a sandbox the server has touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRecord {
    pub sandbox_id: String,
    pub status: SandboxStatus,
    pub working_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Liveness {
    pub alive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PauseOutcome {
    pub sandbox_id: String,
    /// Set when the remote pause failed and only local state was updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat: Option<String>,
}

#[derive(Debug)]
pub struct SandboxSessionManager {
    provider: Arc<dyn SandboxProvider>,
    records: Mutex<HashMap<String, SandboxRecord>>,
}

impl SandboxSessionManager {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            provider,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> Arc<dyn SandboxProvider> {
        self.provider.clone()
    }

    /// Attaches to an existing sandbox. Paused sandboxes are resumed.
    pub async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle, SandboxError> {
        let info = self.provider.get_sandbox(sandbox_id).await?;
        let info = match info.status {
            SandboxStatus::Active => info,
            SandboxStatus::Paused => {
                info!(sandbox_id = %sandbox_id, "resuming paused sandbox on connect");
                self.provider.resume(sandbox_id).await?
            }
            SandboxStatus::Destroyed => {
                self.forget(sandbox_id);
                return Err(SandboxError::not_found("sandbox", sandbox_id));
            }
        };
        debug!(sandbox_id = %info.sandbox_id, working_dir = %info.working_dir, "sandbox connected");
        self.remember(&info.sandbox_id, SandboxStatus::Active, &info.working_dir);
        Ok(SandboxHandle::new(&info, self.provider.clone()))
    }

    /// Pauses a sandbox. A provider failure is logged and reported as a
    /// caveat; local bookkeeping is marked paused either way.
    pub async fn pause(&self, handle: &SandboxHandle) -> PauseOutcome {
        self.pause_known(&handle.id, &handle.working_dir).await
    }

    /// Pauses a sandbox by id without resuming it first, so pausing a paused
    /// sandbox stays paused. Fails only when the sandbox is unknown to both
    /// the provider and local bookkeeping, or has been destroyed.
    pub async fn pause_id(&self, sandbox_id: &str) -> Result<PauseOutcome, SandboxError> {
        let working_dir = match self.provider.get_sandbox(sandbox_id).await {
            Ok(info) if info.status == SandboxStatus::Destroyed => {
                self.forget(sandbox_id);
                return Err(SandboxError::not_found("sandbox", sandbox_id));
            }
            Ok(info) => info.working_dir,
            Err(err) => match self.record(sandbox_id) {
                Some(record) => {
                    debug!(sandbox_id = %sandbox_id, error = %err, "sandbox lookup failed; using remembered working dir");
                    record.working_dir
                }
                None => return Err(err),
            },
        };
        Ok(self.pause_known(sandbox_id, &working_dir).await)
    }

    async fn pause_known(&self, sandbox_id: &str, working_dir: &str) -> PauseOutcome {
        match self.provider.pause(sandbox_id).await {
            Ok(new_id) => {
                if new_id != sandbox_id {
                    self.forget(sandbox_id);
                }
                self.remember(&new_id, SandboxStatus::Paused, working_dir);
                info!(sandbox_id = %sandbox_id, new_sandbox_id = %new_id, "sandbox paused");
                PauseOutcome {
                    sandbox_id: new_id,
                    caveat: None,
                }
            }
            Err(err) => {
                warn!(sandbox_id = %sandbox_id, error = %err, "sandbox pause failed; marking paused locally");
                self.remember(sandbox_id, SandboxStatus::Paused, working_dir);
                PauseOutcome {
                    sandbox_id: sandbox_id.to_string(),
                    caveat: Some(err.to_string()),
                }
            }
        }
    }

    pub async fn resume(&self, sandbox_id: &str) -> Result<SandboxHandle, SandboxError> {
        let info = self.provider.resume(sandbox_id).await?;
        self.remember(&info.sandbox_id, SandboxStatus::Active, &info.working_dir);
        info!(sandbox_id = %info.sandbox_id, "sandbox resumed");
        Ok(SandboxHandle::new(&info, self.provider.clone()))
    }

    /// Never fails: every provider error becomes `alive: false` with a reason.
    pub async fn check_alive(&self, sandbox_id: &str) -> Liveness {
        match self.provider.get_sandbox(sandbox_id).await {
            Ok(info) => match info.status {
                SandboxStatus::Active => Liveness {
                    alive: true,
                    reason: None,
                },
                status => {
                    self.remember(sandbox_id, status, &info.working_dir);
                    Liveness {
                        alive: false,
                        reason: Some(status.as_str().to_string()),
                    }
                }
            },
            Err(err) => {
                if err.is_not_found() {
                    self.forget(sandbox_id);
                }
                debug!(sandbox_id = %sandbox_id, error = %err, "sandbox liveness probe failed");
                Liveness {
                    alive: false,
                    reason: Some(err.to_string()),
                }
            }
        }
    }

    pub fn record(&self, sandbox_id: &str) -> Option<SandboxRecord> {
        self.lock_records().get(sandbox_id).cloned()
    }

    fn remember(&self, sandbox_id: &str, status: SandboxStatus, working_dir: &str) {
        self.lock_records().insert(
            sandbox_id.to_string(),
            SandboxRecord {
                sandbox_id: sandbox_id.to_string(),
                status,
                working_dir: working_dir.to_string(),
            },
        );
    }

    fn forget(&self, sandbox_id: &str) {
        self.lock_records().remove(sandbox_id);
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<String, SandboxRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Single-quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<MemorySandboxProvider>, SandboxSessionManager) {
        let provider = Arc::new(MemorySandboxProvider::new());
        provider.add_sandbox("sbx-1", "/home/user/app");
        let manager = SandboxSessionManager::new(provider.clone());
        (provider, manager)
    }

    #[tokio::test]
    async fn connect_unknown_sandbox_is_not_found() {
        let (_, manager) = manager();
        let err = manager.connect("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn connect_resumes_paused_sandbox() {
        let (provider, manager) = manager();
        provider.set_status("sbx-1", SandboxStatus::Paused);
        let handle = manager.connect("sbx-1").await.unwrap();
        assert_eq!(handle.working_dir, "/home/user/app");
        assert_eq!(
            manager.record("sbx-1").map(|r| r.status),
            Some(SandboxStatus::Active)
        );
    }

    #[tokio::test]
    async fn pause_failure_still_marks_paused() {
        let (provider, manager) = manager();
        let handle = manager.connect("sbx-1").await.unwrap();
        provider.fail_pause(true);
        let outcome = manager.pause(&handle).await;
        assert_eq!(outcome.sandbox_id, "sbx-1");
        assert!(outcome.caveat.is_some());
        assert_eq!(
            manager.record("sbx-1").map(|r| r.status),
            Some(SandboxStatus::Paused)
        );
    }

    #[tokio::test]
    async fn pause_by_id_leaves_a_paused_sandbox_paused() {
        let (provider, manager) = manager();
        provider.set_status("sbx-1", SandboxStatus::Paused);
        provider.fail_pause(true);

        let outcome = manager.pause_id("sbx-1").await.unwrap();
        assert_eq!(outcome.sandbox_id, "sbx-1");
        assert!(outcome.caveat.is_some());
        assert_eq!(
            provider.get_sandbox("sbx-1").await.unwrap().status,
            SandboxStatus::Paused
        );
        assert_eq!(
            manager.record("sbx-1"),
            Some(SandboxRecord {
                sandbox_id: "sbx-1".to_string(),
                status: SandboxStatus::Paused,
                working_dir: "/home/user/app".to_string(),
            })
        );

        provider.fail_pause(false);
        let again = manager.pause_id("sbx-1").await.unwrap();
        assert_eq!(again.caveat, None);
    }

    #[tokio::test]
    async fn pause_by_id_falls_back_to_remembered_sandbox() {
        let (provider, manager) = manager();
        manager.connect("sbx-1").await.unwrap();
        provider.remove_sandbox("sbx-1");

        let outcome = manager.pause_id("sbx-1").await.unwrap();
        assert!(outcome.caveat.is_some());
        assert_eq!(
            manager.record("sbx-1").map(|r| (r.status, r.working_dir)),
            Some((SandboxStatus::Paused, "/home/user/app".to_string()))
        );

        assert!(manager.pause_id("never-seen").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn check_alive_never_errors() {
        let (provider, manager) = manager();
        assert!(manager.check_alive("sbx-1").await.alive);

        provider.set_status("sbx-1", SandboxStatus::Destroyed);
        let liveness = manager.check_alive("sbx-1").await;
        assert!(!liveness.alive);
        assert_eq!(liveness.reason.as_deref(), Some("destroyed"));

        let liveness = manager.check_alive("nope").await;
        assert!(!liveness.alive);
        assert!(liveness.reason.unwrap().contains("not found"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn resolve_path_joins_relative() {
        assert_eq!(SandboxHandle::resolve_path("/w/", "a.txt"), "/w/a.txt");
        assert_eq!(SandboxHandle::resolve_path("/w", "/abs"), "/abs");
    }
}
