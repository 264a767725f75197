use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream;
use sandbox_studio_error::SandboxError;

use super::{
    CommandOutput, CommandRequest, LineStream, SandboxInfo, SandboxProvider, SandboxStatus,
};

const DEFAULT_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Handles a command whose text starts with a registered prefix. Receives the
/// sandbox's file tree so builds and similar commands can produce output.
pub type CommandHandler =
    Arc<dyn Fn(&CommandRequest, &mut BTreeMap<String, Vec<u8>>) -> CommandOutput + Send + Sync>;

#[derive(Debug, Clone)]
struct MemorySandbox {
    info: SandboxInfo,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct MemoryState {
    sandboxes: HashMap<String, MemorySandbox>,
    handlers: Vec<(String, CommandHandler)>,
    streams: Vec<(String, Vec<String>)>,
    commands: Vec<(String, CommandRequest)>,
}

/// In-process sandbox provider. Files live in a map keyed by absolute path
/// and commands are answered by registered handlers.
#[derive(Default)]
pub struct MemorySandboxProvider {
    state: Mutex<MemoryState>,
    fail_pause: AtomicBool,
}

impl std::fmt::Debug for MemorySandboxProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemorySandboxProvider")
            .field("sandboxes", &state.sandboxes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MemorySandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sandbox(&self, sandbox_id: &str, working_dir: &str) {
        let info = SandboxInfo {
            sandbox_id: sandbox_id.to_string(),
            status: SandboxStatus::Active,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            working_dir: working_dir.to_string(),
        };
        self.lock().sandboxes.insert(
            sandbox_id.to_string(),
            MemorySandbox {
                info,
                files: BTreeMap::new(),
            },
        );
    }

    pub fn remove_sandbox(&self, sandbox_id: &str) {
        self.lock().sandboxes.remove(sandbox_id);
    }

    pub fn set_status(&self, sandbox_id: &str, status: SandboxStatus) {
        if let Some(sandbox) = self.lock().sandboxes.get_mut(sandbox_id) {
            sandbox.info.status = status;
        }
    }

    pub fn fail_pause(&self, fail: bool) {
        self.fail_pause.store(fail, Ordering::SeqCst);
    }

    /// Registers a handler for commands starting with `prefix`. Later
    /// registrations win.
    pub fn on_command(&self, prefix: &str, handler: CommandHandler) {
        self.lock().handlers.push((prefix.to_string(), handler));
    }

    /// Lines returned by `exec_stream` for commands starting with `prefix`.
    pub fn on_stream(&self, prefix: &str, lines: Vec<String>) {
        self.lock().streams.push((prefix.to_string(), lines));
    }

    /// Every command executed so far, with the sandbox it ran in.
    pub fn commands(&self) -> Vec<(String, CommandRequest)> {
        self.lock().commands.clone()
    }

    pub fn put_file(&self, sandbox_id: &str, path: &str, contents: impl Into<Vec<u8>>) {
        if let Some(sandbox) = self.lock().sandboxes.get_mut(sandbox_id) {
            sandbox.files.insert(path.to_string(), contents.into());
        }
    }

    pub fn delete_file(&self, sandbox_id: &str, path: &str) {
        if let Some(sandbox) = self.lock().sandboxes.get_mut(sandbox_id) {
            sandbox.files.remove(path);
        }
    }

    pub fn file(&self, sandbox_id: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .sandboxes
            .get(sandbox_id)
            .and_then(|sandbox| sandbox.files.get(path).cloned())
    }

    /// Files below `dir`, keyed by path relative to it.
    pub fn snapshot(&self, sandbox_id: &str, dir: &str) -> Result<BTreeMap<String, Vec<u8>>, SandboxError> {
        let state = self.lock();
        let sandbox = state
            .sandboxes
            .get(sandbox_id)
            .ok_or_else(|| SandboxError::not_found("sandbox", sandbox_id))?;
        let prefix = dir_prefix(dir);
        Ok(sandbox
            .files
            .iter()
            .filter_map(|(path, contents)| {
                path.strip_prefix(&prefix)
                    .map(|rel| (rel.to_string(), contents.clone()))
            })
            .collect())
    }

    /// Replaces every file below `dir` whose relative path passes `keep` with
    /// `tree`. Files rejected by `keep` are left alone.
    pub fn replace_tree(
        &self,
        sandbox_id: &str,
        dir: &str,
        tree: &BTreeMap<String, Vec<u8>>,
        keep: impl Fn(&str) -> bool,
    ) -> Result<(), SandboxError> {
        let mut state = self.lock();
        let sandbox = state
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| SandboxError::not_found("sandbox", sandbox_id))?;
        let prefix = dir_prefix(dir);
        sandbox.files.retain(|path, _| match path.strip_prefix(&prefix) {
            Some(rel) => !keep(rel),
            None => true,
        });
        for (rel, contents) in tree {
            sandbox
                .files
                .insert(format!("{prefix}{rel}"), contents.clone());
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn info(&self, sandbox_id: &str) -> Result<SandboxInfo, SandboxError> {
        self.lock()
            .sandboxes
            .get(sandbox_id)
            .map(|sandbox| sandbox.info.clone())
            .ok_or_else(|| SandboxError::not_found("sandbox", sandbox_id))
    }

    fn require_active(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        match self.info(sandbox_id)?.status {
            SandboxStatus::Active => Ok(()),
            _ => Err(SandboxError::not_found("sandbox", sandbox_id)),
        }
    }
}

fn dir_prefix(dir: &str) -> String {
    format!("{}/", dir.trim_end_matches('/'))
}

#[async_trait]
impl SandboxProvider for MemorySandboxProvider {
    async fn get_sandbox(&self, sandbox_id: &str) -> Result<SandboxInfo, SandboxError> {
        self.info(sandbox_id)
    }

    async fn pause(&self, sandbox_id: &str) -> Result<String, SandboxError> {
        if self.fail_pause.load(Ordering::SeqCst) {
            return Err(SandboxError::transient("pause rejected by control plane"));
        }
        match self.info(sandbox_id)?.status {
            SandboxStatus::Destroyed => Err(SandboxError::not_found("sandbox", sandbox_id)),
            _ => {
                self.set_status(sandbox_id, SandboxStatus::Paused);
                Ok(sandbox_id.to_string())
            }
        }
    }

    async fn resume(&self, sandbox_id: &str) -> Result<SandboxInfo, SandboxError> {
        match self.info(sandbox_id)?.status {
            SandboxStatus::Destroyed => Err(SandboxError::not_found("sandbox", sandbox_id)),
            _ => {
                self.set_status(sandbox_id, SandboxStatus::Active);
                self.info(sandbox_id)
            }
        }
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        request: &CommandRequest,
    ) -> Result<CommandOutput, SandboxError> {
        self.require_active(sandbox_id)?;
        let mut state = self.lock();
        state
            .commands
            .push((sandbox_id.to_string(), request.clone()));
        let handler = state
            .handlers
            .iter()
            .rev()
            .find(|(prefix, _)| request.command.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone());
        let Some(handler) = handler else {
            return Ok(CommandOutput::ok(""));
        };
        let sandbox = state
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| SandboxError::not_found("sandbox", sandbox_id))?;
        Ok(handler(request, &mut sandbox.files))
    }

    async fn exec_stream(
        &self,
        sandbox_id: &str,
        request: &CommandRequest,
    ) -> Result<LineStream, SandboxError> {
        self.require_active(sandbox_id)?;
        let mut state = self.lock();
        state
            .commands
            .push((sandbox_id.to_string(), request.clone()));
        let lines = state
            .streams
            .iter()
            .rev()
            .find(|(prefix, _)| request.command.starts_with(prefix.as_str()))
            .map(|(_, lines)| lines.clone())
            .unwrap_or_default();
        Ok(Box::pin(stream::iter(lines.into_iter().map(Ok))))
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.require_active(sandbox_id)?;
        self.file(sandbox_id, path)
            .ok_or_else(|| SandboxError::not_found("file", path))
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), SandboxError> {
        self.require_active(sandbox_id)?;
        self.put_file(sandbox_id, path, contents.to_vec());
        Ok(())
    }

    async fn list_files(&self, sandbox_id: &str, dir: &str) -> Result<Vec<String>, SandboxError> {
        self.require_active(sandbox_id)?;
        let state = self.lock();
        let sandbox = state
            .sandboxes
            .get(sandbox_id)
            .ok_or_else(|| SandboxError::not_found("sandbox", sandbox_id))?;
        let prefix = dir_prefix(dir);
        Ok(sandbox
            .files
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect())
    }
}
