//! Process-wide services, built once from [`StudioConfig`] and shared by the
//! HTTP handlers and the CLI.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sandbox_studio_error::SandboxError;
use tracing::info;

use crate::broadcaster::FileChangeBroadcaster;
use crate::checkpoint::{
    CheckpointEngine, CommitStore, FileCommitStore, HttpObjectStore, MemoryCommitStore,
    MemoryObjectStore, MemoryVcsBackend, ObjectStore, SandboxGitBackend, VersionControlBackend,
};
use crate::config::{Backend, HookSettings, StudioConfig};
use crate::executor::AgentExecutor;
use crate::hooks::{CheckpointHook, CommandHook, DeployHook, HookDefinition, HookEventName, HookPipeline};
use crate::projects::{ProjectLocks, ProjectStore};
use crate::run_spec::{ExecutionSpec, ResolverDefaults};
use crate::runtime::{AgentRuntime, SandboxAgentRuntime, ScriptedRuntime};
use crate::sandbox::{HttpSandboxProvider, MemorySandboxProvider, SandboxProvider, SandboxSessionManager};

/// Handles on the in-process backends, for seeding state in tests and local
/// development.
#[derive(Debug, Clone)]
pub struct MemoryBackends {
    pub provider: Arc<MemorySandboxProvider>,
    pub vcs: Arc<MemoryVcsBackend>,
    pub objects: Arc<MemoryObjectStore>,
    pub runtime: Arc<ScriptedRuntime>,
}

impl MemoryBackends {
    pub fn new() -> Self {
        let provider = Arc::new(MemorySandboxProvider::new());
        Self {
            vcs: Arc::new(MemoryVcsBackend::new(provider.clone())),
            objects: Arc::new(MemoryObjectStore::default()),
            runtime: Arc::new(ScriptedRuntime::new()),
            provider,
        }
    }
}

impl Default for MemoryBackends {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct StudioServices {
    pub projects: Arc<ProjectStore>,
    pub locks: Arc<ProjectLocks>,
    pub sessions: Arc<SandboxSessionManager>,
    pub broadcaster: Arc<FileChangeBroadcaster>,
    pub checkpoints: Arc<CheckpointEngine>,
    pub executor: Arc<AgentExecutor>,
    pub resolver: ResolverDefaults,
    pub hook_settings: HookSettings,
    run_ids: AtomicU64,
}

impl StudioServices {
    pub fn from_config(config: &StudioConfig) -> Result<Self, SandboxError> {
        match config.backend {
            Backend::Memory => {
                let (services, _) = Self::in_memory(config)?;
                Ok(services)
            }
            Backend::Http => {
                let sandbox_url = config.sandbox_api_url.as_deref().ok_or_else(|| {
                    SandboxError::configuration("sandbox API url is required for the http backend")
                })?;
                let object_url = config.object_store_url.as_deref().ok_or_else(|| {
                    SandboxError::configuration("object store url is required for the http backend")
                })?;
                let provider: Arc<dyn SandboxProvider> = Arc::new(HttpSandboxProvider::new(
                    sandbox_url,
                    config.sandbox_api_key.clone(),
                )?);
                let vcs: Arc<dyn VersionControlBackend> = Arc::new(SandboxGitBackend::new(
                    config.git_author_name.clone(),
                    config.git_author_email.clone(),
                ));
                let store: Arc<dyn CommitStore> =
                    Arc::new(FileCommitStore::new(config.data_dir.join("commits")));
                let objects: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(
                    object_url,
                    config.object_store_public_url.as_deref(),
                    config.object_store_token.clone(),
                )?);
                let runtime: Arc<dyn AgentRuntime> =
                    Arc::new(SandboxAgentRuntime::new(config.runner_command.clone()));
                info!(
                    sandbox_api = %sandbox_url,
                    object_store = %object_url,
                    data_dir = %config.data_dir.display(),
                    "using http backends"
                );
                Self::assemble(config, provider, vcs, store, objects, runtime)
            }
        }
    }

    /// Services over fresh in-process backends. Commits are kept in memory.
    pub fn in_memory(config: &StudioConfig) -> Result<(Self, MemoryBackends), SandboxError> {
        let backends = MemoryBackends::new();
        let services = Self::assemble(
            config,
            backends.provider.clone(),
            backends.vcs.clone(),
            Arc::new(MemoryCommitStore::new()),
            backends.objects.clone(),
            backends.runtime.clone(),
        )?;
        info!("using in-memory backends");
        Ok((services, backends))
    }

    pub fn assemble(
        config: &StudioConfig,
        provider: Arc<dyn SandboxProvider>,
        vcs: Arc<dyn VersionControlBackend>,
        store: Arc<dyn CommitStore>,
        objects: Arc<dyn ObjectStore>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Result<Self, SandboxError> {
        let locks = Arc::new(ProjectLocks::new());
        let sessions = Arc::new(SandboxSessionManager::new(provider));
        let broadcaster = Arc::new(FileChangeBroadcaster::new());
        let checkpoints = Arc::new(CheckpointEngine::new(
            vcs,
            store,
            objects,
            locks.clone(),
            config.checkpoint.clone(),
        ));
        let executor = Arc::new(AgentExecutor::new(
            sessions.clone(),
            runtime,
            broadcaster.clone(),
            locks.clone(),
            config.executor.clone(),
        )?);
        Ok(Self {
            projects: Arc::new(ProjectStore::new()),
            locks,
            sessions,
            broadcaster,
            checkpoints,
            executor,
            resolver: config.resolver.clone(),
            hook_settings: config.hooks.clone(),
            run_ids: AtomicU64::new(0),
        })
    }

    /// `run_<unix ms, hex>_<sequence>`; the sequence is per services instance.
    pub fn next_run_id(&self) -> String {
        let sequence = self.run_ids.fetch_add(1, Ordering::Relaxed) + 1;
        format!("run_{:x}_{sequence}", crate::now_unix_ms())
    }

    /// Hooks for one run, in execution order: configured commands, deploy,
    /// then the checkpoint.
    pub fn hooks_for(&self, spec: &ExecutionSpec) -> Result<HookPipeline, SandboxError> {
        let settings = &self.hook_settings;
        let mut pipeline = HookPipeline::new();
        for (index, command) in settings.session_end_commands.iter().enumerate() {
            pipeline.push(Arc::new(CommandHook::new(
                format!("session-end-{index}"),
                HookDefinition::new(command.clone()),
            )));
        }
        for (index, command) in settings.cancelled_commands.iter().enumerate() {
            pipeline.push(Arc::new(
                CommandHook::new(format!("cancelled-{index}"), HookDefinition::new(command.clone()))
                    .on(&[HookEventName::Cancelled]),
            ));
        }
        if spec.with_deploy_hook {
            let command = settings.deploy_command.clone().ok_or_else(|| {
                SandboxError::configuration("withDeployHook requested but no deploy command is configured")
            })?;
            let mut definition = HookDefinition::new(command);
            definition.timeout_secs = settings.deploy_timeout_secs;
            pipeline.push(Arc::new(DeployHook::new(definition)));
        }
        if settings.checkpoint_on_success {
            pipeline.push(Arc::new(CheckpointHook::new(
                self.checkpoints.clone(),
                settings.bundle_on_checkpoint,
            )));
        }
        Ok(pipeline)
    }
}
