//! Server configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::checkpoint::CheckpointConfig;
use crate::executor::ExecutorConfig;
use crate::run_spec::ResolverDefaults;

/// Environment variables forwarded to the agent runner when set.
pub const AGENT_ENV_PASSTHROUGH: [&str; 4] = [
    "ANTHROPIC_API_KEY",
    "ANTHROPIC_BASE_URL",
    "CLAUDE_CODE_OAUTH_TOKEN",
    "GITHUB_TOKEN",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// Remote sandbox API, git inside the sandbox, HTTP object store.
    Http,
    /// Everything in process. For local development and tests.
    Memory,
}

#[derive(Debug, Clone)]
pub struct HookSettings {
    /// Command run by the deploy hook when a run asks for `withDeployHook`.
    pub deploy_command: Option<String>,
    pub deploy_timeout_secs: Option<u64>,
    /// Commit the working tree after every successful run.
    pub checkpoint_on_success: bool,
    /// Build a bundle along with the end-of-run checkpoint.
    pub bundle_on_checkpoint: bool,
    pub session_end_commands: Vec<String>,
    pub cancelled_commands: Vec<String>,
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            deploy_command: None,
            deploy_timeout_secs: None,
            checkpoint_on_success: true,
            bundle_on_checkpoint: false,
            session_end_commands: Vec::new(),
            cancelled_commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub backend: Backend,
    pub sandbox_api_url: Option<String>,
    pub sandbox_api_key: Option<String>,
    pub object_store_url: Option<String>,
    pub object_store_public_url: Option<String>,
    pub object_store_token: Option<String>,
    /// Commit records live below this directory.
    pub data_dir: PathBuf,
    pub runner_command: String,
    pub git_author_name: String,
    pub git_author_email: String,
    pub resolver: ResolverDefaults,
    pub executor: ExecutorConfig,
    pub checkpoint: CheckpointConfig,
    pub hooks: HookSettings,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Http,
            sandbox_api_url: None,
            sandbox_api_key: None,
            object_store_url: None,
            object_store_public_url: None,
            object_store_token: None,
            data_dir: default_data_dir(),
            runner_command: "claude".to_string(),
            git_author_name: "Sandbox Studio".to_string(),
            git_author_email: "studio@sandbox.local".to_string(),
            resolver: ResolverDefaults::default(),
            executor: ExecutorConfig {
                required_env: vec!["ANTHROPIC_API_KEY".to_string()],
                ..ExecutorConfig::default()
            },
            checkpoint: CheckpointConfig::default(),
            hooks: HookSettings::default(),
        }
    }
}

impl StudioConfig {
    /// In-process backends with no credential requirements.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory,
            executor: ExecutorConfig::default(),
            ..Self::default()
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration, missed_ticks: u32) -> Self {
        self.executor.heartbeat_interval = interval;
        self.executor.missed_ticks_threshold = missed_ticks;
        self
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sandbox-studio")
}

/// Values of `keys` present in the process environment.
pub fn collect_agent_env<'a>(keys: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, String> {
    keys.into_iter()
        .filter_map(|key| {
            std::env::var(key)
                .ok()
                .filter(|value| !value.is_empty())
                .map(|value| (key.to_string(), value))
        })
        .collect()
}
