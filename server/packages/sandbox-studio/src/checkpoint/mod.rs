//! Git-backed checkpoints: commit, list, restore, and static bundles.
//!
//! Every mutating operation on a project takes that project's lock from
//! [`ProjectLocks`], so commits, restores and bundle builds against one
//! working tree never interleave. Different projects proceed in parallel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sandbox_studio_error::SandboxError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::projects::ProjectLocks;
use crate::sandbox::{shell_quote, tail, CommandRequest, SandboxHandle};

mod assets;
mod object_store;
mod store;
mod vcs;

pub use assets::{AssetEntry, AssetManifest, PublishedAsset, ASSET_MANIFEST_PATH};
pub use object_store::{
    content_type_for, HttpObjectStore, MemoryObjectStore, ObjectStore, StoredObject,
};
pub use store::{Commit, CommitStore, FileCommitStore, MemoryCommitStore};
pub use vcs::{MemoryVcsBackend, SandboxGitBackend, VersionControlBackend};

pub const DEFAULT_LIST_CAP: usize = 50;

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Server-side upper bound for commit listings.
    pub list_cap: usize,
    /// Stops any dev server before a restore. Must tolerate nothing running.
    pub dev_server_kill_command: String,
    /// Files touched after a restore so watchers recompile.
    pub touch_files: Vec<String>,
    pub build_command: String,
    /// Build output directory, relative to the working tree.
    pub bundle_output_dir: String,
    pub build_timeout_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            list_cap: DEFAULT_LIST_CAP,
            dev_server_kill_command: r#"pkill -f "next dev|vite" || true"#.to_string(),
            touch_files: vec!["package.json".to_string()],
            build_command: "npm run build".to_string(),
            bundle_output_dir: "dist".to_string(),
            build_timeout_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateCommitResult {
    pub success: bool,
    pub commit: Commit,
    pub pushed: bool,
    /// No remote is configured, so nothing was pushed.
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleResult {
    pub manifest_url: String,
    pub bundle_url: String,
    /// Recorded commit id, or the sha when the tree was never checkpointed.
    pub commit_id: String,
    #[serde(rename = "commitSHA")]
    pub commit_sha: String,
    pub files: usize,
}

/// Relative path to published url, for one `(projectId, commitSHA)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub project_id: String,
    #[serde(rename = "commitSHA")]
    pub commit_sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub commit: Commit,
    pub touched: Vec<String>,
}

#[derive(Debug)]
pub struct CheckpointEngine {
    vcs: Arc<dyn VersionControlBackend>,
    store: Arc<dyn CommitStore>,
    objects: Arc<dyn ObjectStore>,
    locks: Arc<ProjectLocks>,
    config: CheckpointConfig,
    commit_ids: AtomicU64,
}

impl CheckpointEngine {
    pub fn new(
        vcs: Arc<dyn VersionControlBackend>,
        store: Arc<dyn CommitStore>,
        objects: Arc<dyn ObjectStore>,
        locks: Arc<ProjectLocks>,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            vcs,
            store,
            objects,
            locks,
            config,
            commit_ids: AtomicU64::new(0),
        }
    }

    pub fn locks(&self) -> &Arc<ProjectLocks> {
        &self.locks
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Commits the sandbox working tree. Without a remote the push is
    /// skipped and reported as such.
    pub async fn create_commit(
        &self,
        project_id: &str,
        sandbox: &SandboxHandle,
        user_message: &str,
    ) -> Result<CreateCommitResult, SandboxError> {
        let _guard = self.locks.lock(project_id).await;
        self.commit_locked(project_id, sandbox, user_message).await
    }

    /// Commits, then builds a bundle for the new commit. A bundle failure is
    /// recorded on the result and does not fail the commit.
    pub async fn create_commit_and_bundle(
        &self,
        project_id: &str,
        sandbox: &SandboxHandle,
        user_message: &str,
    ) -> Result<CreateCommitResult, SandboxError> {
        let _guard = self.locks.lock(project_id).await;
        let mut result = self.commit_locked(project_id, sandbox, user_message).await?;
        let sha = result.commit.github_sha.clone();
        match self
            .bundle_locked(sandbox, project_id, &sha, Some(user_message))
            .await
        {
            Ok(bundle) => {
                result.commit.bundle_url = Some(bundle.bundle_url.clone());
                result.bundle = Some(bundle);
            }
            Err(err) => {
                warn!(project_id = %project_id, sha = %sha, error = %err, "bundle build failed; commit kept");
                result.bundle_error = Some(err.to_string());
            }
        }
        Ok(result)
    }

    /// Newest first; `limit` is capped at the configured maximum.
    pub async fn list_commits(
        &self,
        project_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Commit>, SandboxError> {
        let cap = self.config.list_cap.max(1);
        let limit = match limit {
            None | Some(0) => cap,
            Some(requested) => requested.min(cap),
        };
        self.store.list(project_id, limit).await
    }

    /// Checks out `sha` into the working tree, discarding local changes.
    pub async fn restore_commit(
        &self,
        project_id: &str,
        sandbox: &SandboxHandle,
        sha: &str,
    ) -> Result<RestoreOutcome, SandboxError> {
        let sha = sha.trim();
        if sha.is_empty() {
            return Err(SandboxError::validation("commitSHA", "is required"));
        }
        let commit = self
            .store
            .find_by_sha(project_id, sha)
            .await?
            .ok_or_else(|| SandboxError::not_found("commit", sha))?;
        self.ensure_idle(project_id)?;
        let _guard = self.locks.lock(project_id).await;
        self.ensure_idle(project_id)?;

        let cwd = sandbox.working_dir.clone();
        let kill = sandbox
            .exec(&CommandRequest::new(self.config.dev_server_kill_command.clone()).cwd(&cwd))
            .await?;
        debug!(project_id = %project_id, exit_code = kill.exit_code, "dev server stopped");

        if !self.vcs.commit_exists(sandbox, &cwd, &commit.github_sha).await? {
            return Err(SandboxError::not_found("commit", &commit.github_sha));
        }
        self.vcs
            .checkout_tree(sandbox, &cwd, &commit.github_sha)
            .await?;

        let touched = self.touch_files(sandbox, &cwd).await;
        info!(
            project_id = %project_id,
            sandbox_id = %sandbox.id,
            sha = %commit.github_sha,
            "project restored"
        );
        Ok(RestoreOutcome { commit, touched })
    }

    pub async fn build_static_bundle(
        &self,
        sandbox: &SandboxHandle,
        project_id: &str,
        commit_sha: &str,
        note: Option<&str>,
    ) -> Result<BundleResult, SandboxError> {
        let _guard = self.locks.lock(project_id).await;
        self.bundle_locked(sandbox, project_id, commit_sha, note)
            .await
    }

    /// Builds a bundle for whatever the working tree's HEAD is.
    pub async fn build_current_bundle(
        &self,
        sandbox: &SandboxHandle,
        project_id: &str,
        note: Option<&str>,
    ) -> Result<BundleResult, SandboxError> {
        let _guard = self.locks.lock(project_id).await;
        let sha = self
            .vcs
            .head(sandbox, &sandbox.working_dir)
            .await?
            .ok_or_else(|| SandboxError::not_found("commit", "HEAD"))?;
        self.bundle_locked(sandbox, project_id, &sha, note).await
    }

    /// Durable url for a file of a commit's bundle. `commit_ref` may be a
    /// commit id or sha.
    pub async fn bundle_redirect(
        &self,
        project_id: &str,
        commit_ref: &str,
        file_path: &str,
    ) -> Result<String, SandboxError> {
        if file_path
            .split('/')
            .any(|segment| segment == ".." || segment == ".")
        {
            return Err(SandboxError::validation("filePath", "must not contain dot segments"));
        }
        let commit = match self.store.get(project_id, commit_ref).await? {
            Some(commit) => commit,
            None => self
                .store
                .find_by_sha(project_id, commit_ref)
                .await?
                .ok_or_else(|| SandboxError::not_found("commit", commit_ref))?,
        };
        let base = commit
            .bundle_url
            .ok_or_else(|| SandboxError::not_found("bundle", commit_ref))?;
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            file_path.trim_start_matches('/')
        ))
    }

    pub async fn published_assets(
        &self,
        sandbox: &SandboxHandle,
    ) -> Result<Vec<PublishedAsset>, SandboxError> {
        Ok(AssetManifest::load(sandbox, &sandbox.working_dir)
            .await?
            .published())
    }

    fn ensure_idle(&self, project_id: &str) -> Result<(), SandboxError> {
        if self.locks.is_running(project_id) {
            return Err(SandboxError::conflict(format!(
                "an agent run is in progress for project {project_id}"
            )));
        }
        Ok(())
    }

    async fn commit_locked(
        &self,
        project_id: &str,
        sandbox: &SandboxHandle,
        user_message: &str,
    ) -> Result<CreateCommitResult, SandboxError> {
        let message = user_message.trim();
        if message.is_empty() {
            return Err(SandboxError::validation("message", "is required"));
        }
        let cwd = sandbox.working_dir.clone();
        let sha = self.vcs.commit_all(sandbox, &cwd, message).await?;
        let sequence = self.commit_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let commit = Commit::new(project_id, &sha, message, sequence);
        self.store.insert(commit.clone()).await?;

        let (pushed, skipped, push_error) = if self.vcs.has_remote(sandbox, &cwd).await? {
            match self.vcs.push(sandbox, &cwd).await {
                Ok(()) => (true, false, None),
                Err(err) => {
                    warn!(project_id = %project_id, sha = %sha, error = %err, "push failed");
                    (false, false, Some(err.to_string()))
                }
            }
        } else {
            debug!(project_id = %project_id, "no remote configured; push skipped");
            (false, true, None)
        };
        info!(
            project_id = %project_id,
            commit_id = %commit.id,
            sha = %sha,
            pushed,
            "commit created"
        );
        Ok(CreateCommitResult {
            success: true,
            commit,
            pushed,
            skipped,
            push_error,
            bundle: None,
            bundle_error: None,
        })
    }

    async fn bundle_locked(
        &self,
        sandbox: &SandboxHandle,
        project_id: &str,
        commit_sha: &str,
        note: Option<&str>,
    ) -> Result<BundleResult, SandboxError> {
        let cwd = sandbox.working_dir.clone();
        let mut build = CommandRequest::new(self.config.build_command.clone())
            .cwd(&cwd)
            .timeout_ms(self.config.build_timeout_ms)
            .env("STUDIO_COMMIT_SHA", commit_sha)
            .env("STUDIO_PROJECT_ID", project_id);
        if let Some(note) = note {
            build = build.env("STUDIO_BUNDLE_NOTE", note);
        }
        let output = sandbox.exec(&build).await?;
        if !output.success() {
            return Err(SandboxError::internal(format!(
                "bundle build exited with {}: {}",
                output.exit_code,
                tail(&output.stderr, 512)
            )));
        }

        let output_dir = SandboxHandle::resolve_path(&cwd, &self.config.bundle_output_dir);
        let files = sandbox.list_files(&output_dir).await?;
        if files.is_empty() {
            return Err(SandboxError::internal(format!(
                "bundle build produced no files in {output_dir}"
            )));
        }

        let prefix = format!("bundles/{project_id}/{commit_sha}/");
        let mut manifest = BundleManifest {
            project_id: project_id.to_string(),
            commit_sha: commit_sha.to_string(),
            note: note.map(str::to_string),
            files: BTreeMap::new(),
        };
        let mut assets = AssetManifest::load(sandbox, &cwd).await?;
        let dir_prefix = format!("{}/", output_dir.trim_end_matches('/'));
        for file in &files {
            let relative = file.strip_prefix(&dir_prefix).unwrap_or(file);
            let bytes = sandbox.read_file(file).await?;
            let url = self
                .objects
                .put(
                    &format!("{prefix}{relative}"),
                    bytes,
                    content_type_for(relative),
                )
                .await?;
            assets.publish(relative, &url);
            manifest.files.insert(relative.to_string(), url);
        }
        let manifest_url = self
            .objects
            .put(
                &format!("{prefix}manifest.json"),
                serde_json::to_vec_pretty(&manifest)?,
                "application/json",
            )
            .await?;
        let bundle_url = self.objects.public_url(&prefix);
        assets.save(sandbox, &cwd).await?;

        let commit_id = match self.store.find_by_sha(project_id, commit_sha).await? {
            Some(commit) => {
                self.store
                    .set_bundle_url(project_id, &commit.id, &bundle_url)
                    .await?;
                commit.id
            }
            None => commit_sha.to_string(),
        };
        info!(
            project_id = %project_id,
            sha = %commit_sha,
            files = files.len(),
            bundle_url = %bundle_url,
            "bundle published"
        );
        Ok(BundleResult {
            manifest_url,
            bundle_url,
            commit_id,
            commit_sha: commit_sha.to_string(),
            files: files.len(),
        })
    }

    async fn touch_files(&self, sandbox: &SandboxHandle, cwd: &str) -> Vec<String> {
        if self.config.touch_files.is_empty() {
            return Vec::new();
        }
        let paths: Vec<String> = self
            .config
            .touch_files
            .iter()
            .map(|file| SandboxHandle::resolve_path(cwd, file))
            .collect();
        let quoted: Vec<String> = paths.iter().map(|path| shell_quote(path)).collect();
        let command = format!("touch -c {}", quoted.join(" "));
        match sandbox
            .exec(&CommandRequest::new(command).cwd(cwd))
            .await
        {
            Ok(output) if output.success() => paths,
            Ok(output) => {
                warn!(sandbox_id = %sandbox.id, exit_code = output.exit_code, "touch after restore failed");
                Vec::new()
            }
            Err(err) => {
                warn!(sandbox_id = %sandbox.id, error = %err, "touch after restore failed");
                Vec::new()
            }
        }
    }
}
