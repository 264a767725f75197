use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sandbox_studio_error::SandboxError;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use utoipa::ToSchema;

/// An immutable, named snapshot of a project's tracked files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub id: String,
    pub project_id: String,
    #[serde(rename = "githubSHA")]
    pub github_sha: String,
    pub user_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_url: Option<String>,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl Commit {
    /// `sequence` tells apart commits created in the same millisecond.
    pub fn new(project_id: &str, github_sha: &str, user_message: &str, sequence: u64) -> Self {
        let created_at = crate::now_unix_ms();
        Self {
            id: format!("cmt_{created_at:x}_{sequence}"),
            project_id: project_id.to_string(),
            github_sha: github_sha.to_string(),
            user_message: user_message.to_string(),
            bundle_url: None,
            created_at,
        }
    }
}

/// Durable commit records. `list` is newest first.
#[async_trait]
pub trait CommitStore: Send + Sync + std::fmt::Debug {
    async fn insert(&self, commit: Commit) -> Result<(), SandboxError>;

    async fn get(&self, project_id: &str, commit_id: &str) -> Result<Option<Commit>, SandboxError>;

    async fn find_by_sha(&self, project_id: &str, sha: &str) -> Result<Option<Commit>, SandboxError>;

    async fn list(&self, project_id: &str, limit: usize) -> Result<Vec<Commit>, SandboxError>;

    async fn set_bundle_url(
        &self,
        project_id: &str,
        commit_id: &str,
        bundle_url: &str,
    ) -> Result<(), SandboxError>;
}

fn newest_first(commits: &[Commit], limit: usize) -> Vec<Commit> {
    commits.iter().rev().take(limit).cloned().collect()
}

/// The most recent record wins when the same sha was recorded twice.
fn by_sha<'a>(commits: &'a [Commit], sha: &str) -> Option<&'a Commit> {
    commits.iter().rev().find(|commit| {
        commit.github_sha == sha || (sha.len() >= 7 && commit.github_sha.starts_with(sha))
    })
}

fn apply_bundle_url(
    commits: &mut [Commit],
    project_id: &str,
    commit_id: &str,
    bundle_url: &str,
) -> Result<(), SandboxError> {
    let commit = commits
        .iter_mut()
        .find(|commit| commit.id == commit_id)
        .ok_or_else(|| SandboxError::not_found("commit", commit_id))?;
    debug!(project_id = %project_id, commit_id = %commit_id, bundle_url = %bundle_url, "bundle recorded");
    commit.bundle_url = Some(bundle_url.to_string());
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryCommitStore {
    commits: Mutex<HashMap<String, Vec<Commit>>>,
}

impl MemoryCommitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommitStore for MemoryCommitStore {
    async fn insert(&self, commit: Commit) -> Result<(), SandboxError> {
        self.commits
            .lock()
            .await
            .entry(commit.project_id.clone())
            .or_default()
            .push(commit);
        Ok(())
    }

    async fn get(&self, project_id: &str, commit_id: &str) -> Result<Option<Commit>, SandboxError> {
        Ok(self
            .commits
            .lock()
            .await
            .get(project_id)
            .and_then(|commits| commits.iter().find(|commit| commit.id == commit_id).cloned()))
    }

    async fn find_by_sha(&self, project_id: &str, sha: &str) -> Result<Option<Commit>, SandboxError> {
        Ok(self
            .commits
            .lock()
            .await
            .get(project_id)
            .and_then(|commits| by_sha(commits, sha).cloned()))
    }

    async fn list(&self, project_id: &str, limit: usize) -> Result<Vec<Commit>, SandboxError> {
        Ok(self
            .commits
            .lock()
            .await
            .get(project_id)
            .map(|commits| newest_first(commits, limit))
            .unwrap_or_default())
    }

    async fn set_bundle_url(
        &self,
        project_id: &str,
        commit_id: &str,
        bundle_url: &str,
    ) -> Result<(), SandboxError> {
        let mut commits = self.commits.lock().await;
        let commits = commits
            .get_mut(project_id)
            .ok_or_else(|| SandboxError::not_found("commit", commit_id))?;
        apply_bundle_url(commits, project_id, commit_id, bundle_url)
    }
}

/// One JSON file per project under `dir`, replaced atomically on write.
#[derive(Debug)]
pub struct FileCommitStore {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Vec<Commit>>>,
}

impl FileCommitStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, project_id: &str) -> Result<PathBuf, SandboxError> {
        let valid = !project_id.is_empty()
            && project_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !project_id.starts_with('.');
        if !valid {
            return Err(SandboxError::validation("projectId", "contains unsupported characters"));
        }
        Ok(self.dir.join(format!("{project_id}.json")))
    }

    async fn load<'a>(
        &self,
        cache: &'a mut HashMap<String, Vec<Commit>>,
        project_id: &str,
    ) -> Result<&'a mut Vec<Commit>, SandboxError> {
        if !cache.contains_key(project_id) {
            let path = self.path_for(project_id)?;
            let commits = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<Vec<Commit>>(&bytes)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(err) => return Err(err.into()),
            };
            cache.insert(project_id.to_string(), commits);
        }
        cache
            .get_mut(project_id)
            .ok_or_else(|| SandboxError::internal("commit cache miss"))
    }

    async fn persist(&self, project_id: &str, commits: &[Commit]) -> Result<(), SandboxError> {
        let path = self.path_for(project_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(commits)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl CommitStore for FileCommitStore {
    async fn insert(&self, commit: Commit) -> Result<(), SandboxError> {
        let mut cache = self.cache.lock().await;
        let project_id = commit.project_id.clone();
        let commits = self.load(&mut cache, &project_id).await?;
        commits.push(commit);
        let snapshot = commits.clone();
        self.persist(&project_id, &snapshot).await
    }

    async fn get(&self, project_id: &str, commit_id: &str) -> Result<Option<Commit>, SandboxError> {
        let mut cache = self.cache.lock().await;
        let commits = self.load(&mut cache, project_id).await?;
        Ok(commits.iter().find(|commit| commit.id == commit_id).cloned())
    }

    async fn find_by_sha(&self, project_id: &str, sha: &str) -> Result<Option<Commit>, SandboxError> {
        let mut cache = self.cache.lock().await;
        let commits = self.load(&mut cache, project_id).await?;
        Ok(by_sha(commits, sha).cloned())
    }

    async fn list(&self, project_id: &str, limit: usize) -> Result<Vec<Commit>, SandboxError> {
        let mut cache = self.cache.lock().await;
        let commits = self.load(&mut cache, project_id).await?;
        Ok(newest_first(commits, limit))
    }

    async fn set_bundle_url(
        &self,
        project_id: &str,
        commit_id: &str,
        bundle_url: &str,
    ) -> Result<(), SandboxError> {
        let mut cache = self.cache.lock().await;
        let commits = self.load(&mut cache, project_id).await?;
        apply_bundle_url(commits, project_id, commit_id, bundle_url)?;
        let snapshot = commits.clone();
        self.persist(project_id, &snapshot).await
    }
}
