//! Version control backends for checkpoints.
//!
//! Restoring rewrites the index and working tree to an older commit but
//! leaves HEAD on the newest one, so history stays linear and pushes never
//! need force. The next checkpoint after a restore is therefore a new commit
//! on top of HEAD carrying the restored tree. HEAD is only reused when the
//! restored commit was HEAD already.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sandbox_studio_error::SandboxError;
use tracing::debug;

use crate::sandbox::{shell_quote, CommandRequest, MemorySandboxProvider, SandboxHandle};

/// Version control operations against a sandbox working tree.
#[async_trait]
pub trait VersionControlBackend: Send + Sync + std::fmt::Debug {
    async fn has_remote(&self, sandbox: &SandboxHandle, cwd: &str) -> Result<bool, SandboxError>;

    /// Stages everything and commits. With nothing to commit the current
    /// HEAD is returned unchanged.
    async fn commit_all(
        &self,
        sandbox: &SandboxHandle,
        cwd: &str,
        message: &str,
    ) -> Result<String, SandboxError>;

    async fn push(&self, sandbox: &SandboxHandle, cwd: &str) -> Result<(), SandboxError>;

    async fn head(&self, sandbox: &SandboxHandle, cwd: &str) -> Result<Option<String>, SandboxError>;

    async fn commit_exists(
        &self,
        sandbox: &SandboxHandle,
        cwd: &str,
        sha: &str,
    ) -> Result<bool, SandboxError>;

    /// Makes tracked files match `sha` exactly, discarding local changes.
    async fn checkout_tree(
        &self,
        sandbox: &SandboxHandle,
        cwd: &str,
        sha: &str,
    ) -> Result<(), SandboxError>;
}

/// Runs the git CLI inside the sandbox.
#[derive(Debug, Clone)]
pub struct SandboxGitBackend {
    author_name: String,
    author_email: String,
}

impl Default for SandboxGitBackend {
    fn default() -> Self {
        Self {
            author_name: "Sandbox Studio".to_string(),
            author_email: "studio@sandbox.local".to_string(),
        }
    }
}

impl SandboxGitBackend {
    pub fn new(author_name: impl Into<String>, author_email: impl Into<String>) -> Self {
        Self {
            author_name: author_name.into(),
            author_email: author_email.into(),
        }
    }

    fn git(&self, cwd: &str, args: &str) -> CommandRequest {
        CommandRequest::new(format!("git {args}"))
            .cwd(cwd)
            .env("GIT_AUTHOR_NAME", self.author_name.clone())
            .env("GIT_AUTHOR_EMAIL", self.author_email.clone())
            .env("GIT_COMMITTER_NAME", self.author_name.clone())
            .env("GIT_COMMITTER_EMAIL", self.author_email.clone())
            .env("GIT_TERMINAL_PROMPT", "0")
    }
}

fn validate_sha(sha: &str) -> Result<(), SandboxError> {
    if sha.len() < 4 || sha.len() > 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SandboxError::validation("commitSHA", "must be a hex commit id"));
    }
    Ok(())
}

#[async_trait]
impl VersionControlBackend for SandboxGitBackend {
    async fn has_remote(&self, sandbox: &SandboxHandle, cwd: &str) -> Result<bool, SandboxError> {
        let output = sandbox.exec_checked(&self.git(cwd, "remote")).await?;
        Ok(!output.stdout.trim().is_empty())
    }

    async fn commit_all(
        &self,
        sandbox: &SandboxHandle,
        cwd: &str,
        message: &str,
    ) -> Result<String, SandboxError> {
        sandbox.exec_checked(&self.git(cwd, "add -A")).await?;
        let staged = sandbox
            .exec(&self.git(cwd, "diff --cached --quiet"))
            .await?;
        let has_head = self.head(sandbox, cwd).await?.is_some();
        if staged.success() && has_head {
            debug!(sandbox_id = %sandbox.id, "nothing to commit; reusing HEAD");
        } else {
            let args = format!("commit --allow-empty -q -m {}", shell_quote(message));
            sandbox.exec_checked(&self.git(cwd, &args)).await?;
        }
        self.head(sandbox, cwd)
            .await?
            .ok_or_else(|| SandboxError::internal("git commit produced no HEAD"))
    }

    async fn push(&self, sandbox: &SandboxHandle, cwd: &str) -> Result<(), SandboxError> {
        let output = sandbox.exec(&self.git(cwd, "push -q origin HEAD")).await?;
        if output.success() {
            Ok(())
        } else {
            Err(SandboxError::transient(format!(
                "git push failed: {}",
                output.stderr.trim()
            )))
        }
    }

    async fn head(&self, sandbox: &SandboxHandle, cwd: &str) -> Result<Option<String>, SandboxError> {
        let output = sandbox
            .exec(&self.git(cwd, "rev-parse --verify -q HEAD"))
            .await?;
        let sha = output.stdout.trim();
        if output.success() && !sha.is_empty() {
            Ok(Some(sha.to_string()))
        } else {
            Ok(None)
        }
    }

    async fn commit_exists(
        &self,
        sandbox: &SandboxHandle,
        cwd: &str,
        sha: &str,
    ) -> Result<bool, SandboxError> {
        validate_sha(sha)?;
        let output = sandbox
            .exec(&self.git(cwd, &format!("cat-file -e {sha}^{{commit}}")))
            .await?;
        Ok(output.success())
    }

    async fn checkout_tree(
        &self,
        sandbox: &SandboxHandle,
        cwd: &str,
        sha: &str,
    ) -> Result<(), SandboxError> {
        validate_sha(sha)?;
        sandbox
            .exec_checked(&self.git(cwd, &format!("read-tree -u --reset {sha}")))
            .await?;
        sandbox.exec_checked(&self.git(cwd, "clean -fdq")).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Repository {
    commits: HashMap<String, BTreeMap<String, Vec<u8>>>,
    head: Option<String>,
    has_remote: bool,
    pushes: usize,
}

/// Content-addressed snapshots of a [`MemorySandboxProvider`] tree.
#[derive(Debug)]
pub struct MemoryVcsBackend {
    provider: Arc<MemorySandboxProvider>,
    repos: Mutex<HashMap<(String, String), Repository>>,
}

impl MemoryVcsBackend {
    pub fn new(provider: Arc<MemorySandboxProvider>) -> Self {
        Self {
            provider,
            repos: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_remote(&self, sandbox_id: &str, cwd: &str, has_remote: bool) {
        self.repos()
            .entry((sandbox_id.to_string(), cwd.to_string()))
            .or_default()
            .has_remote = has_remote;
    }

    pub fn push_count(&self, sandbox_id: &str, cwd: &str) -> usize {
        self.repos()
            .get(&(sandbox_id.to_string(), cwd.to_string()))
            .map(|repo| repo.pushes)
            .unwrap_or(0)
    }

    fn repos(&self) -> MutexGuard<'_, HashMap<(String, String), Repository>> {
        self.repos
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tracked_tree(&self, sandbox_id: &str, cwd: &str) -> Result<BTreeMap<String, Vec<u8>>, SandboxError> {
        let mut tree = self.provider.snapshot(sandbox_id, cwd)?;
        tree.retain(|path, _| is_tracked(path));
        Ok(tree)
    }
}

fn is_tracked(path: &str) -> bool {
    !path.starts_with(".git/")
}

fn tree_sha(parent: Option<&str>, tree: &BTreeMap<String, Vec<u8>>, message: &str) -> String {
    let mut low = std::collections::hash_map::DefaultHasher::new();
    parent.hash(&mut low);
    tree.hash(&mut low);
    message.hash(&mut low);
    let low = low.finish();
    let mut high = std::collections::hash_map::DefaultHasher::new();
    low.hash(&mut high);
    tree.len().hash(&mut high);
    let high = high.finish();
    format!("{high:016x}{low:016x}{:08x}", (low ^ high) as u32)
}

#[async_trait]
impl VersionControlBackend for MemoryVcsBackend {
    async fn has_remote(&self, sandbox: &SandboxHandle, cwd: &str) -> Result<bool, SandboxError> {
        Ok(self
            .repos()
            .get(&(sandbox.id.clone(), cwd.to_string()))
            .is_some_and(|repo| repo.has_remote))
    }

    async fn commit_all(
        &self,
        sandbox: &SandboxHandle,
        cwd: &str,
        message: &str,
    ) -> Result<String, SandboxError> {
        let tree = self.tracked_tree(&sandbox.id, cwd)?;
        let mut repos = self.repos();
        let repo = repos.entry((sandbox.id.clone(), cwd.to_string())).or_default();
        if let Some(head) = &repo.head {
            if repo.commits.get(head) == Some(&tree) {
                return Ok(head.clone());
            }
        }
        let sha = tree_sha(repo.head.as_deref(), &tree, message);
        repo.commits.insert(sha.clone(), tree);
        repo.head = Some(sha.clone());
        Ok(sha)
    }

    async fn push(&self, sandbox: &SandboxHandle, cwd: &str) -> Result<(), SandboxError> {
        let mut repos = self.repos();
        let repo = repos.entry((sandbox.id.clone(), cwd.to_string())).or_default();
        if !repo.has_remote {
            return Err(SandboxError::configuration("no remote configured"));
        }
        repo.pushes += 1;
        Ok(())
    }

    async fn head(&self, sandbox: &SandboxHandle, cwd: &str) -> Result<Option<String>, SandboxError> {
        Ok(self
            .repos()
            .get(&(sandbox.id.clone(), cwd.to_string()))
            .and_then(|repo| repo.head.clone()))
    }

    async fn commit_exists(
        &self,
        sandbox: &SandboxHandle,
        cwd: &str,
        sha: &str,
    ) -> Result<bool, SandboxError> {
        Ok(self
            .repos()
            .get(&(sandbox.id.clone(), cwd.to_string()))
            .is_some_and(|repo| repo.commits.contains_key(sha)))
    }

    async fn checkout_tree(
        &self,
        sandbox: &SandboxHandle,
        cwd: &str,
        sha: &str,
    ) -> Result<(), SandboxError> {
        let tree = self
            .repos()
            .get(&(sandbox.id.clone(), cwd.to_string()))
            .and_then(|repo| repo.commits.get(sha).cloned())
            .ok_or_else(|| SandboxError::not_found("commit", sha))?;
        self.provider.replace_tree(&sandbox.id, cwd, &tree, is_tracked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxSessionManager;

    async fn setup() -> (Arc<MemorySandboxProvider>, MemoryVcsBackend, SandboxHandle) {
        let provider = Arc::new(MemorySandboxProvider::new());
        provider.add_sandbox("s", "/app");
        let handle = SandboxSessionManager::new(provider.clone())
            .connect("s")
            .await
            .unwrap();
        (provider.clone(), MemoryVcsBackend::new(provider), handle)
    }

    #[tokio::test]
    async fn unchanged_tree_reuses_head() {
        let (provider, vcs, handle) = setup().await;
        provider.put_file("s", "/app/index.ts", "a");
        let first = vcs.commit_all(&handle, "/app", "one").await.unwrap();
        let second = vcs.commit_all(&handle, "/app", "two").await.unwrap();
        assert_eq!(first, second);
        provider.put_file("s", "/app/index.ts", "b");
        assert_ne!(vcs.commit_all(&handle, "/app", "three").await.unwrap(), first);
    }

    #[tokio::test]
    async fn checkout_discards_untracked_and_modified_files() {
        let (provider, vcs, handle) = setup().await;
        provider.put_file("s", "/app/index.ts", "a");
        let sha = vcs.commit_all(&handle, "/app", "one").await.unwrap();
        provider.put_file("s", "/app/index.ts", "changed");
        provider.put_file("s", "/app/new.ts", "new");
        vcs.checkout_tree(&handle, "/app", &sha).await.unwrap();
        assert_eq!(provider.file("s", "/app/index.ts"), Some(b"a".to_vec()));
        assert_eq!(provider.file("s", "/app/new.ts"), None);
    }

    #[tokio::test]
    async fn checkpoint_after_restore_commits_on_top_of_head() {
        let (provider, vcs, handle) = setup().await;
        provider.put_file("s", "/app/index.ts", "a");
        let first = vcs.commit_all(&handle, "/app", "one").await.unwrap();
        provider.put_file("s", "/app/index.ts", "b");
        let second = vcs.commit_all(&handle, "/app", "two").await.unwrap();

        vcs.checkout_tree(&handle, "/app", &first).await.unwrap();
        assert_eq!(vcs.head(&handle, "/app").await.unwrap(), Some(second.clone()));

        let third = vcs.commit_all(&handle, "/app", "after restore").await.unwrap();
        assert_ne!(third, first);
        assert_ne!(third, second);
        assert_eq!(vcs.head(&handle, "/app").await.unwrap(), Some(third.clone()));
        assert_eq!(provider.file("s", "/app/index.ts"), Some(b"a".to_vec()));

        vcs.checkout_tree(&handle, "/app", &third).await.unwrap();
        assert_eq!(vcs.commit_all(&handle, "/app", "noop").await.unwrap(), third);
    }

    #[tokio::test]
    async fn git_backend_issues_expected_commands() {
        let (provider, _, handle) = setup().await;
        let git = SandboxGitBackend::default();
        git.checkout_tree(&handle, "/app", "abc123").await.unwrap();
        let commands: Vec<String> = provider
            .commands()
            .into_iter()
            .map(|(_, request)| request.command)
            .collect();
        assert_eq!(
            commands,
            vec!["git read-tree -u --reset abc123", "git clean -fdq"]
        );
    }

    #[tokio::test]
    async fn git_backend_rejects_non_hex_sha() {
        let (_, _, handle) = setup().await;
        let err = SandboxGitBackend::default()
            .checkout_tree(&handle, "/app", "HEAD; rm -rf /")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
