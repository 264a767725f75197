//! Project registry, ownership checks, and per-project serialisation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use sandbox_studio_error::SandboxError;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_id: String,
    pub owner_id: String,
    pub sandbox_id: String,
    pub working_dir: String,
}

#[derive(Debug, Default)]
pub struct ProjectStore {
    projects: RwLock<HashMap<String, Project>>,
}

impl ProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, project: Project) -> Result<Project, SandboxError> {
        if project.project_id.trim().is_empty() {
            return Err(SandboxError::validation("projectId", "is required"));
        }
        if project.owner_id.trim().is_empty() {
            return Err(SandboxError::validation("userId", "is required"));
        }
        let mut projects = self
            .projects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = projects.get(&project.project_id) {
            if existing.owner_id != project.owner_id {
                return Err(SandboxError::conflict(format!(
                    "project {} is owned by another user",
                    project.project_id
                )));
            }
        }
        debug!(project_id = %project.project_id, sandbox_id = %project.sandbox_id, "project registered");
        projects.insert(project.project_id.clone(), project.clone());
        Ok(project)
    }

    pub fn get(&self, project_id: &str) -> Option<Project> {
        self.projects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(project_id)
            .cloned()
    }

    /// A project owned by someone else is indistinguishable from a missing one.
    pub fn authorize(&self, project_id: &str, user_id: &str) -> Result<Project, SandboxError> {
        match self.get(project_id) {
            Some(project) if project.owner_id == user_id => Ok(project),
            _ => Err(SandboxError::not_found("project", project_id)),
        }
    }

    /// Points every project using `old_id` at `new_id`.
    pub fn replace_sandbox(&self, old_id: &str, new_id: &str) {
        if old_id == new_id {
            return;
        }
        let mut projects = self
            .projects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for project in projects.values_mut() {
            if project.sandbox_id == old_id {
                project.sandbox_id = new_id.to_string();
            }
        }
    }
}

/// Serialises commit, restore and bundle work per project and tracks which
/// projects have an agent run in flight.
#[derive(Debug, Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    active_runs: Mutex<HashMap<String, usize>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds the project's lock until the guard drops. The entry is removed
    /// once nobody holds or waits for it.
    pub async fn lock(self: &Arc<Self>, project_id: &str) -> ProjectLockGuard {
        let lock = {
            let mut locks = lock_map(&self.locks);
            locks
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = lock.clone().lock_owned().await;
        ProjectLockGuard {
            locks: self.clone(),
            project_id: project_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Projects with a lock entry, held or not.
    pub fn lock_count(&self) -> usize {
        lock_map(&self.locks).len()
    }

    fn release(&self, project_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = lock_map(&self.locks);
        // Only the map and the releasing guard still refer to the mutex.
        let idle = locks
            .get(project_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, lock) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(project_id);
        }
    }

    /// Marks a run active until the returned guard is dropped.
    pub fn begin_run(self: &Arc<Self>, project_id: &str) -> RunGuard {
        *lock_map(&self.active_runs)
            .entry(project_id.to_string())
            .or_insert(0) += 1;
        RunGuard {
            locks: self.clone(),
            project_id: project_id.to_string(),
        }
    }

    pub fn is_running(&self, project_id: &str) -> bool {
        lock_map(&self.active_runs)
            .get(project_id)
            .is_some_and(|count| *count > 0)
    }

    fn end_run(&self, project_id: &str) {
        let mut runs = lock_map(&self.active_runs);
        if let Some(count) = runs.get_mut(project_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                runs.remove(project_id);
            }
        }
    }
}

fn lock_map<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct ProjectLockGuard {
    locks: Arc<ProjectLocks>,
    project_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ProjectLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release(&self.project_id, &self.lock);
    }
}

#[derive(Debug)]
pub struct RunGuard {
    locks: Arc<ProjectLocks>,
    project_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.locks.end_run(&self.project_id);
    }
}
