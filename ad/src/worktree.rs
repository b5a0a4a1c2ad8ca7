//! Worktree manager: a thin transactional wrapper around `git worktree`
//!
//! Every operation is serialised per repository root and idempotent where
//! the contract requires it (removing an already-removed worktree succeeds,
//! merging an empty branch returns the parent hash).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Directory under the repo root holding managed worktrees
pub const WORKTREES_DIR: &str = ".adaf-worktrees";

/// Error types for worktree operations
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("merge conflict: {0}")]
    MergeConflict(String),

    #[error("worktree not found: {0}")]
    NotFound(String),

    #[error("git command failed: {0}")]
    GitError(String),
}

type Result<T> = std::result::Result<T, WorktreeError>;

/// Manager for one repository's worktrees
#[derive(Debug)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    base_dir: PathBuf,
    /// Held across every underlying git invocation
    lock: Mutex<()>,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let base_dir = repo_root.join(WORKTREES_DIR);
        debug!(repo_root = %repo_root.display(), "WorktreeManager::new");
        Self {
            repo_root,
            base_dir,
            lock: Mutex::new(()),
        }
    }

    /// Worktree path and branch name for a spawn id
    pub fn spawn_paths(&self, spawn_id: u64) -> (PathBuf, String) {
        (
            self.base_dir.join(format!("spawn-{}", spawn_id)),
            format!("adaf/spawn/{}", spawn_id),
        )
    }

    /// Create a worktree on a fresh branch at `base_ref`
    pub async fn create(&self, path: &Path, branch: &str, base_ref: &str) -> Result<()> {
        debug!(path = %path.display(), branch, base_ref, "worktree create");
        let _guard = self.lock.lock().await;

        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| WorktreeError::CreateFailed(format!("creating {}: {}", self.base_dir.display(), e)))?;

        let output = self
            .git(
                &self.repo_root,
                &["worktree", "add", &path.to_string_lossy(), "-b", branch, base_ref],
            )
            .await?;
        if !output.status.success() {
            return Err(WorktreeError::CreateFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        info!(path = %path.display(), branch, "created worktree");
        Ok(())
    }

    /// Remove a worktree and its branch; silently succeeds if already gone
    pub async fn remove(&self, path: &Path, branch: Option<&str>) -> Result<()> {
        debug!(path = %path.display(), ?branch, "worktree remove");
        let _guard = self.lock.lock().await;

        if path.exists() {
            let output = self
                .git(&self.repo_root, &["worktree", "remove", &path.to_string_lossy(), "--force"])
                .await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("is not a working tree") {
                    return Err(WorktreeError::RemoveFailed(stderr.to_string()));
                }
            }
        } else {
            // prune bookkeeping for a worktree whose directory vanished
            let _ = self.git(&self.repo_root, &["worktree", "prune"]).await;
        }

        if let Some(branch) = branch {
            let _ = self.git(&self.repo_root, &["branch", "-D", branch]).await;
        }
        Ok(())
    }

    /// Merge `branch` into the repo's current HEAD, returning the resulting hash
    ///
    /// An empty (already-merged) branch leaves HEAD unchanged and returns the
    /// parent hash. A conflict aborts the merge and surfaces the git error.
    pub async fn merge(&self, branch: &str, squash: bool) -> Result<String> {
        debug!(branch, squash, "worktree merge");
        let _guard = self.lock.lock().await;

        let output = if squash {
            self.git(&self.repo_root, &["merge", "--squash", branch]).await?
        } else {
            self.git(
                &self.repo_root,
                &["merge", "--no-ff", "-m", &format!("merge {}", branch), branch],
            )
            .await?
        };

        if !output.status.success() {
            let message = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            let _ = self.git(&self.repo_root, &["merge", "--abort"]).await;
            return Err(WorktreeError::MergeConflict(message.trim().to_string()));
        }

        if squash {
            // --squash stages but does not commit; an empty stage is fine
            let commit = self
                .git(
                    &self.repo_root,
                    &["commit", "--no-verify", "-m", &format!("merge {} (squash)", branch)],
                )
                .await?;
            if !commit.status.success() {
                let text = String::from_utf8_lossy(&commit.stdout);
                if !text.contains("nothing to commit") {
                    return Err(WorktreeError::GitError(
                        String::from_utf8_lossy(&commit.stderr).to_string(),
                    ));
                }
            }
        }

        self.head_hash().await
    }

    /// Raw diff `base..branch`
    pub async fn diff(&self, branch: &str, base: &str) -> Result<String> {
        let _guard = self.lock.lock().await;
        let output = self
            .git(&self.repo_root, &["diff", &format!("{}..{}", base, branch)])
            .await?;
        if !output.status.success() {
            return Err(WorktreeError::GitError(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Managed worktree paths currently on disk
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(WorktreeError::GitError(format!("listing worktrees: {}", e))),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.path().is_dir() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Remove stale worktrees
    ///
    /// A worktree is stale iff its path is in `dead_paths` or its age
    /// exceeds `max_age`; `max_age` of zero removes every managed worktree.
    pub async fn cleanup_stale(&self, max_age: Duration, dead_paths: &[PathBuf]) -> Result<usize> {
        debug!(?max_age, dead = dead_paths.len(), "cleanup_stale");
        let mut removed = 0;
        for path in self.list().await? {
            let dead = dead_paths.contains(&path);
            let expired = max_age.is_zero() || path_age(&path).map(|age| age > max_age).unwrap_or(false);
            if !dead && !expired {
                continue;
            }
            let branch = branch_for_path(&path);
            match self.remove(&path, branch.as_deref()).await {
                Ok(()) => {
                    info!(path = %path.display(), "removed stale worktree");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale worktree"),
            }
        }
        Ok(removed)
    }

    /// Remove every managed worktree
    pub async fn cleanup_all(&self) -> Result<usize> {
        self.cleanup_stale(Duration::ZERO, &[]).await
    }

    /// Merge base between the current HEAD and `branch`
    pub async fn merge_base(&self, branch: &str) -> Result<String> {
        let _guard = self.lock.lock().await;
        let output = self.git(&self.repo_root, &["merge-base", "HEAD", branch]).await?;
        if !output.status.success() {
            return Err(WorktreeError::GitError(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Current HEAD hash of the repo root
    pub async fn head_hash(&self) -> Result<String> {
        let output = self.git(&self.repo_root, &["rev-parse", "HEAD"]).await?;
        if !output.status.success() {
            return Err(WorktreeError::GitError(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))
    }
}

/// Age of a path from its modification time
fn path_age(path: &Path) -> Option<Duration> {
    let modified = path.metadata().ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Recover the spawn branch name from a managed worktree path
fn branch_for_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix("spawn-")?;
    Some(format!("adaf/spawn/{}", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_git_repo(dir: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            let out = Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
            assert!(out.status.success(), "git {:?} failed", args);
        }
    }

    async fn commit_file(dir: &Path, name: &str, content: &str) {
        tokio::fs::write(dir.join(name), content).await.unwrap();
        for args in [vec!["add", "-A"], vec!["commit", "-m", "add file"]] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_create_and_remove_round_trip() {
        let repo = tempfile::tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let manager = WorktreeManager::new(repo.path());

        let (path, branch) = manager.spawn_paths(1);
        manager.create(&path, &branch, "HEAD").await.unwrap();
        assert!(path.exists());

        manager.remove(&path, Some(&branch)).await.unwrap();
        assert!(!path.exists());

        // idempotent
        manager.remove(&path, Some(&branch)).await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_lands_child_commit() {
        let repo = tempfile::tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let manager = WorktreeManager::new(repo.path());

        let (path, branch) = manager.spawn_paths(1);
        manager.create(&path, &branch, "HEAD").await.unwrap();
        commit_file(&path, "x.txt", "from child").await;

        let hash = manager.merge(&branch, false).await.unwrap();
        assert_eq!(hash.len(), 40);
        assert_eq!(manager.head_hash().await.unwrap(), hash);

        let merged = tokio::fs::read_to_string(repo.path().join("x.txt")).await.unwrap();
        assert_eq!(merged, "from child");
    }

    #[tokio::test]
    async fn test_merge_empty_branch_returns_parent_hash() {
        let repo = tempfile::tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let manager = WorktreeManager::new(repo.path());
        let before = manager.head_hash().await.unwrap();

        let (path, branch) = manager.spawn_paths(2);
        manager.create(&path, &branch, "HEAD").await.unwrap();

        let hash = manager.merge(&branch, false).await.unwrap();
        assert_eq!(hash, before);
    }

    #[tokio::test]
    async fn test_squash_merge_produces_single_commit() {
        let repo = tempfile::tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let manager = WorktreeManager::new(repo.path());

        let (path, branch) = manager.spawn_paths(3);
        manager.create(&path, &branch, "HEAD").await.unwrap();
        commit_file(&path, "a.txt", "one").await;
        commit_file(&path, "b.txt", "two").await;

        let hash = manager.merge(&branch, true).await.unwrap();
        assert_eq!(manager.head_hash().await.unwrap(), hash);
        assert!(repo.path().join("a.txt").exists());
        assert!(repo.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn test_conflict_surfaces_and_aborts() {
        let repo = tempfile::tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        commit_file(repo.path(), "shared.txt", "base").await;
        let manager = WorktreeManager::new(repo.path());

        let (path, branch) = manager.spawn_paths(4);
        manager.create(&path, &branch, "HEAD").await.unwrap();
        commit_file(&path, "shared.txt", "child version").await;
        commit_file(repo.path(), "shared.txt", "parent version").await;

        let err = manager.merge(&branch, false).await.unwrap_err();
        assert!(matches!(err, WorktreeError::MergeConflict(_)));

        // The abort leaves the parent tree clean
        let content = tokio::fs::read_to_string(repo.path().join("shared.txt")).await.unwrap();
        assert_eq!(content, "parent version");
    }

    #[tokio::test]
    async fn test_diff_shows_child_changes() {
        let repo = tempfile::tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let manager = WorktreeManager::new(repo.path());
        let base = manager.head_hash().await.unwrap();

        let (path, branch) = manager.spawn_paths(5);
        manager.create(&path, &branch, "HEAD").await.unwrap();
        commit_file(&path, "new.txt", "added line").await;

        let diff = manager.diff(&branch, &base).await.unwrap();
        assert!(diff.contains("new.txt"));
        assert!(diff.contains("added line"));
    }

    #[tokio::test]
    async fn test_cleanup_stale_by_dead_paths_and_all() {
        let repo = tempfile::tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let manager = WorktreeManager::new(repo.path());

        let (p1, b1) = manager.spawn_paths(1);
        let (p2, b2) = manager.spawn_paths(2);
        manager.create(&p1, &b1, "HEAD").await.unwrap();
        manager.create(&p2, &b2, "HEAD").await.unwrap();

        // Only p1 is dead; a day-long max_age keeps fresh worktrees
        let removed = manager
            .cleanup_stale(Duration::from_secs(86_400), &[p1.clone()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!p1.exists());
        assert!(p2.exists());

        // max_age zero removes everything managed
        let removed = manager.cleanup_all().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!p2.exists());
    }
}
