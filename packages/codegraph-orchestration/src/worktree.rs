//! Worktree provisioning over a content-addressed bare-mirror cache.
//!
//! Every remote gets one bare mirror, keyed by a hash of its normalized URL,
//! fetched under an exclusive file lock so concurrent jobs never race a
//! `git fetch`. An indexing job then checks out a detached
//! [`EphemeralWorktree`] for one commit; dropping the guard removes the
//! worktree directory and prunes its git metadata on every exit path,
//! including panics.

use crate::error::{OrchestratorError, Result};
use codegraph_storage::content_hash;
use fs2::FileExt;
use git2::{build::CheckoutBuilder, Repository};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Capability set for resolving a repository URL to a checked-out commit.
#[async_trait::async_trait]
pub trait WorktreeProvider: Send + Sync {
    /// Idempotent: fetches into the cached bare mirror if it already
    /// exists, clones it otherwise. Concurrent-safe via an exclusive lock
    /// on a sidecar lock file.
    async fn ensure_repo_updated(&self, url: &str) -> Result<PathBuf>;

    /// Resolves a local branch, `refs/remotes/origin/*`, or tag to a commit
    /// hash.
    async fn get_head_commit(&self, url: &str, reference: &str) -> Result<String>;

    /// Checks out `commit_hash` into a fresh detached worktree. Caller owns
    /// cleanup via the returned guard's `Drop`.
    async fn ephemeral_worktree(&self, url: &str, commit_hash: &str) -> Result<EphemeralWorktree>;

    /// Removes orphaned worktree directories (crashed job, killed process)
    /// older than `max_age`.
    async fn cleanup_orphaned_workspaces(&self, max_age: Duration) -> Result<usize>;
}

/// RAII guard for a detached worktree checkout. `git worktree remove
/// --force` plus directory deletion run on every drop path, so a panicked
/// indexing job never leaks a checkout.
pub struct EphemeralWorktree {
    path: PathBuf,
    repo_path: PathBuf,
    worktree_name: String,
}

impl EphemeralWorktree {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EphemeralWorktree {
    fn drop(&mut self) {
        if let Ok(repo) = Repository::open(&self.repo_path) {
            if let Ok(wt) = repo.find_worktree(&self.worktree_name) {
                let mut prune_opts = git2::WorktreePruneOptions::new();
                prune_opts.valid(true).working_tree(true);
                if let Err(e) = wt.prune(Some(&mut prune_opts)) {
                    warn!("worktree: failed to prune '{}': {}", self.worktree_name, e);
                }
            }
        }
        if self.path.exists() {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                warn!("worktree: failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// `git2`-backed implementation. Bare mirrors live under
/// `<cache_root>/<hash(url)>.git`; a `.lock` sidecar guards `fetch`.
pub struct Git2WorktreeProvider {
    cache_root: PathBuf,
}

impl Git2WorktreeProvider {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    fn normalized_url_key(url: &str) -> String {
        content_hash(url.trim_end_matches('/').trim_end_matches(".git"))
    }

    fn mirror_path(&self, url: &str) -> PathBuf {
        self.cache_root.join(format!("{}.git", Self::normalized_url_key(url)))
    }

    fn lock_path(&self, url: &str) -> PathBuf {
        self.cache_root.join(format!("{}.lock", Self::normalized_url_key(url)))
    }

    fn acquire_lock(&self, url: &str) -> Result<File> {
        fs::create_dir_all(&self.cache_root).map_err(OrchestratorError::Io)?;
        let lock_file = File::create(self.lock_path(url)).map_err(OrchestratorError::Io)?;
        lock_file.lock_exclusive().map_err(OrchestratorError::Io)?;
        Ok(lock_file)
    }
}

#[async_trait::async_trait]
impl WorktreeProvider for Git2WorktreeProvider {
    async fn ensure_repo_updated(&self, url: &str) -> Result<PathBuf> {
        let url = url.to_string();
        let cache_root = self.cache_root.clone();
        let mirror_path = self.mirror_path(&url);
        let lock_file = self.acquire_lock(&url)?;

        let result = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            let _lock = lock_file; // held until this closure returns

            if mirror_path.exists() {
                let repo = Repository::open_bare(&mirror_path)
                    .map_err(|e| OrchestratorError::Config(format!("opening bare mirror: {e}")))?;
                let mut remote = repo
                    .find_remote("origin")
                    .map_err(|e| OrchestratorError::Config(format!("finding origin: {e}")))?;
                remote
                    .fetch(&["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"], None, None)
                    .map_err(|e| OrchestratorError::Config(format!("git fetch --prune: {e}")))?;
                info!("worktree: fetched updates for {}", url);
            } else {
                fs::create_dir_all(&cache_root).map_err(OrchestratorError::Io)?;
                Repository::init_bare(&mirror_path)
                    .map_err(|e| OrchestratorError::Config(format!("initializing bare mirror: {e}")))?;
                let repo = Repository::open_bare(&mirror_path)
                    .map_err(|e| OrchestratorError::Config(format!("opening bare mirror: {e}")))?;
                let mut remote = repo
                    .remote("origin", &url)
                    .map_err(|e| OrchestratorError::Config(format!("adding origin: {e}")))?;
                remote
                    .fetch(&["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"], None, None)
                    .map_err(|e| OrchestratorError::Config(format!("initial clone fetch: {e}")))?;
                info!("worktree: created bare mirror for {}", url);
            }

            Ok(mirror_path)
        })
        .await
        .map_err(|e| OrchestratorError::StageExecutionFailed(format!("ensure_repo_updated panicked: {e}")))?;

        result
    }

    async fn get_head_commit(&self, url: &str, reference: &str) -> Result<String> {
        let mirror_path = self.ensure_repo_updated(url).await?;
        let reference = reference.to_string();

        tokio::task::spawn_blocking(move || -> Result<String> {
            let repo = Repository::open_bare(&mirror_path)
                .map_err(|e| OrchestratorError::Config(format!("opening bare mirror: {e}")))?;

            for candidate in [
                reference.clone(),
                format!("refs/heads/{reference}"),
                format!("refs/remotes/origin/{reference}"),
                format!("refs/tags/{reference}"),
            ] {
                if let Ok(obj) = repo.revparse_single(&candidate) {
                    if let Ok(commit) = obj.peel_to_commit() {
                        return Ok(commit.id().to_string());
                    }
                }
            }

            Err(OrchestratorError::Config(format!("unresolvable ref: {reference}")))
        })
        .await
        .map_err(|e| OrchestratorError::StageExecutionFailed(format!("get_head_commit panicked: {e}")))?
    }

    async fn ephemeral_worktree(&self, url: &str, commit_hash: &str) -> Result<EphemeralWorktree> {
        let mirror_path = self.ensure_repo_updated(url).await?;
        let commit_hash = commit_hash.to_string();
        let worktree_name = format!("wt-{}", Uuid::new_v4());
        let worktree_path = std::env::temp_dir().join("codegraph-worktrees").join(&worktree_name);

        let result = tokio::task::spawn_blocking({
            let worktree_path = worktree_path.clone();
            let worktree_name = worktree_name.clone();
            move || -> Result<()> {
                fs::create_dir_all(worktree_path.parent().unwrap()).map_err(OrchestratorError::Io)?;

                let repo = Repository::open_bare(&mirror_path)
                    .map_err(|e| OrchestratorError::Config(format!("opening bare mirror: {e}")))?;
                let commit_oid = git2::Oid::from_str(&commit_hash)
                    .map_err(|e| OrchestratorError::Config(format!("invalid commit hash: {e}")))?;
                let commit = repo
                    .find_commit(commit_oid)
                    .map_err(|e| OrchestratorError::Config(format!("commit not found: {e}")))?;

                let worktree = repo
                    .worktree(&worktree_name, &worktree_path, None)
                    .map_err(|e| OrchestratorError::Config(format!("git worktree add: {e}")))?;

                let wt_repo = Repository::open_from_worktree(&worktree)
                    .map_err(|e| OrchestratorError::Config(format!("opening worktree repo: {e}")))?;
                wt_repo
                    .set_head_detached(commit.id())
                    .map_err(|e| OrchestratorError::Config(format!("detaching HEAD: {e}")))?;
                wt_repo
                    .checkout_head(Some(CheckoutBuilder::new().force()))
                    .map_err(|e| OrchestratorError::Config(format!("checkout: {e}")))?;

                Ok(())
            }
        })
        .await
        .map_err(|e| OrchestratorError::StageExecutionFailed(format!("ephemeral_worktree panicked: {e}")))?;

        result?;

        Ok(EphemeralWorktree {
            path: worktree_path,
            repo_path: mirror_path,
            worktree_name,
        })
    }

    async fn cleanup_orphaned_workspaces(&self, max_age: Duration) -> Result<usize> {
        let root = std::env::temp_dir().join("codegraph-worktrees");
        if !root.exists() {
            return Ok(0);
        }

        let now = std::time::SystemTime::now();
        let mut removed = 0usize;

        for entry in fs::read_dir(&root).map_err(OrchestratorError::Io)? {
            let entry = entry.map_err(OrchestratorError::Io)?;
            let metadata = entry.metadata().map_err(OrchestratorError::Io)?;
            let age = now
                .duration_since(metadata.modified().map_err(OrchestratorError::Io)?)
                .unwrap_or_default();
            if age > max_age {
                if fs::remove_dir_all(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_url_key_ignores_trailing_slash_and_git_suffix() {
        let a = Git2WorktreeProvider::normalized_url_key("https://example.com/acme/widget.git");
        let b = Git2WorktreeProvider::normalized_url_key("https://example.com/acme/widget/");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn ensure_repo_updated_clones_then_reuses_mirror() {
        let cache_dir = tempfile::tempdir().unwrap();
        let upstream_dir = tempfile::tempdir().unwrap();

        std::process::Command::new("git")
            .args(["init"])
            .current_dir(upstream_dir.path())
            .output()
            .unwrap();
        std::process::Command::new("git")
            .args(["config", "user.email", "test@test.com"])
            .current_dir(upstream_dir.path())
            .output()
            .unwrap();
        std::process::Command::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(upstream_dir.path())
            .output()
            .unwrap();
        std::fs::write(upstream_dir.path().join("a.txt"), "hello").unwrap();
        std::process::Command::new("git")
            .args(["add", "."])
            .current_dir(upstream_dir.path())
            .output()
            .unwrap();
        std::process::Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(upstream_dir.path())
            .output()
            .unwrap();

        let provider = Git2WorktreeProvider::new(cache_dir.path());
        let url = upstream_dir.path().to_string_lossy().to_string();

        let first = provider.ensure_repo_updated(&url).await.unwrap();
        let second = provider.ensure_repo_updated(&url).await.unwrap();
        assert_eq!(first, second);
    }
}
