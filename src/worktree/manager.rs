use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{directory_name, IsolationProvider, Worktree};
use crate::error::IsolationError;
use crate::subprocess::{ProcessCommandBuilder, ProcessOutput, SubprocessManager};

/// Git-backed isolation provider. Worktrees live under a dedicated base
/// directory outside the repository so agents can never commit them.
pub struct WorktreeManager {
    repo_path: PathBuf,
    base_dir: PathBuf,
    subprocess: SubprocessManager,
}

impl WorktreeManager {
    /// Manager with the default base directory,
    /// `~/.drover/worktrees/<repo-name>/`.
    pub fn new(repo_path: &Path, subprocess: SubprocessManager) -> Result<Self, IsolationError> {
        let repo_name = repo_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                IsolationError::BaseDir(format!(
                    "cannot derive repository name from '{}'",
                    repo_path.display()
                ))
            })?;
        let home = dirs::home_dir()
            .ok_or_else(|| IsolationError::BaseDir("home directory unavailable".to_string()))?;
        let base_dir = home.join(".drover").join("worktrees").join(repo_name);
        Self::with_base_dir(repo_path, &base_dir, subprocess)
    }

    /// Manager with an explicit base directory. Used when the configuration
    /// overrides the worktree location, and by tests.
    pub fn with_base_dir(
        repo_path: &Path,
        base_dir: &Path,
        subprocess: SubprocessManager,
    ) -> Result<Self, IsolationError> {
        std::fs::create_dir_all(base_dir).map_err(|e| {
            IsolationError::BaseDir(format!(
                "cannot create '{}': {}",
                base_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
            subprocess,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    async fn git(&self, args: &[&str]) -> Result<ProcessOutput, IsolationError> {
        let command = ProcessCommandBuilder::new("git")
            .current_dir(&self.repo_path)
            .args(args)
            .build();
        self.subprocess
            .runner()
            .run(command)
            .await
            .map_err(|e| IsolationError::Git(e.to_string()))
    }

    /// Paths of every worktree git currently knows about.
    async fn registered_paths(&self) -> Result<HashSet<PathBuf>, IsolationError> {
        let output = self.git(&["worktree", "list", "--porcelain"]).await?;
        if !output.status.success() {
            return Err(IsolationError::Git(format!(
                "git worktree list failed: {}",
                output.stderr
            )));
        }
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }
}

#[async_trait]
impl IsolationProvider for WorktreeManager {
    async fn create(&self, branch: &str, base: Option<&str>) -> Result<Worktree, IsolationError> {
        let path = self.base_dir.join(directory_name(branch));
        let path_arg = path.to_string_lossy().to_string();

        let mut args = vec!["worktree", "add", "-b", branch, path_arg.as_str()];
        if let Some(base) = base {
            args.push(base);
        }

        debug!("creating worktree for branch {} at {}", branch, path.display());
        let output = self.git(&args).await?;
        if !output.status.success() {
            return Err(IsolationError::Create {
                branch: branch.to_string(),
                message: output.stderr.trim().to_string(),
            });
        }

        Ok(Worktree {
            path,
            branch: branch.to_string(),
            base_branch: base.unwrap_or("HEAD").to_string(),
        })
    }

    async fn remove(&self, worktree: &Worktree) -> Result<(), IsolationError> {
        let path_arg = worktree.path.to_string_lossy().to_string();
        let output = self
            .git(&["worktree", "remove", "--force", path_arg.as_str()])
            .await?;

        if !output.status.success() && !output.stderr.contains("is not a working tree") {
            return Err(IsolationError::Remove {
                path: worktree.path.display().to_string(),
                message: output.stderr.trim().to_string(),
            });
        }

        // The branch is scoped to one run; losing the delete only leaves a
        // stale ref behind, so a warning is enough.
        let delete = self.git(&["branch", "-D", &worktree.branch]).await?;
        if !delete.status.success() {
            warn!(
                "could not delete branch {}: {}",
                worktree.branch,
                delete.stderr.trim()
            );
        }

        debug!("removed worktree at {}", worktree.path.display());
        Ok(())
    }

    async fn prune_orphaned(&self) -> Result<usize, IsolationError> {
        let prune = self.git(&["worktree", "prune"]).await?;
        if !prune.status.success() {
            return Err(IsolationError::Git(format!(
                "git worktree prune failed: {}",
                prune.stderr
            )));
        }

        let registered = self.registered_paths().await?;
        let mut swept = 0;

        let mut entries = tokio::fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| IsolationError::BaseDir(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| IsolationError::BaseDir(e.to_string()))?
        {
            let path = entry.path();
            if !path.is_dir() || registered.contains(&path) {
                continue;
            }
            warn!("sweeping orphaned worktree directory {}", path.display());
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| IsolationError::Remove {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            swept += 1;
        }

        Ok(swept)
    }
}
