//! Git worktree isolation for parallel branches.
//!
//! Every parallel child runs in its own worktree so concurrent agents never
//! share a working directory. Acquire and release always travel in pairs;
//! `prune_orphaned` sweeps up after crashed runs.

pub mod manager;

pub use manager::WorktreeManager;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::IsolationError;

/// An isolated working directory bound to a dedicated branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
}

#[async_trait]
pub trait IsolationProvider: Send + Sync {
    /// Acquire an isolated working directory on a fresh branch. `base` is
    /// the commit-ish to branch from; `None` means the current HEAD.
    async fn create(&self, branch: &str, base: Option<&str>) -> Result<Worktree, IsolationError>;

    /// Release a worktree. Must succeed when the directory is already gone.
    async fn remove(&self, worktree: &Worktree) -> Result<(), IsolationError>;

    /// Remove leftover worktree directories from runs that never released
    /// them. Returns how many were swept.
    async fn prune_orphaned(&self) -> Result<usize, IsolationError>;
}

/// Branch name for one parallel child: unique per run and per step path.
pub fn branch_name(run_id: &str, step_path: &str) -> String {
    format!("drover/{}/{}", run_id, slugify(step_path))
}

/// Directory-safe form of a branch name.
pub fn directory_name(branch: &str) -> String {
    branch.replace('/', "-")
}

fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            slug.push(ch.to_ascii_lowercase());
        } else {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}
