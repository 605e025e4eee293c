//! Invocation of leaf step work: agent prompts and shell commands.
//!
//! The engine talks to this layer through [`AgentInvoker`] so tests can swap
//! in scripted results without spawning processes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

pub mod cli;

pub use cli::CliInvoker;

/// Outcome of one invocation attempt. `success` reflects the process exit
/// status; spawn failures surface as `Err` from the invoker instead.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl InvocationResult {
    /// The text a failed attempt should be described by: stderr when present,
    /// stdout otherwise, exit code as a last resort.
    pub fn failure_detail(&self) -> String {
        if !self.stderr.trim().is_empty() {
            self.stderr.trim().to_string()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "terminated without exit code".to_string(),
            }
        }
    }
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Run an agent prompt in `working_dir`, optionally overriding the model.
    async fn run_prompt(
        &self,
        prompt: &str,
        model: Option<&str>,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<InvocationResult>;

    /// Run a shell command in `working_dir`.
    async fn run_command(
        &self,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<InvocationResult>;
}
