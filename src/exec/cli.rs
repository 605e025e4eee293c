//! [`AgentInvoker`] backed by the real agent CLI and `sh`.

use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{AgentInvoker, InvocationResult};
use crate::subprocess::error::ProcessError;
use crate::subprocess::runner::ProcessOutput;
use crate::subprocess::{ProcessCommandBuilder, SubprocessManager};

/// Invoker that shells out to the agent CLI (`claude` by default) for prompt
/// steps and to `sh -c` for command steps.
pub struct CliInvoker {
    subprocess: SubprocessManager,
    agent_command: String,
    agent_args: Vec<String>,
    timeout: Option<Duration>,
}

impl CliInvoker {
    pub fn new(subprocess: SubprocessManager) -> Self {
        Self {
            subprocess,
            agent_command: "claude".to_string(),
            agent_args: Vec::new(),
            timeout: None,
        }
    }

    /// Override the agent binary name.
    pub fn with_agent_command(mut self, command: impl Into<String>) -> Self {
        self.agent_command = command.into();
        self
    }

    /// Extra arguments inserted before the prompt on every agent invocation.
    pub fn with_agent_args(mut self, args: Vec<String>) -> Self {
        self.agent_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn result_from_output(output: ProcessOutput) -> InvocationResult {
        InvocationResult {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    /// A killed-on-timeout attempt reads as a failed result so the retry
    /// policy can match on it instead of aborting the step outright.
    fn timeout_result(duration: Duration) -> InvocationResult {
        InvocationResult {
            success: false,
            stdout: String::new(),
            stderr: format!("timed out after {}s", duration.as_secs()),
            exit_code: None,
        }
    }
}

#[async_trait]
impl AgentInvoker for CliInvoker {
    async fn run_prompt(
        &self,
        prompt: &str,
        model: Option<&str>,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<InvocationResult> {
        let mut builder = ProcessCommandBuilder::new(&self.agent_command)
            .args(["--print", "--dangerously-skip-permissions"]);
        if let Some(model) = model {
            builder = builder.args(["--model", model]);
        }
        builder = builder
            .args(self.agent_args.iter().map(String::as_str))
            .arg(prompt)
            .current_dir(working_dir)
            // The agent CLI waits on stdin unless it is handed (and closed) explicitly.
            .stdin("");
        for (key, value) in env {
            builder = builder.env(key, value);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        debug!("Invoking {} for prompt step", self.agent_command);
        match self.subprocess.runner().run(builder.build()).await {
            Ok(output) => Ok(Self::result_from_output(output)),
            Err(ProcessError::Timeout(duration)) => Ok(Self::timeout_result(duration)),
            Err(e) => Err(e).with_context(|| format!("failed to run {}", self.agent_command)),
        }
    }

    async fn run_command(
        &self,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<InvocationResult> {
        let mut builder = ProcessCommandBuilder::new("sh")
            .args(["-c", command])
            .current_dir(working_dir);
        for (key, value) in env {
            builder = builder.env(key, value);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        debug!("Running shell command: {command}");
        match self.subprocess.runner().run(builder.build()).await {
            Ok(output) => Ok(Self::result_from_output(output)),
            Err(ProcessError::Timeout(duration)) => Ok(Self::timeout_result(duration)),
            Err(e) => Err(e).with_context(|| format!("failed to run shell command '{command}'")),
        }
    }
}
