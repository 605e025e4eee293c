//! Executor for `leaf-prompt` and `leaf-command` steps.
//!
//! A leaf renders its template, invokes the agent or shell, and retries per
//! its policy. The attempt in flight is never interrupted; cancellation is
//! observed while waiting out the backoff between attempts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{ExecutionScope, RunContext, StepEngine, StepExecutor, StepOutcome};
use crate::error::{EngineError, Result};
use crate::exec::InvocationResult;
use crate::progress::StepOutput;
use crate::workflow::{StepDefinition, StepKind};

const SUMMARY_LIMIT: usize = 120;

pub struct LeafExecutor;

#[async_trait]
impl StepExecutor for LeafExecutor {
    async fn execute(
        &self,
        engine: &Arc<StepEngine>,
        step: &StepDefinition,
        ctx: &mut RunContext,
        scope: &ExecutionScope,
    ) -> Result<StepOutcome> {
        let (template, model, env, retry_override) = match &step.kind {
            StepKind::LeafPrompt {
                prompt,
                model,
                env,
                retry,
            } => (prompt, model.as_deref(), env, retry),
            StepKind::LeafCommand {
                command,
                env,
                retry,
            } => (command, None, env, retry),
            other => {
                return Err(EngineError::StepExecution {
                    step: step.name.clone(),
                    message: format!("leaf executor dispatched a '{}' step", other.name()),
                })
            }
        };

        let rendered = match engine.templates().render(template, &ctx.to_template_context()) {
            Ok(rendered) => rendered,
            // A bad reference will not get better on retry; fail right away.
            Err(e) => {
                scope
                    .log
                    .error(Some(&scope.path_prefix), format!("template error: {e}"))
                    .await;
                return Ok(StepOutcome::failed(StepOutput::failed(
                    "template rendering failed",
                    e.to_string(),
                )));
            }
        };

        let policy = retry_override
            .as_ref()
            .unwrap_or_else(|| engine.default_retry());
        let is_prompt = matches!(step.kind, StepKind::LeafPrompt { .. });

        let mut attempt: u32 = 1;
        loop {
            debug!(
                step = %scope.path_prefix,
                attempt,
                "invoking {}",
                if is_prompt { "agent" } else { "shell" }
            );
            let result = self
                .invoke(engine, is_prompt, &rendered, model, env, scope)
                .await;

            if result.success {
                let summary = summarize(&result.stdout);
                scope
                    .log
                    .information(
                        Some(&scope.path_prefix),
                        format!("completed on attempt {attempt}"),
                    )
                    .await;
                return Ok(StepOutcome::completed(StepOutput::succeeded(
                    summary,
                    result.stdout,
                )));
            }

            let detail = result.failure_detail();
            scope
                .log
                .warning(
                    Some(&scope.path_prefix),
                    format!("attempt {attempt} failed: {detail}"),
                )
                .await;

            if !policy.should_retry(attempt, &detail) {
                scope
                    .log
                    .error(
                        Some(&scope.path_prefix),
                        format!("failed after {attempt} attempt(s): {detail}"),
                    )
                    .await;
                return Ok(StepOutcome::failed_after(
                    StepOutput::failed(format!("failed after {attempt} attempt(s)"), detail),
                    attempt,
                ));
            }

            // Retries consumed so far; only sticks when this leaf is the
            // top-level step in flight.
            scope
                .progress
                .lock()
                .await
                .note_retry(&scope.path_prefix, attempt);

            let delay = policy.backoff(attempt);
            debug!(step = %scope.path_prefix, ?delay, "backing off before retry");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = scope.cancel.cancelled() => return Err(EngineError::Cancelled),
            }
            if scope.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            attempt += 1;
        }
    }
}

impl LeafExecutor {
    /// One attempt. Spawn-level errors read as failed attempts so the retry
    /// policy can match on them like any other failure.
    async fn invoke(
        &self,
        engine: &Arc<StepEngine>,
        is_prompt: bool,
        rendered: &str,
        model: Option<&str>,
        env: &HashMap<String, String>,
        scope: &ExecutionScope,
    ) -> InvocationResult {
        let attempt = if is_prompt {
            engine
                .invoker()
                .run_prompt(rendered, model, &scope.working_dir, env)
                .await
        } else {
            engine
                .invoker()
                .run_command(rendered, &scope.working_dir, env)
                .await
        };
        attempt.unwrap_or_else(|e| InvocationResult {
            success: false,
            stdout: String::new(),
            stderr: format!("{e:#}"),
            exit_code: None,
        })
    }
}

/// First line of the output, trimmed and capped. Empty output reads as a
/// plain "completed".
fn summarize(stdout: &str) -> String {
    let first_line = stdout.lines().find(|line| !line.trim().is_empty());
    match first_line {
        Some(line) => {
            let line = line.trim();
            if line.len() > SUMMARY_LIMIT {
                let cut = line
                    .char_indices()
                    .take_while(|(i, _)| *i < SUMMARY_LIMIT)
                    .last()
                    .map(|(i, c)| i + c.len_utf8())
                    .unwrap_or(line.len());
                format!("{}...", &line[..cut])
            } else {
                line.to_string()
            }
        }
        None => "completed".to_string(),
    }
}
