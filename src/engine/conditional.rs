//! Executor for `conditional` steps. Exactly one branch runs; the unchosen
//! branch leaves no trace in the run's records.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::serial::{run_children, ChildrenOutcome};
use super::{ExecutionScope, RunContext, StepEngine, StepExecutor, StepOutcome};
use crate::error::{EngineError, Result};
use crate::progress::StepOutput;
use crate::workflow::{StepDefinition, StepKind};

pub struct ConditionalExecutor;

#[async_trait]
impl StepExecutor for ConditionalExecutor {
    async fn execute(
        &self,
        engine: &Arc<StepEngine>,
        step: &StepDefinition,
        ctx: &mut RunContext,
        scope: &ExecutionScope,
    ) -> Result<StepOutcome> {
        let StepKind::Conditional {
            condition,
            then,
            otherwise,
        } = &step.kind
        else {
            return Err(EngineError::StepExecution {
                step: step.name.clone(),
                message: format!(
                    "conditional executor dispatched a '{}' step",
                    step.kind.name()
                ),
            });
        };

        let verdict = match engine
            .conditions()
            .evaluate(condition, &ctx.to_template_context())
        {
            Ok(verdict) => verdict,
            Err(e) => {
                scope
                    .log
                    .error(Some(&scope.path_prefix), format!("condition error: {e}"))
                    .await;
                return Ok(StepOutcome::failed(StepOutput::failed(
                    "condition evaluation failed",
                    e.to_string(),
                )));
            }
        };
        debug!(step = %scope.path_prefix, verdict, "condition evaluated");

        let branch = if verdict {
            Some(then)
        } else {
            otherwise.as_ref()
        };
        let Some(branch) = branch else {
            return Ok(StepOutcome::completed(StepOutput::succeeded(
                "condition false, nothing to run",
                "",
            )));
        };

        match run_children(engine, branch, ctx, scope).await? {
            ChildrenOutcome::AllCompleted { count } => {
                Ok(StepOutcome::completed(StepOutput::succeeded(
                    format!(
                        "condition {verdict}, {count} step(s) completed"
                    ),
                    "",
                )))
            }
            ChildrenOutcome::Stopped { path, error, .. } => {
                Ok(StepOutcome::failed(StepOutput::failed(
                    format!("stopped at '{path}'"),
                    format!("step '{path}' failed: {error}"),
                )))
            }
        }
    }
}
