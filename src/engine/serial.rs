//! Executor for `serial` steps, plus the child-sequencing helper shared
//! with conditional branches and loop iterations.

use async_trait::async_trait;
use std::sync::Arc;

use super::{ExecutionScope, RunContext, StepEngine, StepExecutor, StepOutcome};
use crate::error::{EngineError, Result};
use crate::progress::{StepOutput, StepStatus};
use crate::workflow::{StepDefinition, StepKind};

/// How a sibling sequence ended.
pub(crate) enum ChildrenOutcome {
    AllCompleted { count: usize },
    /// The sequence stopped at `path`; later siblings never ran.
    Stopped {
        path: String,
        status: StepStatus,
        error: String,
    },
}

/// Run `children` in order under `scope` (whose `path_prefix` is the parent
/// step's path). Each child's output lands in the context before the next
/// child starts; the first non-success stops the sequence. Cancellation
/// propagates out through the per-step poll in `execute_step`.
pub(crate) async fn run_children(
    engine: &Arc<StepEngine>,
    children: &[StepDefinition],
    ctx: &mut RunContext,
    scope: &ExecutionScope,
) -> Result<ChildrenOutcome> {
    for child in children {
        let child_scope = scope.descend(&child.name);
        let outcome = engine.execute_step(child, ctx, &child_scope).await?;
        ctx.insert_output(&child.name, outcome.output.clone());
        scope.progress.lock().await.record_child(
            &child_scope.path_prefix,
            outcome.status,
            &outcome.output.summary,
        );
        if !outcome.succeeded() {
            return Ok(ChildrenOutcome::Stopped {
                path: child_scope.path_prefix,
                status: outcome.status,
                error: outcome.failure_reason(),
            });
        }
    }
    Ok(ChildrenOutcome::AllCompleted {
        count: children.len(),
    })
}

pub struct SerialExecutor;

#[async_trait]
impl StepExecutor for SerialExecutor {
    async fn execute(
        &self,
        engine: &Arc<StepEngine>,
        step: &StepDefinition,
        ctx: &mut RunContext,
        scope: &ExecutionScope,
    ) -> Result<StepOutcome> {
        let StepKind::Serial { steps } = &step.kind else {
            return Err(EngineError::StepExecution {
                step: step.name.clone(),
                message: format!("serial executor dispatched a '{}' step", step.kind.name()),
            });
        };

        match run_children(engine, steps, ctx, scope).await? {
            ChildrenOutcome::AllCompleted { count } => Ok(StepOutcome::completed(
                StepOutput::succeeded(format!("{count} steps completed"), ""),
            )),
            ChildrenOutcome::Stopped { path, error, .. } => {
                Ok(StepOutcome::failed(StepOutput::failed(
                    format!("stopped at '{path}'"),
                    format!("step '{path}' failed: {error}"),
                )))
            }
        }
    }
}
