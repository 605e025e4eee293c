//! Executor for `bounded-loop` steps: repeat the children until an exit
//! condition holds or the iteration cap is hit, whichever comes first.
//!
//! The cap is the guard against a runaway agent loop. Hitting it with the
//! exit condition still unmet is the distinct `Exhausted` outcome, not a
//! generic failure.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::serial::{run_children, ChildrenOutcome};
use super::{ExecutionScope, RunContext, StepEngine, StepExecutor, StepOutcome};
use crate::error::{EngineError, Result};
use crate::progress::StepOutput;
use crate::workflow::{StepDefinition, StepKind};

pub struct BoundedLoopExecutor;

#[async_trait]
impl StepExecutor for BoundedLoopExecutor {
    async fn execute(
        &self,
        engine: &Arc<StepEngine>,
        step: &StepDefinition,
        ctx: &mut RunContext,
        scope: &ExecutionScope,
    ) -> Result<StepOutcome> {
        let StepKind::BoundedLoop {
            steps,
            max_iterations,
            until,
            allow_failures,
        } = &step.kind
        else {
            return Err(EngineError::StepExecution {
                step: step.name.clone(),
                message: format!("loop executor dispatched a '{}' step", step.kind.name()),
            });
        };

        for iteration in 1..=*max_iterations {
            if scope.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            // Children can reference the counter as ${iteration}.
            ctx.set_variable("iteration", json!(iteration));
            debug!(step = %scope.path_prefix, iteration, "loop iteration starting");

            let iteration_scope = scope.descend(&format!("iteration-{iteration}"));
            match run_children(engine, steps, ctx, &iteration_scope).await? {
                ChildrenOutcome::AllCompleted { .. } => {}
                ChildrenOutcome::Stopped { path, error, .. } => {
                    if *allow_failures {
                        scope
                            .log
                            .warning(
                                Some(&scope.path_prefix),
                                format!("iteration {iteration} failed at '{path}', continuing: {error}"),
                            )
                            .await;
                    } else {
                        return Ok(StepOutcome::failed(StepOutput::failed(
                            format!("iteration {iteration} stopped at '{path}'"),
                            format!("step '{path}' failed: {error}"),
                        )));
                    }
                }
            }

            if let Some(until) = until {
                match engine
                    .conditions()
                    .evaluate(until, &ctx.to_template_context())
                {
                    Ok(true) => {
                        scope
                            .log
                            .information(
                                Some(&scope.path_prefix),
                                format!("exit condition met after {iteration} iteration(s)"),
                            )
                            .await;
                        return Ok(StepOutcome::completed(StepOutput::succeeded(
                            format!("exit condition met after {iteration} iteration(s)"),
                            "",
                        )));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        scope
                            .log
                            .error(
                                Some(&scope.path_prefix),
                                format!("exit condition error: {e}"),
                            )
                            .await;
                        return Ok(StepOutcome::failed(StepOutput::failed(
                            "exit condition evaluation failed",
                            e.to_string(),
                        )));
                    }
                }
            }
        }

        match until {
            // Cap reached with the exit condition still unmet.
            Some(_) => {
                let error =
                    format!("exit condition not met after {max_iterations} iteration(s)");
                scope
                    .log
                    .warning(Some(&scope.path_prefix), error.clone())
                    .await;
                Ok(StepOutcome::exhausted(StepOutput::failed(
                    "iteration cap reached",
                    error,
                )))
            }
            // A loop with no exit condition is a counted loop.
            None => Ok(StepOutcome::completed(StepOutput::succeeded(
                format!("{max_iterations} iteration(s) completed"),
                "",
            ))),
        }
    }
}
