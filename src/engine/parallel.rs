//! Executor for `parallel` steps.
//!
//! Every child runs on its own spawned task against a snapshot of the
//! context, inside its own git worktree. A join barrier waits for all
//! branches whatever their outcome, then merges contexts and records
//! results in definition order so the merged state is deterministic.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{ExecutionScope, RunContext, StepEngine, StepExecutor, StepOutcome};
use crate::error::{EngineError, Result};
use crate::progress::{StepOutput, StepStatus};
use crate::workflow::{StepDefinition, StepKind};
use crate::worktree::branch_name;

pub struct ParallelExecutor;

struct BranchResult {
    outcome: Result<StepOutcome>,
    ctx: RunContext,
}

#[async_trait]
impl StepExecutor for ParallelExecutor {
    async fn execute(
        &self,
        engine: &Arc<StepEngine>,
        step: &StepDefinition,
        ctx: &mut RunContext,
        scope: &ExecutionScope,
    ) -> Result<StepOutcome> {
        let StepKind::Parallel { steps } = &step.kind else {
            return Err(EngineError::StepExecution {
                step: step.name.clone(),
                message: format!("parallel executor dispatched a '{}' step", step.kind.name()),
            });
        };

        let mut handles = Vec::with_capacity(steps.len());
        for child in steps {
            let engine = Arc::clone(engine);
            let child = child.clone();
            let child_ctx = ctx.snapshot();
            let child_scope = scope.descend(&child.name);
            handles.push(tokio::spawn(run_branch(
                engine,
                child,
                child_ctx,
                child_scope,
            )));
        }

        // The barrier: every branch joins before anything merges.
        let joined = join_all(handles).await;

        let mut cancelled = false;
        let mut failures: Vec<(String, String)> = Vec::new();
        for (child, joined) in steps.iter().zip(joined) {
            let child_path = scope.child_path(&child.name);
            match joined {
                Ok(BranchResult {
                    outcome: Ok(outcome),
                    ctx: branch_ctx,
                }) => {
                    ctx.absorb(branch_ctx);
                    ctx.insert_output(&child.name, outcome.output.clone());
                    scope.progress.lock().await.record_child(
                        &child_path,
                        outcome.status,
                        &outcome.output.summary,
                    );
                    if !outcome.succeeded() {
                        failures.push((child_path, outcome.failure_reason()));
                    }
                }
                Ok(BranchResult {
                    outcome: Err(EngineError::Cancelled),
                    ctx: branch_ctx,
                }) => {
                    // Work the branch finished before the cancel still counts.
                    ctx.absorb(branch_ctx);
                    cancelled = true;
                }
                Ok(BranchResult {
                    outcome: Err(e),
                    ctx: branch_ctx,
                }) => {
                    ctx.absorb(branch_ctx);
                    let error = e.to_string();
                    let output = StepOutput::failed("branch failed", error.clone());
                    ctx.insert_output(&child.name, output.clone());
                    scope.progress.lock().await.record_child(
                        &child_path,
                        StepStatus::Failed,
                        &output.summary,
                    );
                    failures.push((child_path, error));
                }
                Err(join_error) => {
                    let error = format!("branch task panicked: {join_error}");
                    scope.log.error(Some(&child_path), error.clone()).await;
                    scope.progress.lock().await.record_child(
                        &child_path,
                        StepStatus::Failed,
                        "branch task panicked",
                    );
                    ctx.insert_output(
                        &child.name,
                        StepOutput::failed("branch task panicked", error.clone()),
                    );
                    failures.push((child_path, error));
                }
            }
        }

        if cancelled {
            return Err(EngineError::Cancelled);
        }
        if failures.is_empty() {
            return Ok(StepOutcome::completed(StepOutput::succeeded(
                format!("all {} branches completed", steps.len()),
                "",
            )));
        }

        let (first_path, first_error) = &failures[0];
        let mut error = format!("branch '{first_path}' failed: {first_error}");
        if failures.len() > 1 {
            error.push_str(&format!(" ({} branches failed)", failures.len()));
        }
        Ok(StepOutcome::failed(StepOutput::failed(
            format!("{} of {} branches failed", failures.len(), steps.len()),
            error,
        )))
    }
}

/// One branch: acquire a worktree, run the child inside it, release the
/// worktree no matter how the child ended.
async fn run_branch(
    engine: Arc<StepEngine>,
    child: StepDefinition,
    mut ctx: RunContext,
    scope: ExecutionScope,
) -> BranchResult {
    let branch = branch_name(&scope.run_id, &scope.path_prefix);
    let worktree = match engine
        .isolation()
        .create(&branch, scope.base_branch.as_deref())
        .await
    {
        Ok(worktree) => worktree,
        // An isolation failure stops this branch only.
        Err(e) => {
            scope
                .log
                .error(
                    Some(&scope.path_prefix),
                    format!("worktree setup failed: {e}"),
                )
                .await;
            return BranchResult {
                outcome: Ok(StepOutcome::failed(StepOutput::failed(
                    "worktree setup failed",
                    e.to_string(),
                ))),
                ctx,
            };
        }
    };
    debug!(
        branch = %worktree.branch,
        path = %worktree.path.display(),
        "branch worktree ready"
    );

    let branch_scope = scope.with_working_dir(worktree.path.clone());
    let outcome = engine.execute_step(&child, &mut ctx, &branch_scope).await;

    if let Err(e) = engine.isolation().remove(&worktree).await {
        warn!("Failed to remove worktree {}: {e}", worktree.path.display());
        scope
            .log
            .warning(
                Some(&scope.path_prefix),
                format!("failed to remove worktree: {e}"),
            )
            .await;
    }

    BranchResult { outcome, ctx }
}
