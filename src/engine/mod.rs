//! The step execution engine.
//!
//! One executor per step kind, dispatched through a registry table.
//! Composite executors call back into [`StepEngine::execute_step`] for their
//! children, so arbitrary nesting falls out of the recursion.
//!
//! Error discipline: executors return `Err` only to unwind cancellation (or
//! a broken internal invariant). Every ordinary failure is an `Ok` outcome
//! carrying a failed [`StepOutput`], which lets composites apply their own
//! failure semantics instead of losing the step's result to `?`.

pub mod conditional;
pub mod context;
pub mod executor;
pub mod leaf;
pub mod parallel;
pub mod ralph;
pub mod retry;
pub mod serial;

pub use context::{ExecutionScope, RunContext, SharedProgress};
pub use executor::WorkflowExecutor;
pub use retry::{BackoffStrategy, RetryPolicy};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::condition::ConditionEvaluator;
use crate::error::{EngineError, Result};
use crate::exec::AgentInvoker;
use crate::progress::{StepOutput, StepStatus};
use crate::template::TemplateEngine;
use crate::workflow::StepDefinition;
use crate::worktree::IsolationProvider;

/// Result of running one step to its local conclusion.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub output: StepOutput,
    /// Attempts a failed leaf consumed. More than one means retries ran out,
    /// which the driver reports as retry exhaustion.
    pub attempts: Option<u32>,
}

impl StepOutcome {
    pub fn completed(output: StepOutput) -> Self {
        Self {
            status: StepStatus::Completed,
            output,
            attempts: None,
        }
    }

    pub fn failed(output: StepOutput) -> Self {
        Self {
            status: StepStatus::Failed,
            output,
            attempts: None,
        }
    }

    pub fn failed_after(output: StepOutput, attempts: u32) -> Self {
        Self {
            status: StepStatus::Failed,
            output,
            attempts: Some(attempts),
        }
    }

    pub fn exhausted(output: StepOutput) -> Self {
        Self {
            status: StepStatus::Exhausted,
            output,
            attempts: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// The error text composites surface when this outcome stops them.
    pub fn failure_reason(&self) -> String {
        self.output
            .error
            .clone()
            .unwrap_or_else(|| self.output.summary.clone())
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        engine: &Arc<StepEngine>,
        step: &StepDefinition,
        ctx: &mut RunContext,
        scope: &ExecutionScope,
    ) -> Result<StepOutcome>;
}

/// Owns the executor registry and the collaborators executors share.
pub struct StepEngine {
    executors: HashMap<&'static str, Arc<dyn StepExecutor>>,
    invoker: Arc<dyn AgentInvoker>,
    isolation: Arc<dyn IsolationProvider>,
    templates: TemplateEngine,
    conditions: ConditionEvaluator,
    default_retry: RetryPolicy,
}

impl StepEngine {
    pub fn new(invoker: Arc<dyn AgentInvoker>, isolation: Arc<dyn IsolationProvider>) -> Self {
        let mut executors: HashMap<&'static str, Arc<dyn StepExecutor>> = HashMap::new();
        executors.insert("leaf-prompt", Arc::new(leaf::LeafExecutor));
        executors.insert("leaf-command", Arc::new(leaf::LeafExecutor));
        executors.insert("serial", Arc::new(serial::SerialExecutor));
        executors.insert("parallel", Arc::new(parallel::ParallelExecutor));
        executors.insert("conditional", Arc::new(conditional::ConditionalExecutor));
        executors.insert("bounded-loop", Arc::new(ralph::BoundedLoopExecutor));

        Self {
            executors,
            invoker,
            isolation,
            templates: TemplateEngine::default(),
            conditions: ConditionEvaluator::new(),
            default_retry: RetryPolicy::default(),
        }
    }

    /// Replace the workflow-wide retry defaults (per-step `retry:` still wins).
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Dispatch one step. Cancellation is polled here, which covers the gaps
    /// between top-level steps, serial siblings, and loop children uniformly.
    pub async fn execute_step(
        self: &Arc<Self>,
        step: &StepDefinition,
        ctx: &mut RunContext,
        scope: &ExecutionScope,
    ) -> Result<StepOutcome> {
        if scope.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let executor = self.executors.get(step.kind.name()).ok_or_else(|| {
            EngineError::StepExecution {
                step: step.name.clone(),
                message: format!("no executor registered for kind '{}'", step.kind.name()),
            }
        })?;
        let executor = Arc::clone(executor);
        executor.execute(self, step, ctx, scope).await
    }

    pub fn invoker(&self) -> &dyn AgentInvoker {
        self.invoker.as_ref()
    }

    pub fn isolation(&self) -> &dyn IsolationProvider {
        self.isolation.as_ref()
    }

    pub fn templates(&self) -> &TemplateEngine {
        &self.templates
    }

    pub fn conditions(&self) -> &ConditionEvaluator {
        &self.conditions
    }

    pub fn default_retry(&self) -> &RetryPolicy {
        &self.default_retry
    }
}
