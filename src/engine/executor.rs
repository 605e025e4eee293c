//! Top-level run driver.
//!
//! `WorkflowExecutor` owns the drain loop: pop the next top-level step,
//! dispatch it through the engine, classify the outcome, persist progress.
//! Progress is saved after every top-level step, so a crash at any point
//! loses at most the step that was in flight.
//!
//! Return contract: `Ok` for runs that end `Completed` or `Cancelled`
//! (cancellation is cooperative, not a fault); `Err` for runs that end
//! `Failed`, classified as retry exhaustion, loop exhaustion, or a plain
//! step failure. The failed progress record is persisted before the error
//! is returned.

use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ExecutionScope, RunContext, SharedProgress, StepEngine, StepOutcome};
use crate::error::{DefinitionError, EngineError, Result};
use crate::events::{ExecutionLog, LogLevel};
use crate::progress::{ProgressStore, StepOutput, StepStatus, WorkflowProgress};
use crate::workflow::{StepKind, VariableSpec, VariableType, WorkflowDefinition};

pub struct WorkflowExecutor {
    engine: Arc<StepEngine>,
    store: ProgressStore,
    log_dir: Option<PathBuf>,
}

impl WorkflowExecutor {
    pub fn new(engine: Arc<StepEngine>, store: ProgressStore) -> Self {
        Self {
            engine,
            store,
            log_dir: None,
        }
    }

    /// Enable the per-run execution log under `dir`.
    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    /// Execute a workflow from the top.
    pub async fn run(
        &self,
        workflow: &WorkflowDefinition,
        definition_path: Option<PathBuf>,
        overrides: &HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<WorkflowProgress> {
        workflow.validate()?;
        let variables = seed_variables(workflow, overrides)?;
        let progress =
            WorkflowProgress::new(&workflow.name, definition_path, workflow.top_level_names());
        let mut ctx = RunContext::new();
        ctx.variables = variables;
        self.drive(workflow, progress, ctx, cancel).await
    }

    /// Execute a workflow starting at `from_step`; everything before it is
    /// seeded as already completed.
    pub async fn run_from(
        &self,
        workflow: &WorkflowDefinition,
        definition_path: Option<PathBuf>,
        overrides: &HashMap<String, String>,
        from_step: &str,
        cancel: CancellationToken,
    ) -> Result<WorkflowProgress> {
        workflow.validate()?;
        let variables = seed_variables(workflow, overrides)?;
        let progress = WorkflowProgress::seeded(
            &workflow.name,
            definition_path,
            workflow.top_level_names(),
            from_step,
        )?;
        let ctx = rehydrate(&progress, variables);
        self.drive(workflow, progress, ctx, cancel).await
    }

    /// Pick a stopped run back up. Completed steps are skipped; the step
    /// that was in flight, or that failed, is re-executed in full.
    pub async fn resume(
        &self,
        workflow: &WorkflowDefinition,
        workflow_id: &str,
        cancel: CancellationToken,
    ) -> Result<WorkflowProgress> {
        workflow.validate()?;
        let mut progress = self.store.load(workflow_id).await?;
        progress.resume()?;
        info!(
            workflow_id,
            completed = progress.completed_steps.len(),
            pending = progress.pending_steps.len(),
            "resuming run"
        );
        // Variable overrides are not persisted; declared defaults reapply.
        let variables = seed_variables(workflow, &HashMap::new())?;
        let ctx = rehydrate(&progress, variables);
        self.drive(workflow, progress, ctx, cancel).await
    }

    async fn drive(
        &self,
        workflow: &WorkflowDefinition,
        progress: WorkflowProgress,
        mut ctx: RunContext,
        cancel: CancellationToken,
    ) -> Result<WorkflowProgress> {
        let run_id = progress.workflow_id.clone();
        let log = match &self.log_dir {
            Some(dir) => ExecutionLog::create(dir, &run_id).await?,
            None => ExecutionLog::disabled(),
        };
        let working_dir = match &workflow.settings.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let base_branch = workflow.settings.git.base_branch.clone();
        let shared: SharedProgress = Arc::new(Mutex::new(progress));

        log.information(None, format!("run {run_id} started for workflow '{}'", workflow.name))
            .await;
        self.persist(&shared).await?;

        loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(&shared, &log).await;
            }

            let Some(step_name) = shared.lock().await.begin_step() else {
                break;
            };
            let Some(step) = workflow.step(&step_name) else {
                // The saved queue references a step the definition no longer
                // has; the file changed since the run started.
                let message =
                    format!("step '{step_name}' is not in workflow '{}'", workflow.name);
                log.critical(Some(&step_name), &message).await;
                let mut guard = shared.lock().await;
                guard.complete_current(StepStatus::Failed, "missing from definition")?;
                guard.push_error(&step_name, &message);
                guard.fail()?;
                drop(guard);
                self.persist(&shared).await?;
                return Err(EngineError::Definition(DefinitionError::UnknownStep(
                    step_name,
                )));
            };

            debug!(step = %step_name, "top-level step starting");
            log.information(Some(&step_name), "step started").await;
            let scope = ExecutionScope {
                run_id: run_id.clone(),
                working_dir: working_dir.clone(),
                base_branch: base_branch.clone(),
                path_prefix: step_name.clone(),
                cancel: cancel.clone(),
                progress: Arc::clone(&shared),
                log: log.clone(),
            };

            match self.engine.execute_step(step, &mut ctx, &scope).await {
                Ok(outcome) => {
                    ctx.insert_output(&step_name, outcome.output.clone());
                    if outcome.succeeded() {
                        let mut guard = shared.lock().await;
                        guard.complete_current(StepStatus::Completed, &outcome.output.summary)?;
                        drop(guard);
                        log.information(
                            Some(&step_name),
                            format!("step completed: {}", outcome.output.summary),
                        )
                        .await;
                        self.persist(&shared).await?;
                    } else {
                        return self
                            .finish_failed(&shared, &log, workflow, &step_name, outcome)
                            .await;
                    }
                }
                Err(EngineError::Cancelled) => {
                    return self.finish_cancelled(&shared, &log).await;
                }
                Err(e) => {
                    log.critical(Some(&step_name), e.to_string()).await;
                    let mut guard = shared.lock().await;
                    guard.complete_current(StepStatus::Failed, "internal error")?;
                    guard.push_error(&step_name, e.to_string());
                    guard.fail()?;
                    drop(guard);
                    self.persist(&shared).await?;
                    return Err(e);
                }
            }
        }

        shared.lock().await.complete_run()?;
        log.information(None, "run completed").await;
        self.persist(&shared).await?;
        info!(run_id, "workflow run completed");
        Ok(self.snapshot(&shared).await)
    }

    /// A failed or exhausted top-level step ends the run. The progress
    /// record is persisted before the classified error is returned.
    async fn finish_failed(
        &self,
        shared: &SharedProgress,
        log: &ExecutionLog,
        workflow: &WorkflowDefinition,
        step_name: &str,
        outcome: StepOutcome,
    ) -> Result<WorkflowProgress> {
        let reason = outcome.failure_reason();
        let level = match outcome.status {
            StepStatus::Exhausted => LogLevel::Warning,
            _ => LogLevel::Error,
        };
        log.record(level, Some(step_name), reason.clone(), None).await;
        log.error(None, format!("run failed at step '{step_name}'"))
            .await;

        let mut guard = shared.lock().await;
        guard.complete_current(outcome.status, &outcome.output.summary)?;
        guard.push_error(step_name, &reason);
        guard.fail()?;
        drop(guard);
        self.persist(shared).await?;

        Err(classify_failure(workflow, step_name, &outcome, reason))
    }

    async fn finish_cancelled(
        &self,
        shared: &SharedProgress,
        log: &ExecutionLog,
    ) -> Result<WorkflowProgress> {
        let mut guard = shared.lock().await;
        // The interrupted step stays recorded as current; resume requeues it.
        guard.cancel()?;
        drop(guard);
        log.warning(None, "run cancelled").await;
        self.persist(shared).await?;
        info!("workflow run cancelled");
        Ok(self.snapshot(shared).await)
    }

    async fn persist(&self, shared: &SharedProgress) -> Result<()> {
        let guard = shared.lock().await;
        self.store.save(&guard).await
    }

    async fn snapshot(&self, shared: &SharedProgress) -> WorkflowProgress {
        shared.lock().await.clone()
    }
}

/// Map a failed top-level outcome onto the error taxonomy.
fn classify_failure(
    workflow: &WorkflowDefinition,
    step_name: &str,
    outcome: &StepOutcome,
    reason: String,
) -> EngineError {
    if outcome.status == StepStatus::Exhausted {
        if let Some(step) = workflow.step(step_name) {
            if let StepKind::BoundedLoop { max_iterations, .. } = &step.kind {
                return EngineError::LoopExhausted {
                    step: step_name.to_string(),
                    cap: *max_iterations,
                };
            }
        }
    }
    match outcome.attempts {
        Some(attempts) if attempts > 1 => EngineError::RetryExhausted {
            step: step_name.to_string(),
            attempts,
            last_error: reason,
        },
        _ => EngineError::StepExecution {
            step: step_name.to_string(),
            message: reason,
        },
    }
}

/// Resolve declared variables: defaults first, then overrides, both parsed
/// per the declared type. Overrides for undeclared names pass through as
/// strings.
fn seed_variables(
    workflow: &WorkflowDefinition,
    overrides: &HashMap<String, String>,
) -> Result<HashMap<String, Value>> {
    let mut variables = HashMap::new();
    for spec in &workflow.variables {
        let raw = overrides.get(&spec.name).or(spec.default.as_ref());
        if let Some(raw) = raw {
            variables.insert(spec.name.clone(), parse_variable(spec, raw)?);
        }
    }
    for (name, raw) in overrides {
        variables
            .entry(name.clone())
            .or_insert_with(|| Value::String(raw.clone()));
    }
    Ok(variables)
}

fn parse_variable(spec: &VariableSpec, raw: &str) -> Result<Value> {
    let invalid = |expected: &str| {
        EngineError::Definition(DefinitionError::InvalidVariableValue {
            name: spec.name.clone(),
            value: raw.to_string(),
            expected: expected.to_string(),
        })
    };
    match spec.var_type {
        VariableType::String => Ok(Value::String(raw.to_string())),
        VariableType::Number => {
            let number: f64 = raw.parse().map_err(|_| invalid("number"))?;
            serde_json::Number::from_f64(number)
                .map(Value::Number)
                .ok_or_else(|| invalid("number"))
        }
        VariableType::Boolean => {
            let flag: bool = raw.parse().map_err(|_| invalid("boolean"))?;
            Ok(Value::Bool(flag))
        }
    }
}

/// Rebuild the variable context for a resumed run from the persisted step
/// records. Only the summary survives persistence, so `${step.output}` is
/// empty for steps completed in an earlier session.
fn rehydrate(progress: &WorkflowProgress, variables: HashMap<String, Value>) -> RunContext {
    let mut ctx = RunContext::new();
    ctx.variables = variables;
    for record in &progress.completed_steps {
        if record.name.contains('/') {
            continue;
        }
        let success = record.status == StepStatus::Completed;
        ctx.insert_output(
            &record.name,
            StepOutput {
                success,
                summary: record.output_summary.clone(),
                output: String::new(),
                error: if success {
                    None
                } else {
                    Some(record.output_summary.clone())
                },
            },
        );
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::CompletedStep;
    use crate::workflow::{RunSettings, StepDefinition};

    fn workflow_with_vars(variables: Vec<VariableSpec>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "vars".to_string(),
            description: None,
            variables,
            settings: RunSettings::default(),
            steps: vec![StepDefinition {
                name: "noop".to_string(),
                kind: StepKind::LeafCommand {
                    command: "true".to_string(),
                    env: HashMap::new(),
                    retry: None,
                },
            }],
        }
    }

    #[test]
    fn seeds_defaults_and_typed_overrides() {
        let workflow = workflow_with_vars(vec![
            VariableSpec {
                name: "target".to_string(),
                var_type: VariableType::String,
                default: Some("staging".to_string()),
            },
            VariableSpec {
                name: "retries".to_string(),
                var_type: VariableType::Number,
                default: Some("2".to_string()),
            },
        ]);
        let mut overrides = HashMap::new();
        overrides.insert("retries".to_string(), "5".to_string());
        overrides.insert("extra".to_string(), "hello".to_string());

        let vars = seed_variables(&workflow, &overrides).unwrap();
        assert_eq!(vars["target"], Value::String("staging".to_string()));
        assert_eq!(vars["retries"], serde_json::json!(5.0));
        assert_eq!(vars["extra"], Value::String("hello".to_string()));
    }

    #[test]
    fn rejects_badly_typed_overrides() {
        let workflow = workflow_with_vars(vec![VariableSpec {
            name: "count".to_string(),
            var_type: VariableType::Number,
            default: None,
        }]);
        let mut overrides = HashMap::new();
        overrides.insert("count".to_string(), "lots".to_string());

        let result = seed_variables(&workflow, &overrides);
        assert!(matches!(
            result,
            Err(EngineError::Definition(
                DefinitionError::InvalidVariableValue { .. }
            ))
        ));
    }

    #[test]
    fn rehydration_restores_top_level_outputs_only() {
        let mut progress = WorkflowProgress::new("wf", None, vec!["c".to_string()]);
        progress.completed_steps = vec![
            CompletedStep {
                name: "a".to_string(),
                status: StepStatus::Completed,
                output_summary: "built".to_string(),
            },
            CompletedStep {
                name: "b".to_string(),
                status: StepStatus::Failed,
                output_summary: "broke".to_string(),
            },
            CompletedStep {
                name: "a/nested".to_string(),
                status: StepStatus::Completed,
                output_summary: "inner".to_string(),
            },
        ];

        let ctx = rehydrate(&progress, HashMap::new());
        assert!(ctx.output("a").unwrap().success);
        assert_eq!(ctx.output("a").unwrap().summary, "built");
        assert!(!ctx.output("b").unwrap().success);
        assert_eq!(ctx.output("b").unwrap().error.as_deref(), Some("broke"));
        assert!(ctx.output("a/nested").is_none());
    }

    #[test]
    fn loop_exhaustion_classifies_distinctly() {
        let workflow = WorkflowDefinition {
            name: "wf".to_string(),
            description: None,
            variables: Vec::new(),
            settings: RunSettings::default(),
            steps: vec![StepDefinition {
                name: "poll".to_string(),
                kind: StepKind::BoundedLoop {
                    steps: vec![StepDefinition {
                        name: "check".to_string(),
                        kind: StepKind::LeafCommand {
                            command: "true".to_string(),
                            env: HashMap::new(),
                            retry: None,
                        },
                    }],
                    max_iterations: 3,
                    until: Some("${check.success}".to_string()),
                    allow_failures: false,
                },
            }],
        };
        let outcome = StepOutcome::exhausted(StepOutput::failed("cap reached", "no luck"));
        let error = classify_failure(&workflow, "poll", &outcome, "no luck".to_string());
        assert!(matches!(
            error,
            EngineError::LoopExhausted { cap: 3, .. }
        ));

        let retry_outcome = StepOutcome::failed_after(
            StepOutput::failed("failed after 3 attempt(s)", "boom"),
            3,
        );
        let error = classify_failure(&workflow, "poll", &retry_outcome, "boom".to_string());
        assert!(matches!(
            error,
            EngineError::RetryExhausted { attempts: 3, .. }
        ));

        let plain = StepOutcome::failed(StepOutput::failed("nope", "bad input"));
        let error = classify_failure(&workflow, "poll", &plain, "bad input".to_string());
        assert!(matches!(error, EngineError::StepExecution { .. }));
    }
}
