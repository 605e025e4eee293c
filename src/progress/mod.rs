//! Durable run state.
//!
//! `WorkflowProgress` is the single record of a run: what finished, what is
//! in flight, what is still queued. It is persisted after every top-level
//! step, so a crash at any point loses at most the in-flight step. Status
//! changes go through the transition methods here; nothing else mutates the
//! status field.

pub mod store;

pub use store::ProgressStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{DefinitionError, EngineError};

/// Version for on-disk progress format compatibility.
pub const PROGRESS_VERSION: u32 = 1;

/// Lifecycle of a run. Transitions: `Running` can move to any of the other
/// four; `Paused`, `Failed`, and `Cancelled` can move back to `Running` via
/// resume; `Completed` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Paused,
    Failed,
    Cancelled,
    Completed,
}

impl RunStatus {
    fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Running, Paused | Failed | Cancelled | Completed)
                | (Paused | Failed | Cancelled, Running)
        )
    }

    /// Whether a resume can pick this run back up.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            RunStatus::Paused | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::Completed => "COMPLETED",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// A bounded loop that hit its cap without meeting its exit condition.
    /// Not a generic failure; callers branch on this distinctly.
    Exhausted,
}

/// In-memory result of one step. The full `output` blob feeds later steps'
/// variable context; only the summary is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub success: bool,
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepOutput {
    pub fn succeeded(summary: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

/// The top-level step currently executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentStep {
    pub name: String,
    /// Retries consumed so far for the attempt in flight (0 on first try).
    pub retry_count: u32,
}

/// Persisted record of a finished step. Top-level steps use their bare
/// name; nested steps are recorded under slash paths (`deploy/build`,
/// `poll/iteration-2/check`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub name: String,
    pub status: StepStatus,
    pub output_summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub step: String,
    pub error: String,
}

/// The whole durable state of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowProgress {
    /// `run-{uuid}`, unique per execution.
    pub workflow_id: String,
    pub workflow_name: String,
    /// Workflow file the run was started from, kept so `resume` needs only
    /// the run id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_path: Option<PathBuf>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<CurrentStep>,
    pub completed_steps: Vec<CompletedStep>,
    /// Top-level step names not yet run, in definition order.
    pub pending_steps: VecDeque<String>,
    pub errors: Vec<StepError>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    PROGRESS_VERSION
}

impl WorkflowProgress {
    pub fn new(
        workflow_name: &str,
        definition_path: Option<PathBuf>,
        top_level_steps: Vec<String>,
    ) -> Self {
        Self {
            workflow_id: format!("run-{}", Uuid::new_v4()),
            workflow_name: workflow_name.to_string(),
            definition_path,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            current_step: None,
            completed_steps: Vec::new(),
            pending_steps: top_level_steps.into(),
            errors: Vec::new(),
            version: PROGRESS_VERSION,
        }
    }

    /// Fresh progress that starts at `from_step`: everything before it is
    /// seeded as already completed.
    pub fn seeded(
        workflow_name: &str,
        definition_path: Option<PathBuf>,
        top_level_steps: Vec<String>,
        from_step: &str,
    ) -> Result<Self, EngineError> {
        let split = top_level_steps
            .iter()
            .position(|name| name == from_step)
            .ok_or_else(|| {
                EngineError::Definition(DefinitionError::UnknownStep(from_step.to_string()))
            })?;

        let mut progress = Self::new(workflow_name, definition_path, top_level_steps);
        for _ in 0..split {
            let name = progress
                .pending_steps
                .pop_front()
                .ok_or_else(|| EngineError::Progress("seed underflow".to_string()))?;
            progress.completed_steps.push(CompletedStep {
                name,
                status: StepStatus::Completed,
                output_summary: "completed in a previous run".to_string(),
            });
        }
        Ok(progress)
    }

    /// Pop the next top-level step into `current_step`. Stale nested records
    /// from a crashed earlier attempt of that step are discarded so the
    /// re-run starts clean.
    pub fn begin_step(&mut self) -> Option<String> {
        let name = self.pending_steps.pop_front()?;
        self.discard_children_of(&name);
        self.current_step = Some(CurrentStep {
            name: name.clone(),
            retry_count: 0,
        });
        Some(name)
    }

    /// Record retries consumed by the current top-level step. Ignored when
    /// `step` is not the current one (nested leaves report through the
    /// execution log instead).
    pub fn note_retry(&mut self, step: &str, retry_count: u32) {
        if let Some(current) = &mut self.current_step {
            if current.name == step {
                current.retry_count = retry_count;
            }
        }
    }

    /// Move the current step into `completed_steps` with its outcome.
    pub fn complete_current(
        &mut self,
        status: StepStatus,
        output_summary: impl Into<String>,
    ) -> Result<(), EngineError> {
        let current = self
            .current_step
            .take()
            .ok_or_else(|| EngineError::Progress("no step in flight to complete".to_string()))?;
        self.completed_steps.push(CompletedStep {
            name: current.name,
            status,
            output_summary: output_summary.into(),
        });
        Ok(())
    }

    /// Append a nested completion under its slash path.
    pub fn record_child(
        &mut self,
        path: impl Into<String>,
        status: StepStatus,
        output_summary: impl Into<String>,
    ) {
        self.completed_steps.push(CompletedStep {
            name: path.into(),
            status,
            output_summary: output_summary.into(),
        });
    }

    /// Drop nested records belonging to `top_level_name`'s subtree.
    pub fn discard_children_of(&mut self, top_level_name: &str) {
        let prefix = format!("{top_level_name}/");
        self.completed_steps
            .retain(|step| !step.name.starts_with(&prefix));
    }

    pub fn push_error(&mut self, step: impl Into<String>, error: impl Into<String>) {
        self.errors.push(StepError {
            step: step.into(),
            error: error.into(),
        });
    }

    pub fn fail(&mut self) -> Result<(), EngineError> {
        self.transition(RunStatus::Failed)
    }

    pub fn cancel(&mut self) -> Result<(), EngineError> {
        self.transition(RunStatus::Cancelled)
    }

    pub fn pause(&mut self) -> Result<(), EngineError> {
        self.transition(RunStatus::Paused)
    }

    pub fn complete_run(&mut self) -> Result<(), EngineError> {
        self.transition(RunStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Bring a stopped run back to `Running`. Any step that was in flight
    /// when the run stopped goes back to the front of the queue and is
    /// re-executed in full. A failed run has its failed step recorded as
    /// finished instead of in flight; that step re-enters the queue too.
    pub fn resume(&mut self) -> Result<(), EngineError> {
        self.transition(RunStatus::Running)?;
        if let Some(current) = self.current_step.take() {
            self.pending_steps.push_front(current.name);
        } else if self
            .completed_steps
            .last()
            .is_some_and(|last| !last.name.contains('/') && last.status != StepStatus::Completed)
        {
            let name = self.completed_steps.pop().map(|step| step.name);
            if let Some(name) = name {
                self.discard_children_of(&name);
                self.pending_steps.push_front(name);
            }
        }
        Ok(())
    }

    fn transition(&mut self, next: RunStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Progress(format!(
                "invalid status transition {} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn is_step_completed(&self, name: &str) -> bool {
        self.completed_steps.iter().any(|step| step.name == name)
    }

    pub fn completed_names(&self) -> Vec<&str> {
        self.completed_steps
            .iter()
            .map(|step| step.name.as_str())
            .collect()
    }
}
