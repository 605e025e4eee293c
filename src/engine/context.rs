//! State threaded through a run: the mutable variable/output map and the
//! per-subtree execution scope.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::events::ExecutionLog;
use crate::progress::{StepOutput, WorkflowProgress};
use crate::template::TemplateContext;

pub type SharedProgress = Arc<Mutex<WorkflowProgress>>;

/// Declared variables plus the outputs of every step that has run so far,
/// keyed by plain step name. Templates and conditions read from this.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub variables: HashMap<String, Value>,
    pub outputs: HashMap<String, StepOutput>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn insert_output(&mut self, step: &str, output: StepOutput) {
        self.outputs.insert(step.to_string(), output);
    }

    pub fn output(&self, step: &str) -> Option<&StepOutput> {
        self.outputs.get(step)
    }

    /// Lookup context for rendering and condition evaluation. Each output
    /// becomes an object, so `${build.success}` and `${build.output}` work.
    pub fn to_template_context(&self) -> TemplateContext {
        let mut ctx = TemplateContext::new();
        for (name, value) in &self.variables {
            ctx.set(name, value.clone());
        }
        for (name, output) in &self.outputs {
            ctx.set(
                name,
                json!({
                    "success": output.success,
                    "summary": output.summary,
                    "output": output.output,
                    "error": output.error,
                }),
            );
        }
        ctx
    }

    /// Copy handed to a parallel branch. Branches never see each other's
    /// writes until the barrier merges them back.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Merge a branch's context back in. Called once per branch in
    /// definition order, which keeps the merged result deterministic.
    pub fn absorb(&mut self, branch: RunContext) {
        self.variables.extend(branch.variables);
        self.outputs.extend(branch.outputs);
    }
}

/// Where a subtree runs and under whose supervision. `path_prefix` is the
/// slash path of the step currently executing; descending into a child
/// appends one segment. Cloning is cheap, and children never mutate the
/// parent's scope.
#[derive(Clone)]
pub struct ExecutionScope {
    pub run_id: String,
    /// Directory leaf invocations run in. Parallel branches point this at
    /// their worktree.
    pub working_dir: PathBuf,
    /// Commit-ish parallel branches fork from; `None` forks from HEAD.
    pub base_branch: Option<String>,
    pub path_prefix: String,
    pub cancel: CancellationToken,
    pub progress: SharedProgress,
    pub log: ExecutionLog,
}

impl ExecutionScope {
    pub fn child_path(&self, segment: &str) -> String {
        if self.path_prefix.is_empty() {
            segment.to_string()
        } else {
            format!("{}/{segment}", self.path_prefix)
        }
    }

    /// Scope for executing a child named (or grouped under) `segment`.
    pub fn descend(&self, segment: &str) -> Self {
        let mut scope = self.clone();
        scope.path_prefix = self.child_path(segment);
        scope
    }

    pub fn with_working_dir(&self, dir: PathBuf) -> Self {
        let mut scope = self.clone();
        scope.working_dir = dir;
        scope
    }
}
