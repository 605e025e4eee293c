use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::retry::RetryPolicy;
use crate::error::DefinitionError;

/// A validated workflow: declared variables, run-wide settings, and the
/// top-level step list. Trees are data; the engine interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub variables: Vec<VariableSpec>,

    #[serde(default)]
    pub settings: RunSettings,

    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// The closed set of step kinds. Unknown tags fail deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepKind {
    LeafPrompt {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
    },
    LeafCommand {
        command: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
    },
    Serial {
        steps: Vec<StepDefinition>,
    },
    Parallel {
        steps: Vec<StepDefinition>,
    },
    Conditional {
        condition: String,
        then: Vec<StepDefinition>,
        #[serde(
            default,
            rename = "else",
            skip_serializing_if = "Option::is_none"
        )]
        otherwise: Option<Vec<StepDefinition>>,
    },
    BoundedLoop {
        steps: Vec<StepDefinition>,
        max_iterations: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<String>,
        #[serde(default)]
        allow_failures: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(default)]
    pub var_type: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    #[default]
    String,
    Number,
    Boolean,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunSettings {
    pub working_dir: Option<PathBuf>,

    /// Hard cap on a single leaf invocation.
    #[serde(with = "humantime_serde")]
    pub step_timeout: Option<Duration>,

    /// Workflow-wide retry defaults; per-step `retry:` blocks win.
    pub retry: Option<RetryPolicy>,

    pub git: GitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GitSettings {
    /// Commit-ish parallel branches fork from. Defaults to HEAD.
    pub base_branch: Option<String>,
    pub worktree_dir: Option<PathBuf>,
}

impl WorkflowDefinition {
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut names = HashSet::new();
        for variable in &self.variables {
            if !names.insert(variable.name.as_str()) {
                return Err(DefinitionError::DuplicateVariable(variable.name.clone()));
            }
            variable.validate_default()?;
        }
        validate_siblings(&self.steps, &self.name)
    }

    /// Top-level step lookup by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn top_level_names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.name.clone()).collect()
    }
}

impl StepKind {
    /// The serialized `type:` tag for this kind.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::LeafPrompt { .. } => "leaf-prompt",
            StepKind::LeafCommand { .. } => "leaf-command",
            StepKind::Serial { .. } => "serial",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Conditional { .. } => "conditional",
            StepKind::BoundedLoop { .. } => "bounded-loop",
        }
    }
}

impl StepDefinition {
    fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.is_empty() || self.name.contains('/') || self.name.contains('\n') {
            return Err(DefinitionError::InvalidStepName(self.name.clone()));
        }
        match &self.kind {
            StepKind::LeafPrompt { .. } | StepKind::LeafCommand { .. } => Ok(()),
            StepKind::Serial { steps } | StepKind::Parallel { steps } => {
                if steps.is_empty() {
                    return Err(DefinitionError::EmptyComposite(self.name.clone()));
                }
                validate_siblings(steps, &self.name)
            }
            StepKind::Conditional {
                condition,
                then,
                otherwise,
            } => {
                if condition.trim().is_empty() {
                    return Err(DefinitionError::EmptyCondition(self.name.clone()));
                }
                if then.is_empty() {
                    return Err(DefinitionError::EmptyComposite(self.name.clone()));
                }
                validate_siblings(then, &self.name)?;
                if let Some(otherwise) = otherwise {
                    if otherwise.is_empty() {
                        return Err(DefinitionError::EmptyComposite(self.name.clone()));
                    }
                    validate_siblings(otherwise, &self.name)?;
                }
                Ok(())
            }
            StepKind::BoundedLoop {
                steps,
                max_iterations,
                ..
            } => {
                if *max_iterations < 1 {
                    return Err(DefinitionError::InvalidLoopCap {
                        step: self.name.clone(),
                        value: *max_iterations,
                    });
                }
                if steps.is_empty() {
                    return Err(DefinitionError::EmptyComposite(self.name.clone()));
                }
                validate_siblings(steps, &self.name)
            }
        }
    }

    /// Child lists of this step. Leaves have none; conditionals expose both
    /// branches.
    pub fn children(&self) -> Vec<&[StepDefinition]> {
        match &self.kind {
            StepKind::LeafPrompt { .. } | StepKind::LeafCommand { .. } => Vec::new(),
            StepKind::Serial { steps }
            | StepKind::Parallel { steps }
            | StepKind::BoundedLoop { steps, .. } => vec![steps.as_slice()],
            StepKind::Conditional {
                then, otherwise, ..
            } => {
                let mut lists = vec![then.as_slice()];
                if let Some(otherwise) = otherwise {
                    lists.push(otherwise.as_slice());
                }
                lists
            }
        }
    }
}

impl VariableSpec {
    fn validate_default(&self) -> Result<(), DefinitionError> {
        let Some(default) = &self.default else {
            return Ok(());
        };
        let ok = match self.var_type {
            VariableType::String => true,
            VariableType::Number => default.parse::<f64>().is_ok(),
            VariableType::Boolean => default.parse::<bool>().is_ok(),
        };
        if ok {
            Ok(())
        } else {
            Err(DefinitionError::InvalidVariableDefault {
                name: self.name.clone(),
                value: default.clone(),
                expected: match self.var_type {
                    VariableType::String => "string",
                    VariableType::Number => "number",
                    VariableType::Boolean => "boolean",
                }
                .to_string(),
            })
        }
    }
}

fn validate_siblings(steps: &[StepDefinition], parent: &str) -> Result<(), DefinitionError> {
    let mut seen = HashSet::new();
    for step in steps {
        step.validate()?;
        if !seen.insert(step.name.as_str()) {
            return Err(DefinitionError::DuplicateStepName {
                name: step.name.clone(),
                parent: parent.to_string(),
            });
        }
    }
    Ok(())
}
