//! Workflow definitions: the data model the engine interprets.

pub mod definition;
pub mod loader;

pub use definition::{
    GitSettings, RunSettings, StepDefinition, StepKind, VariableSpec, VariableType,
    WorkflowDefinition,
};
pub use loader::load_workflow;
