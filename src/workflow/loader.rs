use std::path::Path;
use tracing::debug;

use super::definition::WorkflowDefinition;
use crate::error::DefinitionError;

/// Read, parse, and validate a workflow file. Nothing that fails here ever
/// reaches the executor.
pub async fn load_workflow(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let display_path = path.display().to_string();
    let contents =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DefinitionError::Read {
                path: display_path.clone(),
                source,
            })?;

    let workflow: WorkflowDefinition =
        serde_yaml::from_str(&contents).map_err(|source| DefinitionError::Parse {
            path: display_path.clone(),
            source,
        })?;

    workflow.validate()?;
    debug!(
        "loaded workflow '{}' with {} top-level steps from {}",
        workflow.name,
        workflow.steps.len(),
        display_path
    );
    Ok(workflow)
}
