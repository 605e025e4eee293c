use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::WorkflowProgress;
use crate::error::{EngineError, Result};

/// One JSON file per run under the state directory. Writes go through a
/// temp file and a rename, so a crash mid-write never corrupts the record
/// on disk.
pub struct ProgressStore {
    base_dir: PathBuf,
}

impl ProgressStore {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.base_dir.join(format!("{workflow_id}.json"))
    }

    pub async fn save(&self, progress: &WorkflowProgress) -> Result<()> {
        let path = self.path_for(&progress.workflow_id);
        let temp_path = path.with_extension("json.tmp");

        fs::create_dir_all(&self.base_dir).await?;
        let json = serde_json::to_string_pretty(progress)?;
        fs::write(&temp_path, json).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(
            "persisted progress for {} ({})",
            progress.workflow_id, progress.status
        );
        Ok(())
    }

    pub async fn load(&self, workflow_id: &str) -> Result<WorkflowProgress> {
        let path = self.path_for(workflow_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::Progress(format!(
                    "no saved run '{workflow_id}'"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    /// All saved runs, newest first. Unreadable entries are skipped with a
    /// warning rather than failing the whole listing.
    pub async fn list(&self) -> Result<Vec<WorkflowProgress>> {
        let mut runs = Vec::new();
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(contents) => match serde_json::from_str::<WorkflowProgress>(&contents) {
                    Ok(progress) => runs.push(progress),
                    Err(e) => warn!("skipping unreadable run record {}: {}", path.display(), e),
                },
                Err(e) => warn!("skipping unreadable run record {}: {}", path.display(), e),
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    pub async fn delete(&self, workflow_id: &str) -> Result<()> {
        let path = self.path_for(workflow_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::Progress(
                format!("no saved run '{workflow_id}'"),
            )),
            Err(e) => Err(e.into()),
        }
    }
}
