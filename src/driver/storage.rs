use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{LabError, Result};

use super::StorageProvisioner;

/// Local-filesystem storage: one directory per (student, course) pair under
/// a fixed root, bind-mounted into the lab container as its home.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, student_id: &str, course_id: &str) -> PathBuf {
        self.root.join(student_id).join(course_id)
    }
}

#[async_trait]
impl StorageProvisioner for LocalStorage {
    async fn ensure_directory(&self, student_id: &str, course_id: &str) -> Result<PathBuf> {
        let path = self.path_for(student_id, course_id);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| LabError::Driver(format!("storage create failed at {:?}: {}", path, e)))?;
        Ok(path)
    }

    async fn remove_directory(&self, path: &Path) -> Result<()> {
        // Only paths under our root are ours to delete
        if !path.starts_with(&self.root) {
            return Err(LabError::Validation(format!(
                "{:?} is outside the storage root {:?}",
                path, self.root
            )));
        }

        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!("removed lab storage at {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("lab storage already gone at {:?}", path);
                Ok(())
            }
            Err(e) => Err(LabError::Driver(format!(
                "storage removal failed at {:?}: {}",
                path, e
            ))),
        }
    }
}
