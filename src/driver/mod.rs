mod docker;
mod storage;

#[cfg(test)]
pub(crate) mod mock;

pub use docker::DockerDriver;
pub use storage::LocalStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Label keys stamped on every managed container so labs survive a restart
/// of this process.
pub mod labels {
    pub const MANAGED: &str = "labdock.managed";
    pub const LAB_ID: &str = "labdock.lab.id";
    pub const STUDENT_ID: &str = "labdock.student.id";
    pub const COURSE_ID: &str = "labdock.course.id";
    pub const IDE: &str = "labdock.ide";
    pub const LANGUAGE: &str = "labdock.language";
    pub const MULTI_IDE: &str = "labdock.multi";
}

/// Everything the engine needs to start one lab container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    /// Internal port spec -> external host port, e.g. `"8080/tcp" -> 31000`.
    pub ports: HashMap<String, u16>,
    /// Host path -> container path bind mounts.
    pub volumes: Vec<(PathBuf, String)>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub cpu_limit: f64,     // number of CPUs
    pub memory_limit: i64,  // bytes
}

/// Summary of an engine container carrying this crate's labels, used to
/// rebuild the registry after a restart.
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub state: String,
    pub labels: HashMap<String, String>,
    pub ports: HashMap<String, u16>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Container engine seam. Every call is slow, fallible I/O; the controller
/// wraps each one in a timeout and folds failures into Driver errors.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create and start a container. Returns the engine's container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Gracefully stop a container by name. `Ok(false)` means there was
    /// nothing left to stop.
    async fn stop_container(&self, name: &str) -> Result<bool>;

    /// Remove a container by name. `Ok(false)` means it was already gone.
    async fn remove_container(&self, name: &str, force: bool) -> Result<bool>;

    /// Engine-native status string for a container, e.g. "running".
    async fn get_container_status(&self, name: &str) -> Result<String>;

    /// First free host port at or above `start_port` within the driver's
    /// probe window. Two in-flight calls never hand out the same port.
    async fn find_available_port(&self, start_port: u16) -> Result<u16>;

    /// Containers carrying this crate's management labels.
    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>>;
}

/// Persistent per-student storage seam.
#[async_trait]
pub trait StorageProvisioner: Send + Sync {
    /// Ensure the home directory for a (student, course) pair exists and
    /// return its path. Idempotent.
    async fn ensure_directory(&self, student_id: &str, course_id: &str) -> Result<PathBuf>;

    /// Remove a lab's storage directory. A missing directory is a no-op.
    async fn remove_directory(&self, path: &Path) -> Result<()>;
}
