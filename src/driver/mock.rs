//! In-memory engine doubles for exercising the lifecycle layer without a
//! container engine.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{LabError, Result};

use super::{ContainerDriver, ContainerSpec, ManagedContainer, StorageProvisioner};

/// Scriptable engine double. Tracks every call, hands out distinct ports,
/// and can be told to fail or stall individual engine calls.
pub struct MockDriver {
    pub created: Mutex<Vec<ContainerSpec>>,
    /// name -> engine status string
    pub statuses: Mutex<HashMap<String, String>>,
    pub used_ports: Mutex<HashSet<u16>>,
    pub stopped: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub managed: Mutex<Vec<ManagedContainer>>,
    pub create_calls: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_stop: AtomicBool,
    pub stall_probe: AtomicBool,
    create_delay: Mutex<Duration>,
    probe_limit: u16,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            used_ports: Mutex::new(HashSet::new()),
            stopped: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            managed: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            stall_probe: AtomicBool::new(false),
            create_delay: Mutex::new(Duration::ZERO),
            probe_limit: 100,
        }
    }

    pub fn create_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn set_status(&self, name: &str, status: &str) {
        self.statuses
            .lock()
            .unwrap()
            .insert(name.to_string(), status.to_string());
    }

    pub fn forget_container(&self, name: &str) {
        self.statuses.lock().unwrap().remove(name);
    }

    pub fn occupy_ports(&self, range: std::ops::Range<u16>) {
        let mut used = self.used_ports.lock().unwrap();
        for port in range {
            used.insert(port);
        }
    }

    pub fn add_managed(&self, container: ManagedContainer) {
        self.managed.lock().unwrap().push(container);
    }
}

#[async_trait]
impl ContainerDriver for MockDriver {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(LabError::Driver("engine refused create".to_string()));
        }
        self.created.lock().unwrap().push(spec.clone());
        self.set_status(&spec.name, "running");
        Ok(format!("mock-{}", spec.name))
    }

    async fn stop_container(&self, name: &str) -> Result<bool> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(LabError::Driver("engine refused stop".to_string()));
        }
        self.stopped.lock().unwrap().push(name.to_string());
        let mut statuses = self.statuses.lock().unwrap();
        match statuses.get_mut(name) {
            Some(status) => {
                *status = "exited".to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_container(&self, name: &str, _force: bool) -> Result<bool> {
        self.removed.lock().unwrap().push(name.to_string());
        Ok(self.statuses.lock().unwrap().remove(name).is_some())
    }

    async fn get_container_status(&self, name: &str) -> Result<String> {
        self.statuses
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| LabError::Driver(format!("no such container: {}", name)))
    }

    async fn find_available_port(&self, start_port: u16) -> Result<u16> {
        // Yield first so single-threaded tests interleave like real probes
        tokio::task::yield_now().await;
        if self.stall_probe.load(Ordering::SeqCst) {
            // A wedged engine never answers; only the caller's timeout
            // gets the lab request unstuck
            std::future::pending::<()>().await;
        }
        let mut used = self.used_ports.lock().unwrap();
        for port in start_port..start_port.saturating_add(self.probe_limit) {
            if used.insert(port) {
                return Ok(port);
            }
        }
        Err(LabError::ResourceExhausted(format!(
            "no free port in {}..{}",
            start_port,
            start_port.saturating_add(self.probe_limit)
        )))
    }

    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>> {
        Ok(self.managed.lock().unwrap().clone())
    }
}

/// Storage double that only records paths.
pub struct MockStorage {
    pub root: PathBuf,
    pub ensured: Mutex<Vec<(String, String)>>,
    pub removed: Mutex<Vec<PathBuf>>,
    pub fail_ensure: AtomicBool,
}

impl MockStorage {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/tmp/labdock-test"),
            ensured: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            fail_ensure: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl StorageProvisioner for MockStorage {
    async fn ensure_directory(&self, student_id: &str, course_id: &str) -> Result<PathBuf> {
        tokio::task::yield_now().await;
        if self.fail_ensure.load(Ordering::SeqCst) {
            return Err(LabError::Driver("storage unavailable".to_string()));
        }
        self.ensured
            .lock()
            .unwrap()
            .push((student_id.to_string(), course_id.to_string()));
        Ok(self.root.join(student_id).join(course_id))
    }

    async fn remove_directory(&self, path: &Path) -> Result<()> {
        self.removed.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}
