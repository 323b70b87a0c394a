use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::driver::{
    labels, ContainerDriver, ContainerSpec, ManagedContainer, StorageProvisioner,
};
use crate::error::{LabError, Result};
use crate::models::{
    derive_ide_urls, IdeType, LabConfig, LabEnvironment, LabOperationResult, LabStatus,
};
use crate::ports::PortAllocator;
use crate::registry::LabRegistry;

/// Home directory inside every lab container; the student's persistent
/// storage binds here.
const CONTAINER_HOME: &str = "/home/student";

/// Drives lab environments through their lifecycle. All engine traffic goes
/// through the ContainerDriver/StorageProvisioner seams, always outside the
/// registry lock and always under the configured timeout. Public operations
/// never return errors; failures are folded into the operation result and
/// logged with the lab id.
pub struct LifecycleController {
    registry: Arc<LabRegistry>,
    driver: Arc<dyn ContainerDriver>,
    storage: Arc<dyn StorageProvisioner>,
    allocator: PortAllocator,
    config: OrchestratorConfig,
}

impl LifecycleController {
    pub fn new(
        config: OrchestratorConfig,
        driver: Arc<dyn ContainerDriver>,
        storage: Arc<dyn StorageProvisioner>,
    ) -> Self {
        Self {
            registry: Arc::new(LabRegistry::new()),
            allocator: PortAllocator::new(config.port_range_start),
            driver,
            storage,
            config,
        }
    }

    pub fn registry(&self) -> &LabRegistry {
        &self.registry
    }

    /// Get-or-create a lab for a (student, course) pair. Concurrent and
    /// repeated calls converge on a single lab: the registry reservation is
    /// made visible before the engine is asked to do anything, so racing
    /// creators collapse onto whichever entry registered first.
    pub async fn create_student_lab(
        &self,
        student_id: &str,
        course_id: &str,
        config: LabConfig,
    ) -> LabOperationResult {
        if let Err(e) = Self::validate_identifier("student_id", student_id)
            .and_then(|_| Self::validate_identifier("course_id", course_id))
            .and_then(|_| Self::validate_config(&config))
        {
            return LabOperationResult::failure(e.to_string());
        }

        if let Some(existing) = self.registry.find_by_owner(student_id, course_id) {
            return Self::existing_lab_result(existing);
        }

        let id = Uuid::new_v4();
        let container_name = Self::container_name(student_id, course_id, id);

        // Storage is keyed by the owner pair and idempotent; a creator
        // that loses the registration race leaves nothing to clean up.
        let storage_path = match self
            .engine_call(
                "storage provisioning",
                self.storage.ensure_directory(student_id, course_id),
            )
            .await
        {
            Ok(path) => path,
            Err(e) => {
                error!(
                    "lab create for {}/{} failed during storage provisioning: {}",
                    student_id, course_id, e
                );
                return LabOperationResult::failure(format!("storage provisioning failed: {}", e));
            }
        };

        let ports = match self
            .engine_call(
                "port allocation",
                self.allocator.allocate(self.driver.as_ref(), &config),
            )
            .await
        {
            Ok(ports) => ports,
            Err(e) => {
                error!(
                    "lab create for {}/{} failed during port allocation: {}",
                    student_id, course_id, e
                );
                return LabOperationResult::failure(format!("port allocation failed: {}", e));
            }
        };

        let lab = LabEnvironment {
            id,
            student_id: student_id.to_string(),
            course_id: course_id.to_string(),
            container_name,
            container_id: None,
            status: LabStatus::Creating,
            ide_urls: derive_ide_urls(&ports, &self.config.external_host),
            config,
            ports,
            persistent_storage_path: storage_path,
            created_at: Utc::now(),
            last_accessed: None,
        };

        if let Err(e) = self.registry.register(lab.clone()) {
            // Lost the register race; the winner's entry is the lab now.
            warn!(
                "lab registration raced for {}/{}: {}",
                student_id, course_id, e
            );
            if let Some(existing) = self.registry.find_by_owner(student_id, course_id) {
                return Self::existing_lab_result(existing);
            }
            return LabOperationResult::failure(format!(
                "lab for {}/{} is being torn down, retry",
                student_id, course_id
            ));
        }

        info!(
            "creating lab {} for student {} course {}",
            id, student_id, course_id
        );
        self.start_lab_container(id).await
    }

    /// Stop a running lab's container, keeping ports, storage, and the
    /// registry entry for later resume.
    pub async fn pause_lab(&self, lab_id: Uuid) -> LabOperationResult {
        let lab = match self.require(lab_id) {
            Ok(lab) => lab,
            Err(e) => return LabOperationResult::failure(e.to_string()),
        };
        if !lab.status.can_transition_to(&LabStatus::Stopped) {
            return LabOperationResult::failure_for(
                format!("lab {} cannot pause from {:?}", lab_id, lab.status),
                lab_id,
                lab.status,
            );
        }

        match self
            .engine_call(
                "container stop",
                self.driver.stop_container(&lab.container_name),
            )
            .await
        {
            Ok(_) => match self.registry.update(lab_id, |lab| {
                lab.status = LabStatus::Stopped;
                lab.touch();
            }) {
                Some(lab) => {
                    info!("lab {} paused", lab_id);
                    LabOperationResult::ok("lab environment paused", &lab)
                }
                None => LabOperationResult::deleted("lab was deleted during pause", Some(lab_id)),
            },
            Err(e) => {
                // Engine state unknown; keep the cached status and let the
                // next status refresh settle it.
                error!("lab {} pause failed: {}", lab_id, e);
                LabOperationResult::failure_for(
                    format!("container stop failed: {}", e),
                    lab_id,
                    lab.status,
                )
            }
        }
    }

    /// Bring a STOPPED (or failed) lab back to RUNNING with its original
    /// ports, storage, and config.
    pub async fn resume_lab(&self, lab_id: Uuid) -> LabOperationResult {
        let lab = match self.require(lab_id) {
            Ok(lab) => lab,
            Err(e) => return LabOperationResult::failure(e.to_string()),
        };
        if !matches!(lab.status, LabStatus::Stopped | LabStatus::Error) {
            return LabOperationResult::failure_for(
                format!("lab {} cannot resume from {:?}", lab_id, lab.status),
                lab_id,
                lab.status,
            );
        }

        // The engine will not reuse a taken name, so clear the stale
        // container before re-running the creation sequence. The bind
        // mount keeps the student's files across the swap.
        if let Err(e) = self
            .engine_call(
                "container remove",
                self.driver.remove_container(&lab.container_name, true),
            )
            .await
        {
            warn!("lab {} stale container removal failed: {}", lab_id, e);
        }

        info!("resuming lab {} for student {}", lab_id, lab.student_id);
        self.start_lab_container(lab_id).await
    }

    /// Best-effort teardown: stop, force-remove, drop storage, deregister.
    /// Each sub-step failure is logged and skipped, and deleting an unknown
    /// id succeeds, so retries and the reaper are always safe.
    pub async fn delete_lab(&self, lab_id: Uuid) -> LabOperationResult {
        let Some(lab) = self.registry.get(lab_id) else {
            return LabOperationResult::deleted("lab already removed", Some(lab_id));
        };

        info!("deleting lab {} ({})", lab_id, lab.container_name);

        if let Err(e) = self
            .engine_call(
                "container stop",
                self.driver.stop_container(&lab.container_name),
            )
            .await
        {
            warn!("lab {} delete: stop failed: {}", lab_id, e);
        }
        if let Err(e) = self
            .engine_call(
                "container remove",
                self.driver.remove_container(&lab.container_name, true),
            )
            .await
        {
            warn!("lab {} delete: remove failed: {}", lab_id, e);
        }
        if let Err(e) = self
            .engine_call(
                "storage removal",
                self.storage.remove_directory(&lab.persistent_storage_path),
            )
            .await
        {
            warn!("lab {} delete: storage removal failed: {}", lab_id, e);
        }

        self.registry.remove(lab_id);
        LabOperationResult::deleted("lab environment deleted", Some(lab_id))
    }

    /// Refresh the cached status from the engine. Live engine state is
    /// authoritative, so the mapped status is written directly rather than
    /// through the transition table, and a successful poll counts as user
    /// activity.
    pub async fn get_lab_status(&self, lab_id: Uuid) -> LabOperationResult {
        let lab = match self.require(lab_id) {
            Ok(lab) => lab,
            Err(e) => return LabOperationResult::failure(e.to_string()),
        };

        match self
            .engine_call(
                "container inspect",
                self.driver.get_container_status(&lab.container_name),
            )
            .await
        {
            Ok(engine_status) => {
                let mapped = LabStatus::from_engine(&engine_status);
                match self.registry.update(lab_id, |lab| {
                    lab.status = mapped;
                    lab.touch();
                }) {
                    Some(lab) => {
                        LabOperationResult::ok(format!("engine reports {}", engine_status), &lab)
                    }
                    None => LabOperationResult::deleted("lab already removed", Some(lab_id)),
                }
            }
            Err(e) => {
                warn!("lab {} status refresh failed: {}", lab_id, e);
                LabOperationResult::failure_for(
                    format!("status refresh failed: {}", e),
                    lab_id,
                    lab.status,
                )
            }
        }
    }

    pub fn list_student_labs(&self, student_id: &str) -> Vec<LabEnvironment> {
        self.registry.find_by_student(student_id)
    }

    pub fn list_course_labs(&self, course_id: &str) -> Vec<LabEnvironment> {
        self.registry.find_by_course(course_id)
    }

    /// Delete labs idle past the threshold and return how many were
    /// reclaimed. Labs still provisioning are never candidates no matter
    /// how old their timestamps look.
    pub async fn cleanup_idle_labs(&self, max_idle_hours: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::hours(max_idle_hours);
        let candidates = self
            .registry
            .list_idle_before(cutoff, &[LabStatus::Creating, LabStatus::Starting]);

        if candidates.is_empty() {
            return 0;
        }
        info!(
            "idle cleanup: {} candidate(s) past {}h threshold",
            candidates.len(),
            max_idle_hours
        );

        let mut reclaimed = 0;
        for lab in candidates {
            let result = self.delete_lab(lab.id).await;
            if result.success {
                info!(
                    "idle cleanup reclaimed lab {} (student {}, course {})",
                    lab.id, lab.student_id, lab.course_id
                );
                reclaimed += 1;
            } else {
                warn!(
                    "idle cleanup could not delete lab {}: {}",
                    lab.id, result.message
                );
            }
        }
        reclaimed
    }

    /// Rebuild registry entries from engine containers carrying this
    /// crate's labels. The registry is in-memory, so this is what makes
    /// labs survive a restart of the orchestrator. Returns how many labs
    /// were adopted.
    pub async fn adopt_managed_containers(&self) -> usize {
        let containers = match self
            .engine_call("container list", self.driver.list_managed_containers())
            .await
        {
            Ok(containers) => containers,
            Err(e) => {
                error!("managed container listing failed: {}", e);
                return 0;
            }
        };

        let mut adopted = 0;
        for container in containers {
            let name = container.name.clone();
            match self.adopt_one(container).await {
                Ok(true) => adopted += 1,
                Ok(false) => {}
                Err(e) => warn!("skipping adoption of container {}: {}", name, e),
            }
        }
        if adopted > 0 {
            info!("adopted {} existing lab container(s)", adopted);
        }
        adopted
    }

    async fn adopt_one(&self, container: ManagedContainer) -> Result<bool> {
        let lab_id = container
            .labels
            .get(labels::LAB_ID)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| LabError::Validation("missing or unparseable lab id label".to_string()))?;
        let student_id = container
            .labels
            .get(labels::STUDENT_ID)
            .cloned()
            .ok_or_else(|| LabError::Validation("missing student label".to_string()))?;
        let course_id = container
            .labels
            .get(labels::COURSE_ID)
            .cloned()
            .ok_or_else(|| LabError::Validation("missing course label".to_string()))?;

        if self.registry.get(lab_id).is_some()
            || self.registry.find_by_owner(&student_id, &course_id).is_some()
        {
            return Ok(false);
        }

        let mut config = LabConfig::default();
        if let Some(ide) = container.labels.get(labels::IDE) {
            config.ide_type = IdeType::parse(ide).unwrap_or(IdeType::Vscode);
        }
        if let Some(language) = container.labels.get(labels::LANGUAGE) {
            config.language = language.clone();
        }
        config.enable_multi_ide = container
            .labels
            .get(labels::MULTI_IDE)
            .map(|v| v == "true")
            .unwrap_or(false);

        let storage_path = self
            .engine_call(
                "storage provisioning",
                self.storage.ensure_directory(&student_id, &course_id),
            )
            .await?;

        let lab = LabEnvironment {
            id: lab_id,
            student_id,
            course_id,
            container_name: container.name.clone(),
            container_id: Some(container.id.clone()),
            status: LabStatus::from_engine(&container.state),
            config,
            ide_urls: derive_ide_urls(&container.ports, &self.config.external_host),
            ports: container.ports,
            persistent_storage_path: storage_path,
            created_at: container.created_at.unwrap_or_else(Utc::now),
            last_accessed: None,
        };
        info!(
            "adopting lab {} from container {}",
            lab.id, lab.container_name
        );
        self.registry.register(lab)?;
        Ok(true)
    }

    /// Transition into STARTING, run the engine create, and record the
    /// outcome. Shared by create and resume; the caller has already put
    /// the lab in the registry.
    async fn start_lab_container(&self, id: Uuid) -> LabOperationResult {
        let snapshot = self.registry.update(id, |lab| {
            if lab.status.can_transition_to(&LabStatus::Starting) {
                lab.status = LabStatus::Starting;
            }
        });
        let Some(lab) = snapshot else {
            return LabOperationResult::failure(format!("lab {} disappeared before start", id));
        };
        if lab.status != LabStatus::Starting {
            return LabOperationResult::failure_for(
                format!("lab {} cannot start from {:?}", id, lab.status),
                id,
                lab.status,
            );
        }

        let spec = self.container_spec(&lab);
        match self
            .engine_call("container create", self.driver.create_container(&spec))
            .await
        {
            Ok(container_id) => {
                match self.registry.update(id, |lab| {
                    lab.container_id = Some(container_id.clone());
                    lab.status = LabStatus::Running;
                    lab.touch();
                }) {
                    Some(lab) => {
                        info!(
                            "lab {} running as {} ({})",
                            id, lab.container_name, container_id
                        );
                        LabOperationResult::ok("lab environment is running", &lab)
                    }
                    // Deleted mid-start; the labeled container will be
                    // found again by the next adoption or reap pass.
                    None => {
                        warn!("lab {} was deleted while its container started", id);
                        LabOperationResult::deleted("lab was deleted during startup", Some(id))
                    }
                }
            }
            Err(e) => {
                error!("lab {} container create failed: {}", id, e);
                let status = self
                    .registry
                    .update(id, |lab| {
                        lab.status = LabStatus::Error;
                    })
                    .map(|lab| lab.status)
                    .unwrap_or(LabStatus::Deleted);
                LabOperationResult::failure_for(
                    format!("container create failed: {}", e),
                    id,
                    status,
                )
            }
        }
    }

    fn container_spec(&self, lab: &LabEnvironment) -> ContainerSpec {
        let mut env = lab.config.environment_vars.clone();
        // Identity keys always win over request-supplied vars
        env.insert("LAB_ID".to_string(), lab.id.to_string());
        env.insert("STUDENT_ID".to_string(), lab.student_id.clone());
        env.insert("COURSE_ID".to_string(), lab.course_id.clone());

        let mut label_map = HashMap::new();
        label_map.insert(labels::MANAGED.to_string(), "true".to_string());
        label_map.insert(labels::LAB_ID.to_string(), lab.id.to_string());
        label_map.insert(labels::STUDENT_ID.to_string(), lab.student_id.clone());
        label_map.insert(labels::COURSE_ID.to_string(), lab.course_id.clone());
        label_map.insert(
            labels::IDE.to_string(),
            lab.config.ide_type.as_str().to_string(),
        );
        label_map.insert(labels::LANGUAGE.to_string(), lab.config.language.clone());
        label_map.insert(
            labels::MULTI_IDE.to_string(),
            lab.config.enable_multi_ide.to_string(),
        );

        ContainerSpec {
            image: lab
                .config
                .resolve_image(&self.config.image_prefix, &self.config.image_tag),
            name: lab.container_name.clone(),
            ports: lab.ports.clone(),
            volumes: vec![(
                lab.persistent_storage_path.clone(),
                CONTAINER_HOME.to_string(),
            )],
            env,
            labels: label_map,
            cpu_limit: lab.config.cpu_limit,
            memory_limit: lab.config.memory_limit,
        }
    }

    /// Typed lookup for operations that need an existing lab. Deletion does
    /// not go through here; a missing id is a success for that path.
    fn require(&self, lab_id: Uuid) -> Result<LabEnvironment> {
        self.registry
            .get(lab_id)
            .ok_or_else(|| LabError::NotFound(lab_id.to_string()))
    }

    fn existing_lab_result(lab: LabEnvironment) -> LabOperationResult {
        match lab.status {
            LabStatus::Error => LabOperationResult::failure_for(
                format!(
                    "existing lab {} is in ERROR; delete it before creating again",
                    lab.id
                ),
                lab.id,
                LabStatus::Error,
            ),
            LabStatus::Stopped => LabOperationResult::ok(
                format!("lab {} exists but is stopped; resume it", lab.id),
                &lab,
            ),
            _ => LabOperationResult::ok("lab environment already exists", &lab),
        }
    }

    /// Engine calls are slow, fallible I/O; every one runs under the
    /// configured timeout, and a timeout is just another driver failure.
    async fn engine_call<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.config.engine_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(LabError::Driver(format!(
                "{} timed out after {}s",
                op, self.config.engine_timeout_secs
            ))),
        }
    }

    fn validate_identifier(kind: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(LabError::Validation(format!("{} must not be empty", kind)));
        }
        if value.len() > 64 {
            return Err(LabError::Validation(format!(
                "{} exceeds 64 characters",
                kind
            )));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(LabError::Validation(format!(
                "{} may only contain alphanumerics, '.', '_' and '-'",
                kind
            )));
        }
        Ok(())
    }

    fn validate_config(config: &LabConfig) -> Result<()> {
        if config.cpu_limit <= 0.0 {
            return Err(LabError::Validation(
                "cpu_limit must be positive".to_string(),
            ));
        }
        if config.memory_limit <= 0 {
            return Err(LabError::Validation(
                "memory_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn sanitize(part: &str) -> String {
        part.to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    }

    fn container_name(student_id: &str, course_id: &str, id: Uuid) -> String {
        format!(
            "labdock-{}-{}-{}",
            Self::sanitize(student_id),
            Self::sanitize(course_id),
            &id.to_string()[..8]
        )
    }
}
