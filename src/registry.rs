use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::{LabError, Result};
use crate::models::{LabEnvironment, LabStatus};

/// In-memory index of every lab this process knows about. Two maps stay
/// consistent under one lock: labs by id, and a (student, course) owner
/// index that enforces at most one registered lab per student per course.
///
/// Mutations serialize on the write lock; reads run concurrently and clone
/// snapshots out, so no guard is ever held across an `.await`.
pub struct LabRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    labs: HashMap<Uuid, LabEnvironment>,
    by_owner: HashMap<(String, String), Uuid>,
}

impl LabRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Insert a new lab. Fails with Conflict when the owner pair already
    /// has a registered lab, whatever its status.
    pub fn register(&self, lab: LabEnvironment) -> Result<()> {
        let mut inner = self.write();
        let owner = (lab.student_id.clone(), lab.course_id.clone());
        if let Some(existing) = inner.by_owner.get(&owner) {
            return Err(LabError::Conflict(format!(
                "student {} already has lab {} for course {}",
                lab.student_id, existing, lab.course_id
            )));
        }
        inner.by_owner.insert(owner, lab.id);
        inner.labs.insert(lab.id, lab);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<LabEnvironment> {
        self.read().labs.get(&id).cloned()
    }

    pub fn find_by_owner(&self, student_id: &str, course_id: &str) -> Option<LabEnvironment> {
        let inner = self.read();
        let id = inner
            .by_owner
            .get(&(student_id.to_string(), course_id.to_string()))?;
        inner.labs.get(id).cloned()
    }

    pub fn find_by_student(&self, student_id: &str) -> Vec<LabEnvironment> {
        let inner = self.read();
        let mut labs: Vec<LabEnvironment> = inner
            .labs
            .values()
            .filter(|lab| lab.student_id == student_id)
            .cloned()
            .collect();
        labs.sort_by_key(|lab| lab.created_at);
        labs
    }

    pub fn find_by_course(&self, course_id: &str) -> Vec<LabEnvironment> {
        let inner = self.read();
        let mut labs: Vec<LabEnvironment> = inner
            .labs
            .values()
            .filter(|lab| lab.course_id == course_id)
            .cloned()
            .collect();
        labs.sort_by_key(|lab| lab.created_at);
        labs
    }

    /// Remove a lab from both indexes and return it. Removing an unknown id
    /// is a no-op, so teardown paths can call this unconditionally.
    pub fn remove(&self, id: Uuid) -> Option<LabEnvironment> {
        let mut inner = self.write();
        let lab = inner.labs.remove(&id)?;
        let owner = (lab.student_id.clone(), lab.course_id.clone());
        if inner.by_owner.get(&owner) == Some(&id) {
            inner.by_owner.remove(&owner);
        }
        Some(lab)
    }

    /// Apply a mutation under the write lock and return the updated
    /// snapshot, or `None` if the lab is gone.
    pub fn update<F>(&self, id: Uuid, f: F) -> Option<LabEnvironment>
    where
        F: FnOnce(&mut LabEnvironment),
    {
        let mut inner = self.write();
        let lab = inner.labs.get_mut(&id)?;
        f(lab);
        Some(lab.clone())
    }

    /// Labs whose idle clock predates `cutoff`, minus the excluded
    /// statuses. This is the reaper's candidate query.
    pub fn list_idle_before(
        &self,
        cutoff: DateTime<Utc>,
        exclude: &[LabStatus],
    ) -> Vec<LabEnvironment> {
        self.read()
            .labs
            .values()
            .filter(|lab| !exclude.contains(&lab.status))
            .filter(|lab| lab.idle_since() < cutoff)
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<LabEnvironment> {
        let mut labs: Vec<LabEnvironment> = self.read().labs.values().cloned().collect();
        labs.sort_by_key(|lab| lab.created_at);
        labs
    }

    pub fn len(&self) -> usize {
        self.read().labs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().labs.is_empty()
    }

    // A poisoned lock still holds the last consistent state; recover it
    // instead of panicking the whole process.
    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LabRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LabConfig;
    use chrono::Duration;
    use std::path::PathBuf;

    fn lab(student: &str, course: &str) -> LabEnvironment {
        let id = Uuid::new_v4();
        LabEnvironment {
            id,
            student_id: student.to_string(),
            course_id: course.to_string(),
            container_name: format!("labdock-{}-{}-{}", student, course, &id.to_string()[..8]),
            container_id: None,
            status: LabStatus::Running,
            config: LabConfig::default(),
            ports: HashMap::new(),
            persistent_storage_path: PathBuf::from("/tmp/labdock"),
            ide_urls: HashMap::new(),
            created_at: Utc::now(),
            last_accessed: None,
        }
    }

    #[test]
    fn register_rejects_duplicate_owner() {
        let registry = LabRegistry::new();
        let first = lab("alice", "cs101");
        let first_id = first.id;
        registry.register(first).unwrap();

        let err = registry.register(lab("alice", "cs101")).unwrap_err();
        assert!(matches!(err, LabError::Conflict(_)));

        // The original entry is untouched
        assert_eq!(registry.find_by_owner("alice", "cs101").unwrap().id, first_id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_student_different_courses_coexist() {
        let registry = LabRegistry::new();
        registry.register(lab("alice", "cs101")).unwrap();
        registry.register(lab("alice", "cs202")).unwrap();
        registry.register(lab("bob", "cs101")).unwrap();

        assert_eq!(registry.find_by_student("alice").len(), 2);
        assert_eq!(registry.find_by_course("cs101").len(), 2);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn remove_is_idempotent_and_frees_the_owner_slot() {
        let registry = LabRegistry::new();
        let entry = lab("alice", "cs101");
        let id = entry.id;
        registry.register(entry).unwrap();

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.find_by_owner("alice", "cs101").is_none());

        // Owner slot is reusable after removal
        registry.register(lab("alice", "cs101")).unwrap();
    }

    #[test]
    fn update_returns_the_new_snapshot() {
        let registry = LabRegistry::new();
        let entry = lab("alice", "cs101");
        let id = entry.id;
        registry.register(entry).unwrap();

        let updated = registry
            .update(id, |lab| {
                lab.status = LabStatus::Stopped;
                lab.container_id = Some("abc123".to_string());
            })
            .unwrap();
        assert_eq!(updated.status, LabStatus::Stopped);
        assert_eq!(registry.get(id).unwrap().container_id.as_deref(), Some("abc123"));

        assert!(registry.update(Uuid::new_v4(), |_| {}).is_none());
    }

    #[test]
    fn idle_query_respects_cutoff_and_exclusions() {
        let registry = LabRegistry::new();

        let mut old_running = lab("alice", "cs101");
        old_running.created_at = Utc::now() - Duration::hours(25);
        let old_id = old_running.id;
        registry.register(old_running).unwrap();

        let mut fresh = lab("bob", "cs101");
        fresh.last_accessed = Some(Utc::now() - Duration::hours(1));
        registry.register(fresh).unwrap();

        let mut stuck_starting = lab("carol", "cs101");
        stuck_starting.status = LabStatus::Starting;
        stuck_starting.created_at = Utc::now() - Duration::hours(48);
        registry.register(stuck_starting).unwrap();

        let cutoff = Utc::now() - Duration::hours(24);
        let idle = registry
            .list_idle_before(cutoff, &[LabStatus::Creating, LabStatus::Starting]);
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, old_id);
    }

    #[test]
    fn recent_access_overrides_old_creation_time() {
        let registry = LabRegistry::new();
        let mut entry = lab("alice", "cs101");
        entry.created_at = Utc::now() - Duration::hours(30);
        entry.last_accessed = Some(Utc::now() - Duration::minutes(5));
        registry.register(entry).unwrap();

        let cutoff = Utc::now() - Duration::hours(24);
        assert!(registry.list_idle_before(cutoff, &[]).is_empty());
    }
}
