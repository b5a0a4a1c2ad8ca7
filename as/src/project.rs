//! Project record: name, repo path, active plan selection

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::fsutil::{self, now_ms};
use crate::plan::PlanStatus;
use crate::store::Store;

/// The single per-store project record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Human name, defaults to the repo directory name
    pub name: String,

    /// Absolute path of the repository this store belongs to
    pub repo_path: String,

    /// Currently selected plan (must be an `active` plan)
    #[serde(default)]
    pub active_plan: Option<String>,

    /// Creation timestamp (unix ms)
    pub created_at: i64,

    /// Last update timestamp (unix ms)
    pub updated_at: i64,
}

impl Store {
    /// Initialise the project record; `Conflict` if already initialised
    pub fn init_project(&self, name: &str, repo_path: &str) -> Result<Project> {
        debug!(name, repo_path, "init_project: called");
        let lock = self.entity_lock("project", "project");
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.project_path().exists() {
            return Err(StoreError::Conflict(format!("project already initialised at {}", repo_path)));
        }

        let now = now_ms();
        let project = Project {
            name: name.to_string(),
            repo_path: repo_path.to_string(),
            active_plan: None,
            created_at: now,
            updated_at: now,
        };
        fsutil::write_json_atomic(&self.project_path(), &project)?;
        Ok(project)
    }

    /// Read the project record
    pub fn project(&self) -> Result<Project> {
        fsutil::read_json(&self.project_path(), "project")
    }

    /// Select (or clear) the project's active plan
    ///
    /// Only a plan with `active` status is selectable.
    pub fn set_active_plan(&self, plan_id: Option<&str>) -> Result<Project> {
        debug!(?plan_id, "set_active_plan: called");
        let lock = self.entity_lock("project", "project");
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(id) = plan_id {
            let plan = self.plan(id)?;
            if plan.status != PlanStatus::Active {
                return Err(StoreError::Invalid(format!(
                    "plan {} is {} and cannot be selected",
                    id, plan.status
                )));
            }
        }

        let mut project = self.project()?;
        project.active_plan = plan_id.map(str::to_string);
        project.updated_at = now_ms();
        fsutil::write_json_atomic(&self.project_path(), &project)?;
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::NewPlan;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join(".adaf")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_init_then_get() {
        let (_t, store) = store();
        let created = store.init_project("demo", "/work/demo").unwrap();
        let read = store.project().unwrap();
        assert_eq!(read.name, created.name);
        assert_eq!(read.repo_path, "/work/demo");
        assert!(read.active_plan.is_none());
    }

    #[test]
    fn test_double_init_is_conflict() {
        let (_t, store) = store();
        store.init_project("demo", "/work/demo").unwrap();
        assert!(store.init_project("demo", "/work/demo").unwrap_err().is_conflict());
    }

    #[test]
    fn test_missing_project_is_not_found() {
        let (_t, store) = store();
        assert!(store.project().unwrap_err().is_not_found());
    }

    #[test]
    fn test_set_active_plan_requires_active_status() {
        let (_t, store) = store();
        store.init_project("demo", "/work/demo").unwrap();
        store.create_plan(NewPlan::new("auth", "Auth work")).unwrap();

        store.set_active_plan(Some("auth")).unwrap();
        assert_eq!(store.project().unwrap().active_plan.as_deref(), Some("auth"));

        store.set_plan_status("auth", PlanStatus::Frozen).unwrap();
        let err = store.set_active_plan(Some("auth")).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));

        store.set_active_plan(None).unwrap();
        assert!(store.project().unwrap().active_plan.is_none());
    }
}
