//! Plan records: phased bodies of work with a lifecycle
//!
//! At most one plan is `active` *and* selected as the project's active plan
//! at a time; selection is enforced in the project module, the lifecycle
//! side effects here.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::fsutil::{self, now_ms, record_path};
use crate::issue::{IssueStatus, Priority};
use crate::store::Store;

/// Plan lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Active,
    Frozen,
    Done,
    Cancelled,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Frozen => write!(f, "frozen"),
            Self::Done => write!(f, "done"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Phase progress status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    NotStarted,
    InProgress,
    Complete,
    Blocked,
}

/// One ordered phase inside a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default)]
    pub priority: Priority,
    /// Phase ids inside the same plan that must complete first
    #[serde(default)]
    pub deps: Vec<String>,
}

/// A plan record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: PlanStatus,
    #[serde(default)]
    pub phases: Vec<Phase>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for plan creation
#[derive(Debug, Clone)]
pub struct NewPlan {
    pub id: String,
    pub title: String,
    pub description: String,
    pub phases: Vec<Phase>,
}

impl NewPlan {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            phases: Vec::new(),
        }
    }
}

/// Check the plan id shape: `[a-z0-9][a-z0-9_-]{0,63}`
pub fn valid_plan_id(id: &str) -> bool {
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return false;
    }
    if id.len() > 64 {
        return false;
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

impl Store {
    /// Create a plan; `Invalid` on a malformed id, `Conflict` on collision
    pub fn create_plan(&self, new: NewPlan) -> Result<Plan> {
        debug!(id = %new.id, "create_plan: called");
        if !valid_plan_id(&new.id) {
            return Err(StoreError::Invalid(format!("malformed plan id {:?}", new.id)));
        }

        let lock = self.entity_lock("plan", &new.id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = record_path(&self.plans_dir(), &new.id);
        if path.exists() {
            return Err(StoreError::Conflict(format!("plan {} already exists", new.id)));
        }

        let now = now_ms();
        let plan = Plan {
            id: new.id,
            title: new.title,
            description: new.description,
            status: PlanStatus::Active,
            phases: new.phases,
            created_at: now,
            updated_at: now,
        };
        fsutil::write_json_atomic(&path, &plan)?;
        Ok(plan)
    }

    /// Read one plan
    pub fn plan(&self, id: &str) -> Result<Plan> {
        fsutil::read_json(&record_path(&self.plans_dir(), id), &format!("plan {}", id))
    }

    /// All plans, ordered by id
    pub fn list_plans(&self) -> Result<Vec<Plan>> {
        fsutil::slug_ids(&self.plans_dir()).iter().map(|id| self.plan(id)).collect()
    }

    /// Apply an in-place mutation to a plan under its entity lock
    pub fn update_plan(&self, id: &str, mutate: impl FnOnce(&mut Plan)) -> Result<Plan> {
        let lock = self.entity_lock("plan", id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut plan = self.plan(id)?;
        mutate(&mut plan);
        plan.updated_at = now_ms();
        fsutil::write_json_atomic(&record_path(&self.plans_dir(), id), &plan)?;
        Ok(plan)
    }

    /// Transition a plan's lifecycle status, applying the side effects
    ///
    /// `done` merges plan-scoped issues and docs into the shared scope;
    /// `cancelled` closes the plan's open issues as `wontfix`. A plan that
    /// leaves `active` while selected is deselected from the project.
    pub fn set_plan_status(&self, id: &str, status: PlanStatus) -> Result<Plan> {
        debug!(id, %status, "set_plan_status: called");
        let plan = self.update_plan(id, |p| p.status = status)?;

        match status {
            PlanStatus::Done => {
                let moved = self.unscope_plan_records(id)?;
                info!(id, moved, "plan done; merged plan-scoped records into shared scope");
            }
            PlanStatus::Cancelled => {
                let closed = self.close_plan_issues(id)?;
                info!(id, closed, "plan cancelled; closed open plan issues as wontfix");
            }
            PlanStatus::Active | PlanStatus::Frozen => {}
        }

        if status != PlanStatus::Active {
            let project = self.project();
            if let Ok(project) = project {
                if project.active_plan.as_deref() == Some(id) {
                    self.set_active_plan(None)?;
                }
            }
        }
        Ok(plan)
    }

    /// Delete a plan; only `done` or `cancelled` plans may be deleted
    pub fn delete_plan(&self, id: &str) -> Result<()> {
        let lock = self.entity_lock("plan", id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let plan = self.plan(id)?;
        if !matches!(plan.status, PlanStatus::Done | PlanStatus::Cancelled) {
            return Err(StoreError::Invalid(format!(
                "plan {} is {}; only done or cancelled plans can be deleted",
                id, plan.status
            )));
        }
        std::fs::remove_file(record_path(&self.plans_dir(), id))
            .map_err(|e| StoreError::io(format!("deleting plan {}", id), e))?;
        Ok(())
    }

    /// Move this plan's issues and docs into the shared (unscoped) space
    fn unscope_plan_records(&self, plan_id: &str) -> Result<usize> {
        let mut moved = 0;
        for issue in self.list_issues(Some(plan_id))? {
            self.update_issue(issue.id, |i| i.plan = None)?;
            moved += 1;
        }
        for doc in self.list_docs(Some(plan_id))? {
            self.update_doc(&doc.id, |d| d.plan = None)?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Close open/in-progress issues of this plan as wontfix
    fn close_plan_issues(&self, plan_id: &str) -> Result<usize> {
        let mut closed = 0;
        for issue in self.list_issues(Some(plan_id))? {
            if matches!(issue.status, IssueStatus::Open | IssueStatus::InProgress) {
                self.update_issue(issue.id, |i| i.status = IssueStatus::Wontfix)?;
                closed += 1;
            }
        }
        Ok(closed)
    }
}
