//! Issue records with an acyclic dependency graph

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::fsutil::{self, now_ms, record_path};
use crate::store::Store;

/// Issue workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    InProgress,
    Resolved,
    Wontfix,
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Resolved => write!(f, "resolved"),
            Self::Wontfix => write!(f, "wontfix"),
        }
    }
}

/// Priority shared by issues and plan phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

/// An issue record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: IssueStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Issue ids this issue depends on; the graph stays acyclic
    #[serde(default)]
    pub depends_on: Vec<u64>,
    /// Owning plan, `None` for the shared scope
    #[serde(default)]
    pub plan: Option<String>,
    /// Turn that filed this issue, when filed from inside a loop
    #[serde(default)]
    pub origin_turn: Option<u64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for issue creation
#[derive(Debug, Clone, Default)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub labels: Vec<String>,
    pub depends_on: Vec<u64>,
    pub plan: Option<String>,
    pub origin_turn: Option<u64>,
}

impl NewIssue {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn with_deps(mut self, deps: Vec<u64>) -> Self {
        self.depends_on = deps;
        self
    }
}

impl Store {
    /// Create an issue with a freshly allocated monotonic id
    pub fn create_issue(&self, new: NewIssue) -> Result<Issue> {
        debug!(title = %new.title, "create_issue: called");
        let id = self.alloc_id("issue")?;
        self.ensure_acyclic(id, &new.depends_on)?;

        let now = now_ms();
        let issue = Issue {
            id,
            title: new.title,
            description: new.description,
            status: IssueStatus::Open,
            priority: new.priority,
            labels: new.labels,
            depends_on: new.depends_on,
            plan: new.plan,
            origin_turn: new.origin_turn,
            created_at: now,
            updated_at: now,
        };
        fsutil::write_json_atomic(&record_path(&self.issues_dir(), id), &issue)?;
        Ok(issue)
    }

    /// Read one issue
    pub fn issue(&self, id: u64) -> Result<Issue> {
        fsutil::read_json(&record_path(&self.issues_dir(), id), &format!("issue {}", id))
    }

    /// List issues, optionally restricted to one plan scope
    pub fn list_issues(&self, plan: Option<&str>) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();
        for id in fsutil::numeric_ids(&self.issues_dir()) {
            let issue = self.issue(id)?;
            if plan.is_none() || issue.plan.as_deref() == plan {
                issues.push(issue);
            }
        }
        Ok(issues)
    }

    /// Apply a mutation to an issue, revalidating the dependency graph
    ///
    /// The mutation sees and may edit every field; a resulting cycle or
    /// self-dependency rejects the whole update and leaves the record
    /// untouched.
    pub fn update_issue(&self, id: u64, mutate: impl FnOnce(&mut Issue)) -> Result<Issue> {
        let lock = self.entity_lock("issue", &id.to_string());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut issue = self.issue(id)?;
        mutate(&mut issue);
        issue.id = id; // id is not editable
        self.ensure_acyclic(id, &issue.depends_on)?;
        issue.updated_at = now_ms();
        fsutil::write_json_atomic(&record_path(&self.issues_dir(), id), &issue)?;
        Ok(issue)
    }

    /// Delete an issue; depending issues keep the dangling id
    pub fn delete_issue(&self, id: u64) -> Result<()> {
        let lock = self.entity_lock("issue", &id.to_string());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = record_path(&self.issues_dir(), id);
        if !path.exists() {
            return Err(StoreError::NotFound(format!("issue {}", id)));
        }
        std::fs::remove_file(&path).map_err(|e| StoreError::io(format!("deleting issue {}", id), e))
    }

    /// Reject a proposed dependency list that would create a cycle
    ///
    /// Simulates the proposed edges against the current graph: walks the
    /// transitive closure of `proposed_deps` and fails if it reaches `id`.
    pub fn ensure_acyclic(&self, id: u64, proposed_deps: &[u64]) -> Result<()> {
        if proposed_deps.contains(&id) {
            return Err(StoreError::Invalid(format!("issue {} cannot depend on itself", id)));
        }

        // Current graph, with the proposed edge set substituted for `id`
        let mut graph: HashMap<u64, Vec<u64>> = HashMap::new();
        for other in fsutil::numeric_ids(&self.issues_dir()) {
            if other == id {
                continue;
            }
            graph.insert(other, self.issue(other)?.depends_on);
        }
        graph.insert(id, proposed_deps.to_vec());

        let mut seen: HashSet<u64> = HashSet::new();
        let mut stack: Vec<u64> = proposed_deps.to_vec();
        while let Some(next) = stack.pop() {
            if next == id {
                return Err(StoreError::Invalid(format!(
                    "dependency cycle: issue {} transitively depends on itself",
                    id
                )));
            }
            if !seen.insert(next) {
                continue;
            }
            if let Some(deps) = graph.get(&next) {
                stack.extend(deps.iter().copied());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join(".adaf")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_ids_are_monotonic() {
        let (_t, store) = store();
        let a = store.create_issue(NewIssue::new("a")).unwrap();
        let b = store.create_issue(NewIssue::new("b")).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let (_t, store) = store();
        let mut new = NewIssue::new("flaky test").with_plan("auth");
        new.priority = Priority::Critical;
        new.labels = vec!["ci".to_string()];
        let created = store.create_issue(new).unwrap();

        let read = store.issue(created.id).unwrap();
        assert_eq!(read.title, "flaky test");
        assert_eq!(read.priority, Priority::Critical);
        assert_eq!(read.labels, vec!["ci".to_string()]);
        assert_eq!(read.plan.as_deref(), Some("auth"));
        assert_eq!(read.status, IssueStatus::Open);
    }

    #[test]
    fn test_scope_filter() {
        let (_t, store) = store();
        store.create_issue(NewIssue::new("a").with_plan("auth")).unwrap();
        store.create_issue(NewIssue::new("b")).unwrap();

        assert_eq!(store.list_issues(Some("auth")).unwrap().len(), 1);
        assert_eq!(store.list_issues(None).unwrap().len(), 2);
    }

    #[test]
    fn test_self_dependency_rejected() {
        let (_t, store) = store();
        let issue = store.create_issue(NewIssue::new("a")).unwrap();
        let err = store.update_issue(issue.id, |i| i.depends_on = vec![issue.id]).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn test_transitive_cycle_rejected_and_graph_unchanged() {
        let (_t, store) = store();
        // #1 -> [#2], #2 -> [#3], then closing the loop #3 -> [#1] must fail
        let i1 = store.create_issue(NewIssue::new("one")).unwrap();
        let i2 = store.create_issue(NewIssue::new("two")).unwrap();
        let i3 = store.create_issue(NewIssue::new("three")).unwrap();
        store.update_issue(i1.id, |i| i.depends_on = vec![i2.id]).unwrap();
        store.update_issue(i2.id, |i| i.depends_on = vec![i3.id]).unwrap();

        let err = store.update_issue(i3.id, |i| i.depends_on = vec![i1.id]).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert!(store.issue(i3.id).unwrap().depends_on.is_empty());
    }

    #[test]
    fn test_delete_issue() {
        let (_t, store) = store();
        let issue = store.create_issue(NewIssue::new("gone soon")).unwrap();
        store.delete_issue(issue.id).unwrap();
        assert!(store.issue(issue.id).unwrap_err().is_not_found());
        assert!(store.delete_issue(issue.id).unwrap_err().is_not_found());
        // Ids are never reused after a delete
        assert_eq!(store.create_issue(NewIssue::new("next")).unwrap().id, issue.id + 1);
    }

    #[test]
    fn test_diamond_dependencies_allowed() {
        let (_t, store) = store();
        let a = store.create_issue(NewIssue::new("a")).unwrap();
        let b = store.create_issue(NewIssue::new("b").with_deps(vec![a.id])).unwrap();
        let c = store.create_issue(NewIssue::new("c").with_deps(vec![a.id])).unwrap();
        let d = store
            .create_issue(NewIssue::new("d").with_deps(vec![b.id, c.id]))
            .unwrap();
        assert_eq!(d.depends_on, vec![b.id, c.id]);
    }
}
