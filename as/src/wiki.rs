//! Docs and wiki pages
//!
//! Docs are plain slug-addressed text records. Wiki pages additionally carry
//! a monotonically-incrementing version and a bounded change history, and are
//! searchable with a small deterministic ranking.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::fsutil::{self, now_ms, record_path};
use crate::store::Store;

/// Wiki history is capped to this many change records
const WIKI_HISTORY_CAP: usize = 50;

/// A slug-addressed doc
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doc {
    pub id: String,
    #[serde(default)]
    pub plan: Option<String>,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One wiki change record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiChange {
    pub version: u64,
    pub actor: String,
    pub action: String,
    pub at: i64,
}

/// A versioned wiki page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiPage {
    pub id: String,
    #[serde(default)]
    pub plan: Option<String>,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub version: u64,
    #[serde(default)]
    pub history: Vec<WikiChange>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A ranked wiki search hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiHit {
    pub id: String,
    pub title: String,
    /// 3 = title prefix, 2 = exact token, 1 = substring
    pub rank: u8,
}

impl Store {
    // === docs ===

    /// Create or overwrite a doc
    pub fn put_doc(&self, id: &str, plan: Option<&str>, title: &str, content: &str) -> Result<Doc> {
        debug!(id, "put_doc: called");
        let lock = self.entity_lock("doc", id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let now = now_ms();
        let created_at = self.doc(id).map(|d| d.created_at).unwrap_or(now);
        let doc = Doc {
            id: id.to_string(),
            plan: plan.map(str::to_string),
            title: title.to_string(),
            content: content.to_string(),
            created_at,
            updated_at: now,
        };
        fsutil::write_json_atomic(&record_path(&self.docs_dir(), id), &doc)?;
        Ok(doc)
    }

    pub fn doc(&self, id: &str) -> Result<Doc> {
        fsutil::read_json(&record_path(&self.docs_dir(), id), &format!("doc {}", id))
    }

    pub fn list_docs(&self, plan: Option<&str>) -> Result<Vec<Doc>> {
        let mut docs = Vec::new();
        for id in fsutil::slug_ids(&self.docs_dir()) {
            let doc = self.doc(&id)?;
            if plan.is_none() || doc.plan.as_deref() == plan {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    pub fn update_doc(&self, id: &str, mutate: impl FnOnce(&mut Doc)) -> Result<Doc> {
        let lock = self.entity_lock("doc", id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut doc = self.doc(id)?;
        mutate(&mut doc);
        doc.updated_at = now_ms();
        fsutil::write_json_atomic(&record_path(&self.docs_dir(), id), &doc)?;
        Ok(doc)
    }

    pub fn delete_doc(&self, id: &str) -> Result<()> {
        let lock = self.entity_lock("doc", id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = record_path(&self.docs_dir(), id);
        if !path.exists() {
            return Err(crate::error::StoreError::NotFound(format!("doc {}", id)));
        }
        std::fs::remove_file(&path).map_err(|e| crate::error::StoreError::io(format!("deleting doc {}", id), e))
    }

    // === wiki ===

    /// Create or update a wiki page; every write bumps the version
    pub fn put_wiki(&self, id: &str, plan: Option<&str>, title: &str, content: &str, actor: &str) -> Result<WikiPage> {
        debug!(id, actor, "put_wiki: called");
        let lock = self.entity_lock("wiki", id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let now = now_ms();
        let mut page = match self.wiki(id) {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => WikiPage {
                id: id.to_string(),
                plan: plan.map(str::to_string),
                title: String::new(),
                content: String::new(),
                version: 0,
                history: Vec::new(),
                created_at: now,
                updated_at: now,
            },
            Err(e) => return Err(e),
        };

        let action = if page.version == 0 { "create" } else { "edit" };
        page.plan = plan.map(str::to_string);
        page.title = title.to_string();
        page.content = content.to_string();
        page.version += 1;
        page.updated_at = now;
        page.history.push(WikiChange {
            version: page.version,
            actor: actor.to_string(),
            action: action.to_string(),
            at: now,
        });
        if page.history.len() > WIKI_HISTORY_CAP {
            let excess = page.history.len() - WIKI_HISTORY_CAP;
            page.history.drain(..excess);
        }

        fsutil::write_json_atomic(&record_path(&self.wiki_dir(), id), &page)?;
        Ok(page)
    }

    pub fn wiki(&self, id: &str) -> Result<WikiPage> {
        fsutil::read_json(&record_path(&self.wiki_dir(), id), &format!("wiki page {}", id))
    }

    pub fn list_wiki(&self, plan: Option<&str>) -> Result<Vec<WikiPage>> {
        let mut pages = Vec::new();
        for id in fsutil::slug_ids(&self.wiki_dir()) {
            let page = self.wiki(&id)?;
            if plan.is_none() || page.plan.as_deref() == plan {
                pages.push(page);
            }
        }
        Ok(pages)
    }

    pub fn delete_wiki(&self, id: &str) -> Result<()> {
        let lock = self.entity_lock("wiki", id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = record_path(&self.wiki_dir(), id);
        if !path.exists() {
            return Err(crate::error::StoreError::NotFound(format!("wiki page {}", id)));
        }
        std::fs::remove_file(&path).map_err(|e| crate::error::StoreError::io(format!("deleting wiki page {}", id), e))
    }

    /// Rank wiki pages for a query
    ///
    /// Title prefix beats exact token beats substring; ties break by slug
    /// order, so the result is a pure function of the snapshot and query.
    pub fn search_wiki(&self, query: &str) -> Result<Vec<WikiHit>> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();

        for page in self.list_wiki(None)? {
            let title = page.title.to_lowercase();
            let content = page.content.to_lowercase();

            let rank = if title.starts_with(&needle) {
                3
            } else if title.split_whitespace().any(|t| t == needle)
                || content.split_whitespace().any(|t| t == needle)
            {
                2
            } else if title.contains(&needle) || content.contains(&needle) {
                1
            } else {
                continue;
            };

            hits.push(WikiHit {
                id: page.id,
                title: page.title,
                rank,
            });
        }

        hits.sort_by(|a, b| b.rank.cmp(&a.rank).then_with(|| a.id.cmp(&b.id)));
        Ok(hits)
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
    fn test_doc_put_and_scope_filter() {
        let (_t, store) = store();
        store.put_doc("arch", None, "Architecture", "overview").unwrap();
        store.put_doc("auth-notes", Some("auth"), "Auth notes", "jwt").unwrap();

        assert_eq!(store.list_docs(None).unwrap().len(), 2);
        let scoped = store.list_docs(Some("auth")).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id, "auth-notes");
    }

    #[test]
    fn test_delete_doc_and_wiki() {
        let (_t, store) = store();
        store.put_doc("tmp", None, "Temp", "x").unwrap();
        store.delete_doc("tmp").unwrap();
        assert!(store.doc("tmp").unwrap_err().is_not_found());
        assert!(store.delete_doc("tmp").unwrap_err().is_not_found());

        store.put_wiki("scratch", None, "Scratch", "x", "a").unwrap();
        store.delete_wiki("scratch").unwrap();
        assert!(store.wiki("scratch").unwrap_err().is_not_found());
    }

    #[test]
    fn test_wiki_version_increments_per_write() {
        let (_t, store) = store();
        let v1 = store.put_wiki("setup", None, "Setup", "first", "alice").unwrap();
        let v2 = store.put_wiki("setup", None, "Setup", "second", "bob").unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.history.len(), 2);
        assert_eq!(v2.history[0].action, "create");
        assert_eq!(v2.history[1].action, "edit");
        assert_eq!(v2.history[1].actor, "bob");
    }

    #[test]
    fn test_wiki_history_is_bounded() {
        let (_t, store) = store();
        for n in 0..60 {
            store
                .put_wiki("page", None, "Page", &format!("rev {}", n), "bot")
                .unwrap();
        }
        let page = store.wiki("page").unwrap();
        assert_eq!(page.version, 60);
        assert_eq!(page.history.len(), WIKI_HISTORY_CAP);
        assert_eq!(page.history.last().unwrap().version, 60);
        assert_eq!(page.history.first().unwrap().version, 11);
    }

    #[test]
    fn test_search_ranking_tiers() {
        let (_t, store) = store();
        store.put_wiki("deploy", None, "Deploy guide", "ship it", "a").unwrap();
        store.put_wiki("ops", None, "Operations", "how to deploy safely", "a").unwrap();
        store.put_wiki("misc", None, "Notes", "redeployment checklist", "a").unwrap();
        store.put_wiki("other", None, "Unrelated", "nothing here", "a").unwrap();

        let hits = store.search_wiki("deploy").unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["deploy", "ops", "misc"]);
        assert_eq!(hits[0].rank, 3);
        assert_eq!(hits[1].rank, 2);
        assert_eq!(hits[2].rank, 1);
    }

    #[test]
    fn test_search_is_deterministic() {
        let (_t, store) = store();
        store.put_wiki("b-page", None, "topic", "", "a").unwrap();
        store.put_wiki("a-page", None, "topic", "", "a").unwrap();

        let first = store.search_wiki("topic").unwrap();
        let second = store.search_wiki("topic").unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].id, "a-page");
    }
}
