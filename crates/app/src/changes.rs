use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use kapsule_core::{LabelSelector, ObjectStore, StoredObject};
use metrics::counter;
use tracing::{debug, info};

use crate::meta::{ChangeMeta, ChangeStatus};
use crate::{CHANGE_APP_LABEL_KEY, IS_CHANGE_LABEL_KEY};

/// A recorded deploy attempt. `fail`/`succeed` are terminal; call at most one of them, once.
#[async_trait::async_trait]
pub trait Change: Send + Sync {
    fn name(&self) -> &str;
    fn meta(&self) -> &ChangeMeta;
    fn status(&self) -> ChangeStatus { self.meta().status() }
    async fn fail(&mut self) -> Result<()>;
    async fn succeed(&mut self) -> Result<()>;
    async fn delete(&self) -> Result<()>;
}

/// Change backed by its own stored object.
#[derive(Clone)]
pub struct RecordedChange {
    name: String,
    store: Arc<dyn ObjectStore>,
    meta: ChangeMeta,
}

impl std::fmt::Debug for RecordedChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordedChange").field("name", &self.name).field("meta", &self.meta).finish()
    }
}

impl RecordedChange {
    pub(crate) fn new(name: String, store: Arc<dyn ObjectStore>, meta: ChangeMeta) -> Self {
        Self { name, store, meta }
    }

    async fn finish(&mut self, successful: bool) -> Result<()> {
        let next = self.meta.finished(successful);
        // Blind write: fresh copy, no version check
        let mut obj = self.store.get(&self.name).await.map_err(|e| anyhow!("Getting app change: {}", e))?;
        obj.resource_version = None;
        obj.data = next.as_data()?;
        self.store.update(obj).await.map_err(|e| anyhow!("Updating app change: {}", e))?;
        self.meta = next;
        info!(change = %self.name, status = %self.meta.status(), "change finished");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Change for RecordedChange {
    fn name(&self) -> &str { &self.name }
    fn meta(&self) -> &ChangeMeta { &self.meta }

    async fn fail(&mut self) -> Result<()> {
        self.finish(false).await?;
        counter!("app_change_failed_total", 1u64);
        Ok(())
    }

    async fn succeed(&mut self) -> Result<()> {
        self.finish(true).await?;
        counter!("app_change_succeeded_total", 1u64);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.store.delete(&self.name).await.map_err(|e| anyhow!("Deleting app change: {}", e))?;
        debug!(change = %self.name, "change deleted");
        Ok(())
    }
}

/// Change history of one app.
pub struct RecordedAppChanges {
    app_name: String,
    store: Arc<dyn ObjectStore>,
}

impl RecordedAppChanges {
    pub fn new(app_name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self { app_name: app_name.into(), store }
    }

    fn selector(&self) -> LabelSelector {
        LabelSelector::from_pairs([(IS_CHANGE_LABEL_KEY, ""), (CHANGE_APP_LABEL_KEY, self.app_name.as_str())])
    }

    /// Record a new active change; `startedAt` defaults to now.
    pub async fn begin(&self, mut meta: ChangeMeta) -> Result<RecordedChange> {
        if meta.started_at.is_none() {
            meta.started_at = Some(Utc::now());
        }
        meta.finished_at = None;
        meta.successful = None;

        let mut obj = StoredObject::with_generate_name(format!("{}-change-", self.app_name));
        obj.labels = self.selector().terms().clone();
        obj.data = meta.as_data()?;
        let created = self.store.create(obj).await.map_err(|e| anyhow!("Creating app change: {}", e))?;
        counter!("app_change_begin_total", 1u64);
        info!(app = %self.app_name, change = %created.name, "change started");
        Ok(RecordedChange::new(created.name, self.store.clone(), meta))
    }

    /// All changes, oldest first.
    pub async fn list(&self) -> Result<Vec<RecordedChange>> {
        let objs = self.store.list(&self.selector()).await.map_err(|e| anyhow!("Listing app changes: {}", e))?;
        let mut out = Vec::with_capacity(objs.len());
        for obj in objs {
            let meta = ChangeMeta::from_data(&obj.data).map_err(|e| {
                anyhow!("App change '{}' did not contain parseable change metadata: {:#}", obj.name, e)
            })?;
            out.push(RecordedChange::new(obj.name, self.store.clone(), meta));
        }
        out.sort_by(|a, b| a.meta.started_at.cmp(&b.meta.started_at).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    /// Delete the oldest changes until at most `max_to_keep` remain; `keep` is never deleted.
    /// Returns the number deleted. Stops at the first failure.
    pub async fn gc(&self, max_to_keep: usize, keep: &str) -> Result<usize> {
        let changes = self.list().await?;
        let mut excess = changes.len().saturating_sub(max_to_keep);
        let mut deleted = 0;
        for change in changes.iter().filter(|c| c.name() != keep) {
            if excess == 0 {
                break;
            }
            change.delete().await?;
            excess -= 1;
            deleted += 1;
        }
        counter!("app_change_gc_deleted_total", deleted as u64);
        info!(app = %self.app_name, deleted, kept = changes.len() - deleted, "changes collected");
        Ok(deleted)
    }

    /// Delete every change; stops at the first failure, keeping earlier deletions.
    pub async fn delete_all(&self) -> Result<()> {
        let changes = self.list().await?;
        for change in &changes {
            change.delete().await?;
        }
        info!(app = %self.app_name, count = changes.len(), "changes deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use kapsule_store::{MemoryStore, StoreOp};

    fn at(min: i64) -> ChangeMeta {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ChangeMeta { started_at: Some(t0 + Duration::minutes(min)), ..Default::default() }
    }

    #[tokio::test]
    async fn begin_creates_labelled_active_change() {
        let store = Arc::new(MemoryStore::new());
        let changes = RecordedAppChanges::new("web", store.clone());
        let c = changes.begin(ChangeMeta::new("deploy", vec!["ns".into()])).await.unwrap();
        assert!(c.name().starts_with("web-change-"));
        assert_eq!(c.status(), ChangeStatus::Active);
        assert!(c.meta().started_at.is_some());

        let stored = store.peek(c.name()).unwrap();
        assert_eq!(stored.labels.get(IS_CHANGE_LABEL_KEY).map(String::as_str), Some(""));
        assert_eq!(stored.labels.get(CHANGE_APP_LABEL_KEY).map(String::as_str), Some("web"));
        assert_eq!(ChangeMeta::from_data(&stored.data).unwrap().description, "deploy");
    }

    #[tokio::test]
    async fn finishing_is_a_blind_write() {
        let store = Arc::new(MemoryStore::new());
        let changes = RecordedAppChanges::new("web", store.clone());
        let mut c = changes.begin(ChangeMeta::default()).await.unwrap();

        // someone else bumps the version first
        let mut other = store.peek(c.name()).unwrap();
        other.annotations.insert("touched".into(), "yes".into());
        store.update(other).await.unwrap();

        c.succeed().await.unwrap();
        assert_eq!(c.status(), ChangeStatus::Succeeded);
        let stored = ChangeMeta::from_data(&store.peek(c.name()).unwrap().data).unwrap();
        assert_eq!(stored.status(), ChangeStatus::Succeeded);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn failed_write_keeps_local_status() {
        let store = Arc::new(MemoryStore::new());
        let mut c = RecordedAppChanges::new("web", store.clone()).begin(ChangeMeta::default()).await.unwrap();
        store.fail_on(StoreOp::Update, Some(c.name()));
        let err = c.fail().await.unwrap_err().to_string();
        assert!(err.starts_with("Updating app change:"), "err={}", err);
        assert_eq!(c.status(), ChangeStatus::Active);

        // nothing was recorded as finished, so a retry can still finish it
        let stored = ChangeMeta::from_data(&store.peek(c.name()).unwrap().data).unwrap();
        assert_eq!(stored.status(), ChangeStatus::Active);
        c.fail().await.unwrap();
        assert_eq!(c.status(), ChangeStatus::Failed);
    }

    #[tokio::test]
    async fn list_is_scoped_to_app_and_ordered_by_start() {
        let store = Arc::new(MemoryStore::new());
        let web = RecordedAppChanges::new("web", store.clone());
        let late = web.begin(at(5)).await.unwrap();
        let early = web.begin(at(1)).await.unwrap();
        RecordedAppChanges::new("db", store.clone()).begin(at(0)).await.unwrap();

        let names: Vec<String> = web.list().await.unwrap().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec![early.name().to_string(), late.name().to_string()]);
    }

    #[tokio::test]
    async fn delete_all_stops_at_first_failure() {
        let store = Arc::new(MemoryStore::new());
        let web = RecordedAppChanges::new("web", store.clone());
        let first = web.begin(at(1)).await.unwrap();
        let second = web.begin(at(2)).await.unwrap();
        let third = web.begin(at(3)).await.unwrap();

        store.fail_on(StoreOp::Delete, Some(second.name()));
        assert!(web.delete_all().await.is_err());
        assert!(store.peek(first.name()).is_none());
        assert!(store.peek(second.name()).is_some());
        assert!(store.peek(third.name()).is_some());

        web.delete_all().await.unwrap();
        assert!(web.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gc_trims_oldest_and_spares_kept() {
        let store = Arc::new(MemoryStore::new());
        let web = RecordedAppChanges::new("web", store.clone());
        let mut names = Vec::new();
        for min in 1..=5 {
            names.push(web.begin(at(min)).await.unwrap().name().to_string());
        }

        // oldest is the pointed-at change, so the next two go instead
        assert_eq!(web.gc(2, &names[0]).await.unwrap(), 3);
        let left: Vec<String> = web.list().await.unwrap().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(left, vec![names[0].clone(), names[4].clone()]);

        assert_eq!(web.gc(5, "").await.unwrap(), 0);
        assert_eq!(web.gc(0, &names[4]).await.unwrap(), 1);
        assert_eq!(web.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gc_stops_at_first_failed_delete() {
        let store = Arc::new(MemoryStore::new());
        let web = RecordedAppChanges::new("web", store.clone());
        let first = web.begin(at(1)).await.unwrap();
        let second = web.begin(at(2)).await.unwrap();
        web.begin(at(3)).await.unwrap();

        store.fail_on(StoreOp::Delete, Some(second.name()));
        let err = web.gc(0, "").await.unwrap_err().to_string();
        assert!(err.starts_with("Deleting app change:"), "err={}", err);
        assert!(store.peek(first.name()).is_none());
        assert_eq!(web.list().await.unwrap().len(), 2);
    }
}
