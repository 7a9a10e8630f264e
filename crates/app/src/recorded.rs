use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use chrono::Utc;
use kapsule_core::{IdentifiedResources, LabelSelector, ObjectStore, StoreError, StoredObject};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::changes::{Change, RecordedAppChanges, RecordedChange};
use crate::labeled::LabeledApp;
use crate::meta::{parse_app_meta, AppMeta, ChangeMeta};
use crate::{APP_LABEL_KEY, IS_APP_LABEL_KEY};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Address of an app record plus its memoized metadata.
#[derive(Clone)]
struct AppRecordRef {
    name: String,
    namespace: String,
    store: Arc<dyn ObjectStore>,
    // Filled by the first read (or a bulk list) and by writes through this handle.
    // Never refreshed from the store afterwards.
    cache: Arc<Mutex<Option<AppMeta>>>,
}

impl AppRecordRef {
    fn missing(&self, err: StoreError) -> anyhow::Error {
        anyhow!("App '{}' (namespace: {}) does not exist: {}", self.name, self.namespace, err)
    }

    async fn fetch(&self) -> Result<StoredObject> {
        match self.store.get(&self.name).await {
            Ok(obj) => Ok(obj),
            Err(e) if e.is_not_found() => Err(self.missing(e)),
            Err(e) => Err(anyhow!("Getting app: {}", e)),
        }
    }

    fn parse(&self, obj: &StoredObject) -> Result<AppMeta> {
        parse_app_meta(&self.name, &self.namespace, obj)
    }

    async fn meta(&self) -> Result<AppMeta> {
        if let Some(meta) = lock(&self.cache).clone() {
            return Ok(meta);
        }
        let obj = self.fetch().await?;
        let meta = self.parse(&obj)?;
        *lock(&self.cache) = Some(meta.clone());
        Ok(meta)
    }

    /// Read-modify-write of the record's metadata; the write carries the fetched version.
    async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut AppMeta) + Send,
    {
        let mut obj = self.store.get(&self.name).await.map_err(|e| anyhow!("Getting app: {}", e))?;
        let mut meta = self.parse(&obj)?;
        mutate(&mut meta);
        obj.data = meta.as_data()?;
        self.store.update(obj).await.map_err(|e| anyhow!("Updating app: {}", e))?;
        *lock(&self.cache) = Some(meta);
        Ok(())
    }
}

fn merge_labels(target: &mut BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> Result<()> {
    for (key, val) in labels {
        if let Some(prev) = target.get(key) {
            if prev != val {
                return Err(anyhow!("Expected label '{}' value to remain same", key));
            }
        }
        target.insert(key.clone(), val.clone());
    }
    Ok(())
}

/// Handle to one app: its stored record, change history and labelled resources.
pub struct RecordedApp {
    record: AppRecordRef,
    resources: Arc<dyn IdentifiedResources>,
}

impl RecordedApp {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        resources: Arc<dyn IdentifiedResources>,
    ) -> Self {
        let record = AppRecordRef {
            name: name.into(),
            namespace: namespace.into(),
            store,
            cache: Arc::new(Mutex::new(None)),
        };
        Self { record, resources }
    }

    /// Pre-seed the metadata cache, skipping the first fetch.
    pub fn with_meta(self, meta: AppMeta) -> Self {
        *lock(&self.record.cache) = Some(meta);
        self
    }

    pub fn name(&self) -> &str { &self.record.name }
    pub fn namespace(&self) -> &str { &self.record.namespace }

    /// Metadata currently memoized by this handle, if any. May be stale relative to other writers.
    pub fn cached_meta(&self) -> Option<AppMeta> { lock(&self.record.cache).clone() }

    pub async fn meta(&self) -> Result<AppMeta> { self.record.meta().await }

    pub async fn label_selector(&self) -> Result<LabelSelector> {
        Ok(LabelSelector::from_pairs(self.meta().await?.labels()?))
    }

    pub async fn labeled_app(&self) -> Result<LabeledApp> {
        Ok(LabeledApp::new(self.label_selector().await?, self.resources.clone()))
    }

    fn tracker(&self) -> RecordedAppChanges { RecordedAppChanges::new(self.record.name.clone(), self.record.store.clone()) }

    /// Create the record, or merge `labels` into the existing one.
    /// A label already set to a different value is rejected and nothing is written.
    pub async fn create_or_update(&self, labels: &BTreeMap<String, String>) -> Result<()> {
        let store = &self.record.store;
        let mut obj = StoredObject::named(self.record.name.clone());
        obj.labels.insert(IS_APP_LABEL_KEY.to_string(), String::new());
        let label_value = Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string();
        obj.data = AppMeta { label_key: APP_LABEL_KEY.to_string(), label_value, ..Default::default() }.as_data()?;
        merge_labels(&mut obj.labels, labels)?;

        match store.create(obj).await {
            Ok(_) => {
                counter!("app_create_total", 1u64);
                info!(app = %self.record.name, ns = %self.record.namespace, "app created");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                // Not atomic: a concurrent writer between get and update surfaces as a conflict
                let mut existing = store.get(&self.record.name).await.map_err(|e| anyhow!("Getting app: {}", e))?;
                merge_labels(&mut existing.labels, labels)?;
                store.update(existing).await.map_err(|e| anyhow!("Updating app: {}", e))?;
                debug!(app = %self.record.name, "app labels merged");
                Ok(())
            }
            Err(e) => Err(anyhow!("Creating app: {}", e)),
        }
    }

    pub async fn exists(&self) -> Result<bool> {
        match self.record.store.get(&self.record.name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(anyhow!("Getting app: {}", e)),
        }
    }

    /// Delete changes, then cluster resources, then the record. Stops at the first failing step.
    pub async fn delete(&self) -> Result<()> {
        let labeled = self.labeled_app().await?;
        self.tracker().delete_all().await.map_err(|e| anyhow!("Deleting app changes: {:#}", e))?;
        labeled.delete().await?;
        self.record.store.delete(&self.record.name).await.map_err(|e| anyhow!("Deleting app: {}", e))?;
        counter!("app_delete_total", 1u64);
        info!(app = %self.record.name, ns = %self.record.namespace, "app deleted");
        Ok(())
    }

    /// Move the record to `new_name`, keeping labels, annotations and data.
    /// If removing the old record fails both records remain. Changes stay under the old name.
    pub async fn rename(&self, new_name: &str) -> Result<()> {
        let old = self.record.fetch().await?;
        let renamed = StoredObject {
            name: new_name.to_string(),
            labels: old.labels,
            annotations: old.annotations,
            data: old.data,
            ..Default::default()
        };
        self.record.store.create(renamed).await.map_err(|e| anyhow!("Creating app: {}", e))?;
        self.record.store.delete(&self.record.name).await.map_err(|e| anyhow!("Deleting app: {}", e))?;
        info!(app = %self.record.name, new_name = %new_name, "app renamed");
        Ok(())
    }

    pub async fn changes(&self) -> Result<Vec<RecordedChange>> { self.tracker().list().await }

    /// Trim change history to `max_to_keep`, oldest first. The change named by the
    /// stored last-change pointer always survives.
    pub async fn gc_changes(&self, max_to_keep: usize) -> Result<usize> {
        let stored = self.record.fetch().await?;
        let meta = self.record.parse(&stored)?;
        self.tracker().gc(max_to_keep, &meta.last_change_name).await
    }

    /// Change referenced by the record's last-change pointer; `None` if none was recorded.
    pub async fn last_change(&self) -> Result<Option<RecordedChange>> {
        let meta = self.meta().await?;
        if meta.last_change_name.is_empty() {
            return Ok(None);
        }
        Ok(Some(RecordedChange::new(meta.last_change_name, self.record.store.clone(), meta.last_change)))
    }

    /// Open a change and point the record at it. If the pointer write fails the new
    /// change is marked failed and the write error is returned.
    pub async fn begin_change(&self, meta: ChangeMeta) -> Result<TrackedChange> {
        let change = self.tracker().begin(meta).await?;
        let mut tracked = TrackedChange { change, app: self.record.clone() };
        if let Err(e) = tracked.sync_on_app().await {
            if let Err(fail_err) = tracked.change.fail().await {
                debug!(change = %tracked.change.name(), error = %fail_err, "marking orphaned change failed");
            }
            return Err(e);
        }
        Ok(tracked)
    }
}

/// Change returned by `begin_change`; finishing it also refreshes the app's last-change pointer.
pub struct TrackedChange {
    change: RecordedChange,
    app: AppRecordRef,
}

impl std::fmt::Debug for TrackedChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedChange").field("change", &self.change).field("app", &self.app.name).finish()
    }
}

impl TrackedChange {
    async fn sync_on_app(&self) -> Result<()> {
        let name = self.change.name().to_string();
        let meta = self.change.meta().clone();
        self.app
            .update(move |app| {
                app.last_change_name = name;
                app.last_change = meta;
            })
            .await
    }

    async fn sync_best_effort(&self) {
        if let Err(e) = self.sync_on_app().await {
            counter!("app_change_sync_failed_total", 1u64);
            warn!(app = %self.app.name, change = %self.change.name(), error = %e, "last change pointer not updated");
        }
    }

    pub fn into_inner(self) -> RecordedChange { self.change }
}

#[async_trait::async_trait]
impl Change for TrackedChange {
    fn name(&self) -> &str { self.change.name() }
    fn meta(&self) -> &ChangeMeta { self.change.meta() }

    async fn fail(&mut self) -> Result<()> {
        self.change.fail().await?;
        self.sync_best_effort().await;
        Ok(())
    }

    async fn succeed(&mut self) -> Result<()> {
        self.change.succeed().await?;
        self.sync_best_effort().await;
        Ok(())
    }

    async fn delete(&self) -> Result<()> { self.change.delete().await }
}
