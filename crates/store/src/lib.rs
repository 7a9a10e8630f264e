//! Kapsule in-RAM store: `ObjectStore` and `IdentifiedResources` held in process memory.
//! Used by tests and local dry runs; mirrors API server semantics that the app layer relies on
//! (generated names, resource versions, not-found/already-exists/conflict errors).

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use kapsule_core::{
    IdentifiedResources, LabelSelector, ObjectStore, Resource, ResourceKey, StoreError, StoreResult, StoredObject,
};
use rustc_hash::FxHashMap;
use tracing::debug;
use uuid::Uuid;

/// Store operation, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Create,
    Get,
    Update,
    Delete,
    List,
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    name: Option<String>,
}

fn take_fault(faults: &mut Vec<Fault>, op: StoreOp, name: &str) -> Option<StoreError> {
    let idx = faults
        .iter()
        .position(|f| f.op == op && f.name.as_deref().map_or(true, |n| n == name))?;
    faults.remove(idx);
    Some(StoreError::Transport(format!("injected {:?} failure for '{}'", op, name)))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct MemInner {
    objects: FxHashMap<String, StoredObject>,
    next_version: u64,
    faults: Vec<Fault>,
}

/// In-memory `ObjectStore` with optimistic concurrency on `resource_version`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemInner>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Make the next `op` against `name` (or any name when `None`) fail with a transport error.
    pub fn fail_on(&self, op: StoreOp, name: Option<&str>) {
        lock(&self.inner).faults.push(Fault { op, name: name.map(|s| s.to_string()) });
    }

    pub fn len(&self) -> usize { lock(&self.inner).objects.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner).objects.keys().cloned().collect();
        names.sort();
        names
    }

    /// Direct read bypassing fault injection.
    pub fn peek(&self, name: &str) -> Option<StoredObject> { lock(&self.inner).objects.get(name).cloned() }
}

impl MemInner {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn generated_name(&self, prefix: &str) -> String {
        loop {
            let suffix = Uuid::new_v4().simple().to_string();
            let candidate = format!("{}{}", prefix, &suffix[..5]);
            if !self.objects.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn create(&self, mut obj: StoredObject) -> StoreResult<StoredObject> {
        let mut inner = lock(&self.inner);
        let target = if obj.name.is_empty() { obj.generate_name.clone().unwrap_or_default() } else { obj.name.clone() };
        if let Some(err) = take_fault(&mut inner.faults, StoreOp::Create, &target) {
            return Err(err);
        }
        if obj.name.is_empty() {
            let prefix = obj
                .generate_name
                .clone()
                .ok_or_else(|| StoreError::Transport("name or generate_name is required".into()))?;
            obj.name = inner.generated_name(&prefix);
        }
        if inner.objects.contains_key(&obj.name) {
            return Err(StoreError::AlreadyExists(obj.name));
        }
        obj.resource_version = Some(inner.bump());
        debug!(name = %obj.name, "mem store: create");
        inner.objects.insert(obj.name.clone(), obj.clone());
        Ok(obj)
    }

    async fn get(&self, name: &str) -> StoreResult<StoredObject> {
        let mut inner = lock(&self.inner);
        if let Some(err) = take_fault(&mut inner.faults, StoreOp::Get, name) {
            return Err(err);
        }
        inner.objects.get(name).cloned().ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn update(&self, mut obj: StoredObject) -> StoreResult<StoredObject> {
        let mut inner = lock(&self.inner);
        if let Some(err) = take_fault(&mut inner.faults, StoreOp::Update, &obj.name) {
            return Err(err);
        }
        let current = inner.objects.get(&obj.name).ok_or_else(|| StoreError::NotFound(obj.name.clone()))?;
        if let Some(rv) = &obj.resource_version {
            if current.resource_version.as_ref() != Some(rv) {
                return Err(StoreError::Conflict(obj.name));
            }
        }
        obj.resource_version = Some(inner.bump());
        debug!(name = %obj.name, rv = ?obj.resource_version, "mem store: update");
        inner.objects.insert(obj.name.clone(), obj.clone());
        Ok(obj)
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        let mut inner = lock(&self.inner);
        if let Some(err) = take_fault(&mut inner.faults, StoreOp::Delete, name) {
            return Err(err);
        }
        match inner.objects.remove(name) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    async fn list(&self, selector: &LabelSelector) -> StoreResult<Vec<StoredObject>> {
        let mut inner = lock(&self.inner);
        if let Some(err) = take_fault(&mut inner.faults, StoreOp::List, "") {
            return Err(err);
        }
        let mut out: Vec<StoredObject> =
            inner.objects.values().filter(|o| selector.matches(&o.labels)).cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

#[derive(Default)]
struct ResInner {
    items: FxHashMap<ResourceKey, Resource>,
    faults: Vec<Fault>,
}

/// In-memory cluster resources keyed by `ResourceKey`.
#[derive(Default)]
pub struct MemoryResources {
    inner: Mutex<ResInner>,
}

impl MemoryResources {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, res: Resource) { lock(&self.inner).items.insert(res.key(), res); }

    pub fn len(&self) -> usize { lock(&self.inner).items.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Make the next `op` against a resource named `name` (any when `None`) fail.
    /// Only `List`, `Get` and `Delete` are consulted.
    pub fn fail_on(&self, op: StoreOp, name: Option<&str>) {
        lock(&self.inner).faults.push(Fault { op, name: name.map(|s| s.to_string()) });
    }
}

#[async_trait::async_trait]
impl IdentifiedResources for MemoryResources {
    async fn list(&self, selector: &LabelSelector) -> anyhow::Result<Vec<Resource>> {
        let mut inner = lock(&self.inner);
        if let Some(err) = take_fault(&mut inner.faults, StoreOp::List, "") {
            return Err(anyhow!(err));
        }
        let mut out: Vec<Resource> = inner.items.values().filter(|r| selector.matches(&r.labels())).cloned().collect();
        out.sort_by_key(|r| r.key());
        Ok(out)
    }

    async fn refresh(&self, res: &Resource) -> anyhow::Result<Option<Resource>> {
        let mut inner = lock(&self.inner);
        if let Some(err) = take_fault(&mut inner.faults, StoreOp::Get, res.name()) {
            return Err(anyhow!(err));
        }
        Ok(inner.items.get(&res.key()).cloned())
    }

    async fn delete(&self, resource: &Resource) -> anyhow::Result<()> {
        let mut inner = lock(&self.inner);
        if let Some(err) = take_fault(&mut inner.faults, StoreOp::Delete, resource.name()) {
            return Err(anyhow!(err));
        }
        inner.items.remove(&resource.key());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_name_yields_unique_prefixed_names() {
        let s = MemoryStore::new();
        let a = s.create(StoredObject::with_generate_name("app-change-")).await.unwrap();
        let b = s.create(StoredObject::with_generate_name("app-change-")).await.unwrap();
        assert!(a.name.starts_with("app-change-"));
        assert_eq!(a.name.len(), "app-change-".len() + 5);
        assert_ne!(a.name, b.name);
    }

    #[tokio::test]
    async fn create_twice_reports_already_exists() {
        let s = MemoryStore::new();
        s.create(StoredObject::named("x")).await.unwrap();
        let err = s.create(StoredObject::named("x")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let s = MemoryStore::new();
        let first = s.create(StoredObject::named("x")).await.unwrap();
        let mut a = first.clone();
        a.data.insert("k".into(), "1".into());
        s.update(a).await.unwrap();

        let mut stale = first;
        stale.data.insert("k".into(), "2".into());
        assert!(matches!(s.update(stale).await, Err(StoreError::Conflict(_))));
        assert_eq!(s.peek("x").unwrap().data.get("k").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let s = MemoryStore::new();
        s.create(StoredObject::named("x")).await.unwrap();
        s.fail_on(StoreOp::Get, Some("x"));
        assert!(matches!(s.get("x").await, Err(StoreError::Transport(_))));
        assert!(s.get("x").await.is_ok());
    }

    #[tokio::test]
    async fn list_filters_by_labels() {
        let s = MemoryStore::new();
        let mut a = StoredObject::named("a");
        a.labels.insert("kind".into(), "app".into());
        s.create(a).await.unwrap();
        s.create(StoredObject::named("b")).await.unwrap();
        let sel = LabelSelector::from_pairs([("kind", "app")]);
        let got = s.list(&sel).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "a");
    }
}
