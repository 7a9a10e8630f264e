#![forbid(unsafe_code)]

use std::sync::Arc;

use kapsule_core::{IdentifiedResources, LabelSelector, ObjectStore, Resource, StoreError, StoredObject};
use kapsule_store::{MemoryResources, MemoryStore, StoreOp};

fn record(name: &str) -> StoredObject {
    let mut o = StoredObject::named(name);
    o.labels.insert("kapsule.dev/is-app".into(), String::new());
    o
}

#[tokio::test]
async fn racing_writers_one_wins() {
    let store = Arc::new(MemoryStore::new());
    let base = store.create(record("web")).await.unwrap();

    // Two readers holding the same version; only the first write lands
    let mut a = base.clone();
    a.data.insert("writer".into(), "a".into());
    let mut b = base;
    b.data.insert("writer".into(), "b".into());

    let (ra, rb) = tokio::join!(store.update(a), store.update(b));
    let wins = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(wins, 1);
    assert!(matches!(ra.err().or(rb.err()), Some(StoreError::Conflict(_))));
}

#[tokio::test]
async fn unversioned_update_always_lands() {
    let store = MemoryStore::new();
    store.create(record("web")).await.unwrap();
    let mut blind = record("web");
    blind.data.insert("k".into(), "v".into());
    let written = store.update(blind).await.unwrap();
    assert!(written.resource_version.is_some());
    assert!(store.update(record("missing")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn versions_increase_across_writes() {
    let store = MemoryStore::new();
    let v1 = store.create(record("a")).await.unwrap().resource_version.unwrap();
    let v2 = store.update(store.get("a").await.unwrap()).await.unwrap().resource_version.unwrap();
    assert!(v2.parse::<u64>().unwrap() > v1.parse::<u64>().unwrap());
}

#[tokio::test]
async fn resources_refresh_and_delete() {
    let res = MemoryResources::new();
    let pod = Resource::new(serde_json::json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": { "name": "p", "namespace": "ns", "labels": { "app": "x" } }
    }));
    res.insert(pod.clone());
    assert_eq!(res.refresh(&pod).await.unwrap(), Some(pod.clone()));
    assert_eq!(res.list(&LabelSelector::from_pairs([("app", "x")])).await.unwrap().len(), 1);
    assert!(res.list(&LabelSelector::from_pairs([("app", "y")])).await.unwrap().is_empty());

    res.fail_on(StoreOp::Delete, Some("p"));
    assert!(res.delete(&pod).await.is_err());
    res.delete(&pod).await.unwrap();
    assert_eq!(res.refresh(&pod).await.unwrap(), None);
}
