//! Kapsule core types: resources, label selectors, apply states and the store seams.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A cluster resource held as raw JSON (as returned by the API server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource {
    raw: Json,
}

impl Resource {
    pub fn new(raw: Json) -> Self { Self { raw } }

    pub fn raw(&self) -> &Json { &self.raw }
    pub fn into_raw(self) -> Json { self.raw }

    fn str_at(&self, pointer: &str) -> Option<&str> {
        self.raw.pointer(pointer).and_then(|v| v.as_str())
    }

    pub fn pointer(&self, pointer: &str) -> Option<&Json> { self.raw.pointer(pointer) }

    pub fn api_version(&self) -> &str { self.str_at("/apiVersion").unwrap_or("") }

    /// API group of the resource; empty for the core group.
    pub fn api_group(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    pub fn kind(&self) -> &str { self.str_at("/kind").unwrap_or("") }
    pub fn name(&self) -> &str { self.str_at("/metadata/name").unwrap_or("") }

    pub fn namespace(&self) -> Option<&str> {
        self.str_at("/metadata/namespace").filter(|ns| !ns.is_empty())
    }

    pub fn uid(&self) -> Option<&str> { self.str_at("/metadata/uid") }

    pub fn generation(&self) -> i64 {
        self.raw.pointer("/metadata/generation").and_then(|v| v.as_i64()).unwrap_or(0)
    }

    pub fn labels(&self) -> BTreeMap<String, String> { string_map(self.raw.pointer("/metadata/labels")) }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        string_map(self.raw.pointer("/metadata/annotations"))
    }

    pub fn is_deleting(&self) -> bool {
        matches!(self.raw.pointer("/metadata/deletionTimestamp"), Some(v) if !v.is_null())
    }

    /// UIDs listed in `metadata.ownerReferences`.
    pub fn owner_uids(&self) -> Vec<&str> {
        self.raw
            .pointer("/metadata/ownerReferences")
            .and_then(|v| v.as_array())
            .map(|refs| refs.iter().filter_map(|r| r.get("uid").and_then(|u| u.as_str())).collect())
            .unwrap_or_default()
    }

    pub fn status(&self) -> Option<&Json> { self.raw.get("status") }

    /// Human description, e.g. `deployment/web (apps/v1) namespace: prod`.
    pub fn description(&self) -> String {
        let mut out = format!("{}/{} ({})", self.kind().to_lowercase(), self.name(), self.api_version());
        match self.namespace() {
            Some(ns) => {
                out.push_str(" namespace: ");
                out.push_str(ns);
            }
            None => out.push_str(" cluster"),
        }
        out
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            namespace: self.namespace().unwrap_or("").to_string(),
            kind: self.kind().to_string(),
            name: self.name().to_string(),
        }
    }
}

fn string_map(v: Option<&Json>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(Json::Object(map)) = v {
        for (k, v) in map {
            let s = match v {
                Json::String(s) => s.clone(),
                Json::Null => String::new(),
                other => other.to_string(),
            };
            out.insert(k.clone(), s);
        }
    }
    out
}

/// Stable identity of a resource within a cluster: kind + namespace + name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// Equality-based label selector (`k1=v1,k2=v2`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    terms: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self { terms: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }

    pub fn is_empty(&self) -> bool { self.terms.is_empty() }
    pub fn terms(&self) -> &BTreeMap<String, String> { &self.terms }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.terms {
            if !first { f.write_str(",")?; }
            first = false;
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

impl FromStr for LabelSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut terms = BTreeMap::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| format!("invalid label selector term: {} (expect key=value)", part))?;
            let k = k.trim();
            if k.is_empty() { return Err(format!("invalid label selector term: {} (empty key)", part)); }
            terms.insert(k.to_string(), v.trim().to_string());
        }
        Ok(Self { terms })
    }
}

/// Readiness verdict for a single resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneApplyState {
    pub done: bool,
    pub successful: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl DoneApplyState {
    pub fn ok() -> Self { Self { done: true, successful: true, message: String::new() } }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { done: true, successful: false, message: message.into() }
    }

    pub fn pending(message: impl Into<String>) -> Self {
        Self { done: false, successful: false, message: message.into() }
    }

    pub fn terminally_failed(&self) -> bool { self.done && !self.successful }
}

/// Record held by the object store (shaped like a ConfigMap).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub name: String,
    /// Server-side name prefix used when `name` is empty on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Opaque version for optimistic concurrency; `None` skips the check on update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl StoredObject {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_generate_name(prefix: impl Into<String>) -> Self {
        Self { generate_name: Some(prefix.into()), ..Default::default() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("conflict writing {0}: object has been modified")]
    Conflict(String),
    #[error("{0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists(_)) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Namespace-scoped key/value object store with optimistic concurrency.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create `obj`; returns the stored copy (with final name and version).
    async fn create(&self, obj: StoredObject) -> StoreResult<StoredObject>;
    async fn get(&self, name: &str) -> StoreResult<StoredObject>;
    /// Replace `obj`; must fail with `Conflict` when its version is stale.
    async fn update(&self, obj: StoredObject) -> StoreResult<StoredObject>;
    async fn delete(&self, name: &str) -> StoreResult<()>;
    async fn list(&self, selector: &LabelSelector) -> StoreResult<Vec<StoredObject>>;
}

/// Cluster resources addressed by label selector.
#[async_trait::async_trait]
pub trait IdentifiedResources: Send + Sync {
    async fn list(&self, selector: &LabelSelector) -> anyhow::Result<Vec<Resource>>;
    /// Re-read `res` from the cluster; `None` once it is gone.
    async fn refresh(&self, res: &Resource) -> anyhow::Result<Option<Resource>>;
    async fn delete(&self, resource: &Resource) -> anyhow::Result<()>;
}

pub mod prelude {
    pub use super::{
        DoneApplyState, IdentifiedResources, LabelSelector, ObjectStore, Resource, ResourceKey, StoreError,
        StoreResult, StoredObject,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn description_includes_scope() {
        let r = Resource::new(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod" }
        }));
        assert_eq!(r.description(), "deployment/web (apps/v1) namespace: prod");
        assert_eq!(r.api_group(), "apps");

        let c = Resource::new(json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "prod" } }));
        assert_eq!(c.description(), "namespace/prod (v1) cluster");
        assert_eq!(c.api_group(), "");
    }

    #[test]
    fn key_ignores_api_version() {
        let a = Resource::new(json!({ "apiVersion": "batch/v1", "kind": "CronJob", "metadata": { "name": "x", "namespace": "a" } }));
        let b = Resource::new(json!({ "apiVersion": "batch/v1beta1", "kind": "CronJob", "metadata": { "name": "x", "namespace": "a" } }));
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().to_string(), "a/CronJob/x");
    }

    #[test]
    fn deleting_requires_non_null_timestamp() {
        let live = Resource::new(json!({ "metadata": { "deletionTimestamp": null } }));
        assert!(!live.is_deleting());
        let gone = Resource::new(json!({ "metadata": { "deletionTimestamp": "2024-01-01T00:00:00Z" } }));
        assert!(gone.is_deleting());
    }

    #[test]
    fn selector_parse_display_and_match() {
        let sel: LabelSelector = "b=2, a=1".parse().unwrap();
        assert_eq!(sel.to_string(), "a=1,b=2");
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        assert!(!sel.matches(&labels));
        labels.insert("b".to_string(), "2".to_string());
        assert!(sel.matches(&labels));
        assert!("novalue".parse::<LabelSelector>().is_err());
        let empty_val: LabelSelector = "kapsule.dev/is-app=".parse().unwrap();
        assert_eq!(empty_val.terms().get("kapsule.dev/is-app").map(String::as_str), Some(""));
    }

    #[test]
    fn terminally_failed_needs_done() {
        assert!(DoneApplyState::failed("x").terminally_failed());
        assert!(!DoneApplyState::pending("x").terminally_failed());
        assert!(!DoneApplyState::ok().terminally_failed());
    }
}
