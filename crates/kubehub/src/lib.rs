//! Kapsule kubehub: kube client, discovery, and the cluster-backed store seams.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{verbs, ApiCapabilities, Discovery, Scope},
    Client,
};
use kapsule_core::{IdentifiedResources, LabelSelector, ObjectStore, Resource, StoreError, StoreResult, StoredObject};
use metrics::{counter, histogram};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared kube client built from the default kubeconfig/in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client") })
        .await?;
    Ok(client.clone())
}

fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

// Noisy kinds with no bearing on an app's health
const SKIPPED_KINDS: &[&str] = &["Event", "ComponentStatus"];

/// Discovery snapshot used to build dynamic APIs by apiVersion/kind.
pub struct ApiResolver {
    client: Client,
    discovery: Discovery,
}

impl ApiResolver {
    pub async fn new(client: Client) -> Result<Self> {
        let t0 = Instant::now();
        let discovery = Discovery::new(client.clone()).run().await.context("running API discovery")?;
        histogram!("discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(groups = discovery.groups().count(), took_ms = %t0.elapsed().as_millis(), "discovery done");
        Ok(Self { client, discovery })
    }

    pub fn client(&self) -> Client { self.client.clone() }

    pub fn resolve(&self, api_version: &str, kind: &str) -> Result<(ApiResource, ApiCapabilities)> {
        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind { group, version, kind: kind.to_string() };
        self.discovery
            .resolve_gvk(&gvk)
            .ok_or_else(|| anyhow!("GVK not found: {}/{}", api_version, kind))
    }

    pub fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool> {
        Ok(matches!(self.resolve(api_version, kind)?.1.scope, Scope::Namespaced))
    }

    /// Dynamic API for a kind; `ns` is ignored for cluster-scoped kinds.
    pub fn dynamic_api(&self, api_version: &str, kind: &str, ns: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, caps) = self.resolve(api_version, kind)?;
        let api = match (caps.scope, ns) {
            (Scope::Namespaced, Some(n)) => Api::namespaced_with(self.client.clone(), n, &ar),
            (Scope::Namespaced, None) => return Err(anyhow!("namespace required for namespaced kind {}", kind)),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &ar),
        };
        Ok(api)
    }

    /// Preferred version of every kind that can be listed and deleted.
    fn listable(&self) -> Vec<ApiResource> {
        let mut out = Vec::new();
        for group in self.discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if SKIPPED_KINDS.contains(&ar.kind.as_str()) {
                    continue;
                }
                if caps.supports_operation(verbs::LIST) && caps.supports_operation(verbs::DELETE) {
                    out.push(ar);
                }
            }
        }
        out
    }
}

fn to_resource(mut obj: DynamicObject, ar: &ApiResource) -> Result<Resource> {
    // list items come back without apiVersion/kind
    obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    let mut raw = serde_json::to_value(&obj).context("serializing DynamicObject")?;
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    Ok(Resource::new(raw))
}

/// App resources across every listable kind and namespace.
pub struct ClusterResources {
    resolver: Arc<ApiResolver>,
}

impl ClusterResources {
    pub fn new(resolver: Arc<ApiResolver>) -> Self { Self { resolver } }
}

#[async_trait::async_trait]
impl IdentifiedResources for ClusterResources {
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<Resource>> {
        let t0 = Instant::now();
        let lp = ListParams::default().labels(&selector.to_string());
        let kinds = self.resolver.listable();
        let client = self.resolver.client();
        let lists = join_all(kinds.iter().map(|ar| {
            let api: Api<DynamicObject> = Api::all_with(client.clone(), ar);
            let lp = lp.clone();
            async move { (ar, api.list(&lp).await) }
        }))
        .await;

        let mut out = Vec::new();
        for (ar, res) in lists {
            match res {
                Ok(list) => {
                    for obj in list.items {
                        out.push(to_resource(obj, ar)?);
                    }
                }
                // Typically RBAC-forbidden kinds; the rest of the app is still worth reporting
                Err(e) => warn!(kind = %ar.kind, group = %ar.group, error = %e, "listing kind failed; skipping"),
            }
        }
        out.sort_by_key(|r| r.key());
        histogram!("cluster_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(selector = %selector, count = out.len(), took_ms = %t0.elapsed().as_millis(), "listed app resources");
        Ok(out)
    }

    async fn refresh(&self, res: &Resource) -> Result<Option<Resource>> {
        let (ar, _) = self.resolver.resolve(res.api_version(), res.kind())?;
        let api = self.resolver.dynamic_api(res.api_version(), res.kind(), res.namespace())?;
        match api.get_opt(res.name()).await? {
            Some(obj) => Ok(Some(to_resource(obj, &ar)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, res: &Resource) -> Result<()> {
        let api = self.resolver.dynamic_api(res.api_version(), res.kind(), res.namespace())?;
        match api.delete(res.name(), &DeleteParams::background()).await {
            Ok(_) => {
                counter!("cluster_delete_total", 1u64);
                info!(res = %res.description(), "deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(anyhow!("deleting {}: {}", res.description(), e)),
        }
    }
}

fn map_kube_err(e: kube::Error, name: &str) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(name.to_string()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(name.to_string())
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(name.to_string()),
        other => StoreError::Transport(other.to_string()),
    }
}

fn to_config_map(obj: StoredObject, ns: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: if obj.name.is_empty() { None } else { Some(obj.name) },
            generate_name: obj.generate_name,
            namespace: Some(ns.to_string()),
            labels: Some(obj.labels),
            annotations: if obj.annotations.is_empty() { None } else { Some(obj.annotations) },
            resource_version: obj.resource_version,
            ..Default::default()
        },
        data: Some(obj.data),
        ..Default::default()
    }
}

fn from_config_map(cm: ConfigMap) -> StoredObject {
    StoredObject {
        name: cm.metadata.name.unwrap_or_default(),
        generate_name: cm.metadata.generate_name,
        labels: cm.metadata.labels.unwrap_or_default(),
        annotations: cm.metadata.annotations.unwrap_or_default(),
        data: cm.data.unwrap_or_default(),
        resource_version: cm.metadata.resource_version,
    }
}

/// `ObjectStore` over ConfigMaps in one namespace; `replace` enforces `resourceVersion`.
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    namespace: String,
}

impl ConfigMapStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), namespace: namespace.to_string() }
    }
}

#[async_trait::async_trait]
impl ObjectStore for ConfigMapStore {
    async fn create(&self, obj: StoredObject) -> StoreResult<StoredObject> {
        let name = if obj.name.is_empty() { obj.generate_name.clone().unwrap_or_default() } else { obj.name.clone() };
        let cm = to_config_map(obj, &self.namespace);
        let created = self.api.create(&PostParams::default(), &cm).await.map_err(|e| map_kube_err(e, &name))?;
        Ok(from_config_map(created))
    }

    async fn get(&self, name: &str) -> StoreResult<StoredObject> {
        let cm = self.api.get(name).await.map_err(|e| map_kube_err(e, name))?;
        Ok(from_config_map(cm))
    }

    async fn update(&self, obj: StoredObject) -> StoreResult<StoredObject> {
        let name = obj.name.clone();
        let cm = to_config_map(obj, &self.namespace);
        let updated = self.api.replace(&name, &PostParams::default(), &cm).await.map_err(|e| map_kube_err(e, &name))?;
        Ok(from_config_map(updated))
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        self.api.delete(name, &DeleteParams::default()).await.map_err(|e| map_kube_err(e, name))?;
        Ok(())
    }

    async fn list(&self, selector: &LabelSelector) -> StoreResult<Vec<StoredObject>> {
        let lp = if selector.is_empty() { ListParams::default() } else { ListParams::default().labels(&selector.to_string()) };
        let list = self.api.list(&lp).await.map_err(|e| map_kube_err(e, &self.namespace))?;
        let mut out: Vec<StoredObject> = list.items.into_iter().map(from_config_map).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}
