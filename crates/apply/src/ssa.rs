//! Server-side apply of labelled documents.

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use kapsule_core::Resource;
use kapsule_kubehub::ApiResolver;
use kube::api::{Patch, PatchParams};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::debug;

const FIELD_MANAGER: &str = "kapsule";

/// Apply one document (SSA, forced ownership) and return the live object.
/// Namespaced kinds without `metadata.namespace` land in `default_ns`.
pub async fn apply_document(resolver: &ApiResolver, doc: &Json, default_ns: &str) -> Result<Resource> {
    let t0 = Instant::now();
    counter!("apply_attempts", 1u64);
    let api_version = doc.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("document missing apiVersion"))?;
    let kind = doc.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("document missing kind"))?;
    let name = doc
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("document missing metadata.name"))?;
    let ns = doc.pointer("/metadata/namespace").and_then(|v| v.as_str()).unwrap_or(default_ns);

    let api = resolver.dynamic_api(api_version, kind, Some(ns))?;
    let pp = PatchParams::apply(FIELD_MANAGER).force();
    let obj = match api.patch(name, &pp, &Patch::Apply(doc)).await {
        Ok(o) => o,
        Err(e) => {
            counter!("apply_err", 1u64);
            return Err(anyhow!("server-side apply of {} '{}' failed: {}", kind, name, e));
        }
    };
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("apply_ok", 1u64);
    debug!(kind = %kind, name = %name, rv = ?obj.metadata.resource_version, "applied");
    let raw = serde_json::to_value(&obj).context("serializing applied object")?;
    Ok(Resource::new(raw))
}
