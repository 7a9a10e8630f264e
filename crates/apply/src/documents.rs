//! Parsing and labelling of deploy documents.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value as Json};

/// Deploy input limits, overridable from the environment.
#[derive(Debug, Clone, Copy)]
struct Limits {
    bytes: usize,
    nodes: usize,
}

impl Limits {
    fn from_env() -> Self {
        let read = |key: &str, fallback: usize| {
            std::env::var(key).ok().and_then(|s| s.trim().parse::<usize>().ok()).unwrap_or(fallback)
        };
        Self { bytes: read("KAPSULE_MAX_YAML_BYTES", 1_000_000), nodes: read("KAPSULE_MAX_YAML_NODES", 100_000) }
    }
}

/// Number of JSON values in `doc`, counting stops once `cap` is reached.
fn count_nodes(doc: &Json, cap: usize) -> usize {
    let mut pending = vec![doc];
    let mut seen = 0usize;
    while let Some(v) = pending.pop() {
        seen += 1;
        if seen >= cap {
            break;
        }
        match v {
            Json::Object(map) => pending.extend(map.values()),
            Json::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
    seen
}

/// Parse a multi-document YAML stream into JSON objects; empty documents are skipped.
pub fn parse_documents(yaml: &str) -> Result<Vec<Json>> {
    let limits = Limits::from_env();
    if yaml.len() > limits.bytes {
        return Err(anyhow!("YAML payload too large (>{} bytes)", limits.bytes));
    }
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", idx))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if count_nodes(&json, limits.nodes) >= limits.nodes {
            return Err(anyhow!("YAML document {} too complex (>{} nodes)", idx, limits.nodes));
        }
        for (pointer, what) in [("/apiVersion", "apiVersion"), ("/kind", "kind"), ("/metadata/name", "metadata.name")] {
            if json.pointer(pointer).and_then(|v| v.as_str()).map_or(true, str::is_empty) {
                return Err(anyhow!("YAML document {} missing {}", idx, what));
            }
        }
        out.push(json);
    }
    Ok(out)
}

fn object_at<'a>(v: &'a mut Json, path: &[&str]) -> Option<&'a mut Map<String, Json>> {
    let mut cur = v;
    for key in path {
        let obj = cur.as_object_mut()?;
        cur = obj.entry(key.to_string()).or_insert_with(|| Json::Object(Map::new()));
    }
    cur.as_object_mut()
}

/// Stamp `key=value` onto the document and onto any pod template it carries, so that
/// controller-created children are selectable with the same label.
pub fn label_document(doc: &mut Json, key: &str, value: &str) {
    if let Some(labels) = object_at(doc, &["metadata", "labels"]) {
        labels.insert(key.to_string(), Json::String(value.to_string()));
    }
    let templates: [&[&str]; 2] = [&["spec", "template"], &["spec", "jobTemplate", "spec", "template"]];
    for path in templates {
        let has_template = doc.pointer(&format!("/{}", path.join("/"))).map_or(false, Json::is_object);
        if !has_template {
            continue;
        }
        let mut full: Vec<&str> = path.to_vec();
        full.extend(["metadata", "labels"]);
        if let Some(labels) = object_at(doc, &full) {
            labels.insert(key.to_string(), Json::String(value.to_string()));
        }
    }
}

/// Namespaces the documents touch, sorted and deduplicated. A document without
/// `metadata.namespace` counts as `default_ns` only if `is_namespaced` says its kind is.
pub fn namespaces(docs: &[Json], default_ns: &str, is_namespaced: impl Fn(&Json) -> bool) -> Vec<String> {
    let mut out: Vec<String> = docs
        .iter()
        .filter_map(|d| match d.pointer("/metadata/namespace").and_then(|v| v.as_str()) {
            Some(ns) => Some(ns.to_string()),
            None if is_namespaced(d) => Some(default_ns.to_string()),
            None => None,
        })
        .collect();
    out.sort();
    out.dedup();
    out
}
