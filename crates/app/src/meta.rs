use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use kapsule_core::StoredObject;
use serde::{Deserialize, Serialize};

/// Data key holding the JSON-encoded metadata of app and change records.
pub const META_DATA_KEY: &str = "spec";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeStatus {
    Active,
    Succeeded,
    Failed,
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeStatus::Active => "active",
            ChangeStatus::Succeeded => "succeeded",
            ChangeStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One deploy attempt. `successful` stays unset while the change is active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangeMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

impl ChangeMeta {
    pub fn new(description: impl Into<String>, namespaces: Vec<String>) -> Self {
        Self { description: description.into(), namespaces, ..Default::default() }
    }

    pub fn status(&self) -> ChangeStatus {
        match self.successful {
            None => ChangeStatus::Active,
            Some(true) => ChangeStatus::Succeeded,
            Some(false) => ChangeStatus::Failed,
        }
    }

    /// Copy of `self` marked finished now.
    pub(crate) fn finished(&self, successful: bool) -> Self {
        Self { finished_at: Some(Utc::now()), successful: Some(successful), ..self.clone() }
    }

    pub fn as_data(&self) -> Result<BTreeMap<String, String>> { encode(self) }

    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> { decode(data) }
}

/// Persisted state of an app record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppMeta {
    pub label_key: String,
    pub label_value: String,
    // lastChangeName and lastChange are written together
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_change_name: String,
    pub last_change: ChangeMeta,
}

impl AppMeta {
    /// Identity label of the app's resources.
    pub fn labels(&self) -> Result<BTreeMap<String, String>> {
        if self.label_key.is_empty() {
            return Err(anyhow!("Expected app label key to be non-empty"));
        }
        if self.label_value.is_empty() {
            return Err(anyhow!("Expected app label value to be non-empty"));
        }
        let mut out = BTreeMap::new();
        out.insert(self.label_key.clone(), self.label_value.clone());
        Ok(out)
    }

    pub fn as_data(&self) -> Result<BTreeMap<String, String>> { encode(self) }

    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> { decode(data) }
}

/// Parse the metadata of app record `obj`, backing app `app` in `namespace`.
pub(crate) fn parse_app_meta(app: &str, namespace: &str, obj: &StoredObject) -> Result<AppMeta> {
    AppMeta::from_data(&obj.data).map_err(|e| {
        anyhow!(
            "App '{}' (namespace: {}) backed by ConfigMap '{}' did not contain parseable app metadata: {:#} \
             (hint: ConfigMap was overriden by another user?)",
            app,
            namespace,
            obj.name,
            e
        )
    })
}

fn encode<T: Serialize>(v: &T) -> Result<BTreeMap<String, String>> {
    let raw = serde_json::to_string(v).context("encoding metadata")?;
    let mut data = BTreeMap::new();
    data.insert(META_DATA_KEY.to_string(), raw);
    Ok(data)
}

fn decode<T: for<'de> Deserialize<'de>>(data: &BTreeMap<String, String>) -> Result<T> {
    let raw = data.get(META_DATA_KEY).ok_or_else(|| anyhow!("missing data key '{}'", META_DATA_KEY))?;
    serde_json::from_str(raw).with_context(|| format!("parsing data key '{}'", META_DATA_KEY))
}
