use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use kapsule_core::{IdentifiedResources, LabelSelector, ObjectStore};
use tracing::debug;

use crate::meta::parse_app_meta;
use crate::recorded::RecordedApp;
use crate::IS_APP_LABEL_KEY;

/// All app records of one namespace.
pub struct RecordedApps {
    namespace: String,
    store: Arc<dyn ObjectStore>,
    resources: Arc<dyn IdentifiedResources>,
}

impl RecordedApps {
    pub fn new(namespace: impl Into<String>, store: Arc<dyn ObjectStore>, resources: Arc<dyn IdentifiedResources>) -> Self {
        Self { namespace: namespace.into(), store, resources }
    }

    pub fn find(&self, name: &str) -> RecordedApp {
        RecordedApp::new(name, self.namespace.clone(), self.store.clone(), self.resources.clone())
    }

    /// Apps whose records carry all of `labels`, sorted by name, each with metadata pre-loaded.
    pub async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<RecordedApp>> {
        let mut terms = labels.clone();
        terms.insert(IS_APP_LABEL_KEY.to_string(), String::new());
        let objs = self.store.list(&LabelSelector::from_pairs(terms)).await.map_err(|e| anyhow!("Listing apps: {}", e))?;

        let mut out = Vec::with_capacity(objs.len());
        for obj in objs {
            let meta = parse_app_meta(&obj.name, &self.namespace, &obj)?;
            out.push(self.find(&obj.name).with_meta(meta));
        }
        out.sort_by(|a, b| a.name().cmp(b.name()));
        debug!(ns = %self.namespace, count = out.len(), "apps listed");
        Ok(out)
    }
}
