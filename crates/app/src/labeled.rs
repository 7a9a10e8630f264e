use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use kapsule_core::{IdentifiedResources, LabelSelector, Resource};
use tracing::info;

/// Cluster resources of an app, found by its identity label.
#[derive(Clone)]
pub struct LabeledApp {
    selector: LabelSelector,
    resources: Arc<dyn IdentifiedResources>,
}

impl LabeledApp {
    pub fn new(selector: LabelSelector, resources: Arc<dyn IdentifiedResources>) -> Self {
        Self { selector, resources }
    }

    pub fn label_selector(&self) -> &LabelSelector { &self.selector }

    pub async fn resources(&self) -> Result<Vec<Resource>> {
        self.resources.list(&self.selector).await.map_err(|e| anyhow!("Listing app resources: {:#}", e))
    }

    /// Delete the app's top-level resources. Resources owned by another app resource
    /// are left to garbage collection.
    pub async fn delete(&self) -> Result<()> {
        let all = self.resources().await?;
        let uids: HashSet<&str> = all.iter().filter_map(|r| r.uid()).collect();
        let roots: Vec<&Resource> =
            all.iter().filter(|r| !r.owner_uids().iter().any(|u| uids.contains(u))).collect();
        for res in &roots {
            self.resources
                .delete(res)
                .await
                .map_err(|e| anyhow!("Deleting app resource '{}': {:#}", res.description(), e))?;
        }
        info!(selector = %self.selector, deleted = roots.len(), "app resources deleted");
        Ok(())
    }
}
