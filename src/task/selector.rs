//! Task selection by engine, category, tier and explicit ids.

use serde::{Deserialize, Serialize};

use super::types::TaskManifest;

/// Filter over task manifests. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSelector {
    pub engines: Vec<String>,
    pub categories: Vec<String>,
    pub tiers: Vec<u8>,
    pub task_ids: Vec<String>,
}

impl TaskSelector {
    /// Creates a selector that matches every task.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to the given engine.
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engines.push(engine.into());
        self
    }

    /// Restricts to the given category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    /// Restricts to the given tier.
    pub fn with_tier(mut self, tier: u8) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Restricts to the given task id.
    pub fn with_task(mut self, id: impl Into<String>) -> Self {
        self.task_ids.push(id.into());
        self
    }

    /// Returns true if the manifest passes every non-empty filter.
    ///
    /// Engine and category comparisons ignore ASCII case.
    pub fn matches(&self, manifest: &TaskManifest) -> bool {
        let engine_ok = self.engines.is_empty()
            || self
                .engines
                .iter()
                .any(|e| e.eq_ignore_ascii_case(&manifest.engine));
        let category_ok = self.categories.is_empty()
            || self
                .categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&manifest.category));
        let tier_ok = self.tiers.is_empty() || self.tiers.contains(&manifest.tier);
        let id_ok = self.task_ids.is_empty() || self.task_ids.contains(&manifest.id);

        engine_ok && category_ok && tier_ok && id_ok
    }
}
