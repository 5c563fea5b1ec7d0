//! Tool catalog: the set of active bindings one agent may plan with.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::store::Database;
use crate::tools::binding::ToolBinding;

/// Bindings available to a single planning call, unique by name.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    bindings: BTreeMap<String, ToolBinding>,
}

impl ToolCatalog {
    /// Build a catalog from bindings. Inactive bindings are skipped; on a
    /// name clash the first binding wins.
    pub fn from_bindings(bindings: impl IntoIterator<Item = ToolBinding>) -> Self {
        let mut map = BTreeMap::new();
        for binding in bindings {
            if !binding.active {
                continue;
            }
            if map.contains_key(&binding.name) {
                warn!(
                    tool = %binding.name,
                    binding_id = %binding.id,
                    "Duplicate tool name in catalog, keeping the first binding"
                );
                continue;
            }
            map.insert(binding.name.clone(), binding);
        }
        Self { bindings: map }
    }

    pub fn get(&self, name: &str) -> Option<&ToolBinding> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Tool names in catalog order.
    pub fn names(&self) -> Vec<&str> {
        self.bindings.keys().map(String::as_str).collect()
    }

    /// Bindings in catalog order (sorted by name).
    pub fn iter(&self) -> impl Iterator<Item = &ToolBinding> {
        self.bindings.values()
    }

    /// Serialized catalog for the planner prompt.
    pub fn prompt_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.iter().map(ToolBinding::prompt_entry).collect())
    }
}

/// Assembles per-agent catalogs from the store.
pub struct CatalogAssembler {
    db: Arc<dyn Database>,
}

impl CatalogAssembler {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Active agent→binding associations, then the active bindings they point to.
    pub async fn assemble(&self, agent_id: &str) -> Result<ToolCatalog, DatabaseError> {
        let ids = self.db.active_binding_ids(agent_id).await?;
        if ids.is_empty() {
            debug!(agent_id, "Agent has no active tool associations");
            return Ok(ToolCatalog::default());
        }
        let bindings = self.db.tool_bindings_by_ids(&ids).await?;
        let catalog = ToolCatalog::from_bindings(bindings);
        debug!(agent_id, tools = catalog.len(), "Tool catalog assembled");
        Ok(catalog)
    }
}
