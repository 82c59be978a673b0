//! Built-in catalog entity types.
//!
//! Each type is registered with the entity type registry at boot and owns a
//! `<Name>History` table created by migrations.

use crate::model::entity::{CatalogEntity, EntityId};
use serde::{Deserialize, Serialize};

/// Manufacturing or processing step a component goes through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    #[serde(default)]
    pub id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Part of a product, optionally produced by one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    #[serde(default)]
    pub id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub process_id: Option<EntityId>,
}

/// Finished catalog product assembled from components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(default)]
    pub id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub component_ids: Vec<EntityId>,
}

impl CatalogEntity for Process {
    const ENTITY_NAME: &'static str = "Process";

    fn entity_id(&self) -> Option<EntityId> {
        self.id
    }

    fn validate(&self) -> Result<(), String> {
        validate_name(&self.name)
    }
}

impl CatalogEntity for Component {
    const ENTITY_NAME: &'static str = "Component";

    fn entity_id(&self) -> Option<EntityId> {
        self.id
    }

    fn validate(&self) -> Result<(), String> {
        validate_name(&self.name)
    }
}

impl CatalogEntity for Product {
    const ENTITY_NAME: &'static str = "Product";

    fn entity_id(&self) -> Option<EntityId> {
        self.id
    }

    fn validate(&self) -> Result<(), String> {
        validate_name(&self.name)?;
        let mut seen = std::collections::BTreeSet::new();
        if let Some(duplicate) = self.component_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(format!("component {duplicate} listed more than once"));
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("name must not be blank".to_string());
    }
    Ok(())
}
