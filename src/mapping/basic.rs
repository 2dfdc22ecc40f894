use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PlanError, PlanResult};
use crate::mapping::{EntityMapping, Mapping, QueryPolicy};

/// A [`Mapping`] held entirely in memory, buildable in code or loaded from
/// JSON:
///
/// ```json
/// { "entities": [ { "name": "Order", "table": "orders", "members": [
///     { "name": "Id", "column": "id", "type": "int", "primary_key": true } ] } ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicMapping {
    pub entities: Vec<EntityMapping>,
    #[serde(default)]
    pub policy: QueryPolicy,
}

impl BasicMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: EntityMapping) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn with_policy(mut self, policy: QueryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn from_json_str(json: &str) -> PlanResult<Self> {
        let mapping: BasicMapping = serde_json::from_str(json)?;
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn from_file(path: impl AsRef<Path>) -> PlanResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading mapping");
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Relationship targets and key members must resolve.
    pub fn validate(&self) -> PlanResult<()> {
        for entity in &self.entities {
            for rel in &entity.relationships {
                let related = self.entity(&rel.related_entity).ok_or_else(|| {
                    PlanError::Config(format!("{}.{} targets unknown entity {}", entity.name, rel.name, rel.related_entity))
                })?;
                if rel.key_members.len() != rel.related_key_members.len() || rel.key_members.is_empty() {
                    return Err(PlanError::Config(format!("{}.{} has mismatched key members", entity.name, rel.name)));
                }
                let missing = rel
                    .key_members
                    .iter()
                    .find(|m| entity.member(m).is_none())
                    .or_else(|| rel.related_key_members.iter().find(|m| related.member(m).is_none()));
                if let Some(member) = missing {
                    return Err(PlanError::Config(format!("{}.{} uses unknown key member {member}", entity.name, rel.name)));
                }
            }
        }
        Ok(())
    }
}

impl Mapping for BasicMapping {
    fn entity(&self, name: &str) -> Option<&EntityMapping> {
        self.entities.iter().find(|e| e.name == name)
    }

    fn policy(&self) -> &QueryPolicy {
        &self.policy
    }
}
