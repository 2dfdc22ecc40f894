use serde::{Deserialize, Serialize};

use crate::model::{SqlType, ValueType};

/// One persisted member of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberMapping {
    pub name: String,
    pub column: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
    /// Declared store type; derived from `ty` by the dialect when absent.
    #[serde(default)]
    pub sql_type: Option<SqlType>,
    #[serde(default)]
    pub primary_key: bool,
    /// Filled in by the store (identity, defaults); never written.
    #[serde(default)]
    pub generated: bool,
}

impl MemberMapping {
    pub fn new(name: impl Into<String>, column: impl Into<String>, ty: ValueType) -> Self {
        Self { name: name.into(), column: column.into(), ty, sql_type: None, primary_key: false, generated: false }
    }

    pub fn key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn with_sql_type(mut self, sql_type: SqlType) -> Self {
        self.sql_type = Some(sql_type);
        self
    }
}

/// Navigation from one entity to another, correlated by key members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipMapping {
    pub name: String,
    pub related_entity: String,
    pub key_members: Vec<String>,
    pub related_key_members: Vec<String>,
    /// At most one related row (many-to-one); otherwise a collection.
    #[serde(default)]
    pub singleton: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMapping {
    pub name: String,
    pub table: String,
    pub members: Vec<MemberMapping>,
    #[serde(default)]
    pub relationships: Vec<RelationshipMapping>,
}

impl EntityMapping {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self { name: name.into(), table: table.into(), members: Vec::new(), relationships: Vec::new() }
    }

    pub fn with_member(mut self, member: MemberMapping) -> Self {
        self.members.push(member);
        self
    }

    pub fn with_relationship(mut self, relationship: RelationshipMapping) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn member(&self, name: &str) -> Option<&MemberMapping> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipMapping> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn primary_key(&self) -> impl Iterator<Item = &MemberMapping> {
        self.members.iter().filter(|m| m.primary_key)
    }

    pub fn value_type(&self) -> ValueType {
        ValueType::Entity(self.name.clone())
    }
}
