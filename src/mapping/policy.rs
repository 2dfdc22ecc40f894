use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRef {
    pub entity: String,
    pub member: String,
}

/// Loading rules applied on top of the mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPolicy {
    /// Relationship members loaded lazily; they are never folded into the
    /// parent query as a join.
    #[serde(default)]
    pub deferred: Vec<MemberRef>,
}

impl QueryPolicy {
    pub fn defer(mut self, entity: impl Into<String>, member: impl Into<String>) -> Self {
        self.deferred.push(MemberRef { entity: entity.into(), member: member.into() });
        self
    }

    pub fn is_deferred(&self, entity: &str, member: &str) -> bool {
        self.deferred.iter().any(|m| m.entity == entity && m.member == member)
    }
}
