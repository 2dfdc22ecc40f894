use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dialect::{LimitSyntax, PagingStrategy, ProjectionAffinity, QueryLanguage};
use crate::error::{PlanError, PlanResult};
use crate::passes::PassKind;

fn default_parameter_prefix() -> String {
    "@".to_string()
}

/// Serializable description of a target dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialectConfig {
    pub name: String,
    #[serde(default)]
    pub paging: PagingStrategy,
    #[serde(default)]
    pub limit_syntax: LimitSyntax,
    #[serde(default)]
    pub projection_affinity: ProjectionAffinity,
    #[serde(default)]
    pub allows_subquery_in_select_without_from: bool,
    #[serde(default = "default_parameter_prefix")]
    pub parameter_prefix: String,
    /// Re-checks column aliases after every pass.
    #[serde(default)]
    pub validate_aliases: bool,
    pub passes: Vec<PassKind>,
}

impl DialectConfig {
    fn front_passes() -> Vec<PassKind> {
        vec![
            PassKind::AggregateRewriter,
            PassKind::Cleanup,
            PassKind::RelationshipBinder,
            PassKind::Cleanup,
            PassKind::ComparisonRewriter,
            PassKind::SingletonProjection,
            PassKind::ClientJoinedProjection,
        ]
    }

    /// `LIMIT`/`OFFSET` paging, `CROSS APPLY` available.
    pub fn ansi() -> Self {
        let mut passes = Self::front_passes();
        passes.extend([
            PassKind::OrderByRewriter,
            PassKind::Cleanup,
            PassKind::CrossApplyRewriter,
            PassKind::CrossJoinRewriter,
            PassKind::Cleanup,
            PassKind::Parameterizer,
        ]);
        Self {
            name: "ansi".into(),
            paging: PagingStrategy::Native,
            limit_syntax: LimitSyntax::LimitOffset,
            projection_affinity: ProjectionAffinity::Client,
            allows_subquery_in_select_without_from: true,
            parameter_prefix: default_parameter_prefix(),
            validate_aliases: false,
            passes,
        }
    }

    /// `TOP` plus `ROW_NUMBER() OVER` for offsets.
    pub fn row_number() -> Self {
        let mut passes = Self::front_passes();
        passes.extend([
            PassKind::OrderByRewriter,
            PassKind::Cleanup,
            PassKind::CrossApplyRewriter,
            PassKind::CrossJoinRewriter,
            PassKind::SkipToRowNumber,
            PassKind::Cleanup,
            PassKind::Parameterizer,
        ]);
        Self {
            name: "row_number".into(),
            paging: PagingStrategy::RowNumber,
            limit_syntax: LimitSyntax::Top,
            passes,
            ..Self::ansi()
        }
    }

    /// `TOP` only: offsets emulated with nested orderings, no mixing of
    /// cross and keyed joins at one level.
    pub fn top_only() -> Self {
        let mut passes = Self::front_passes();
        // Isolation wrappers look redundant, so no cleanup may follow them.
        passes.extend([
            PassKind::OrderByRewriter,
            PassKind::Cleanup,
            PassKind::CrossApplyRewriter,
            PassKind::CrossJoinRewriter,
            PassKind::Cleanup,
            PassKind::SkipToNestedOrderBy,
            PassKind::CrossJoinIsolator,
            PassKind::Parameterizer,
        ]);
        Self {
            name: "top_only".into(),
            paging: PagingStrategy::NestedOrderBy,
            limit_syntax: LimitSyntax::Top,
            allows_subquery_in_select_without_from: false,
            passes,
            ..Self::ansi()
        }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "ansi" => Some(Self::ansi()),
            "row_number" => Some(Self::row_number()),
            "top_only" => Some(Self::top_only()),
            _ => None,
        }
    }

    pub fn from_json_str(json: &str) -> PlanResult<Self> {
        let config: DialectConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> PlanResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading dialect");
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// The pipeline must end with exactly one parameterizer, and its paging
    /// pass must match the declared strategy.
    pub fn validate(&self) -> PlanResult<()> {
        let has = |kind: PassKind| self.passes.contains(&kind);
        let row_number = has(PassKind::SkipToRowNumber);
        let nested = has(PassKind::SkipToNestedOrderBy);
        if row_number && nested {
            return Err(PlanError::Config(format!("{}: both paging passes are listed", self.name)));
        }
        let consistent = match self.paging {
            PagingStrategy::Native => !row_number && !nested,
            PagingStrategy::RowNumber => row_number,
            PagingStrategy::NestedOrderBy => nested,
        };
        if !consistent {
            return Err(PlanError::Config(format!(
                "{}: paging pass does not match the {:?} strategy",
                self.name, self.paging
            )));
        }
        let parameterizers = self.passes.iter().filter(|p| **p == PassKind::Parameterizer).count();
        if parameterizers != 1 || self.passes.last() != Some(&PassKind::Parameterizer) {
            return Err(PlanError::Config(format!("{}: the parameterizer must run once, last", self.name)));
        }
        Ok(())
    }
}

/// A dialect driven entirely by its [`DialectConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct StandardDialect {
    config: DialectConfig,
}

impl StandardDialect {
    pub fn new(config: DialectConfig) -> PlanResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn ansi() -> Self {
        Self { config: DialectConfig::ansi() }
    }

    pub fn row_number() -> Self {
        Self { config: DialectConfig::row_number() }
    }

    pub fn top_only() -> Self {
        Self { config: DialectConfig::top_only() }
    }

    pub fn config(&self) -> &DialectConfig {
        &self.config
    }
}

impl QueryLanguage for StandardDialect {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn paging(&self) -> PagingStrategy {
        self.config.paging
    }

    fn limit_syntax(&self) -> LimitSyntax {
        self.config.limit_syntax
    }

    fn projection_affinity(&self) -> ProjectionAffinity {
        self.config.projection_affinity
    }

    fn passes(&self) -> &[PassKind] {
        &self.config.passes
    }

    fn parameter_prefix(&self) -> &str {
        &self.config.parameter_prefix
    }

    fn allows_subquery_in_select_without_from(&self) -> bool {
        self.config.allows_subquery_in_select_without_from
    }

    fn validate_aliases(&self) -> bool {
        self.config.validate_aliases
    }
}

/// Process-wide default dialect, built on first use and never mutated.
pub static DEFAULT_DIALECT: Lazy<StandardDialect> = Lazy::new(StandardDialect::ansi);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtins_validate() {
        for name in ["ansi", "row_number", "top_only"] {
            let config = DialectConfig::builtin(name).unwrap();
            config.validate().unwrap();
            assert_eq!(config.name, name);
        }
    }

    #[test]
    fn rejects_both_paging_passes() {
        let mut config = DialectConfig::row_number();
        config.passes.insert(0, PassKind::SkipToNestedOrderBy);
        assert!(matches!(config.validate(), Err(PlanError::Config(_))));
    }

    #[test]
    fn rejects_strategy_mismatch() {
        let mut config = DialectConfig::ansi();
        config.paging = PagingStrategy::RowNumber;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parameterizer_must_be_last() {
        let mut config = DialectConfig::ansi();
        config.passes.push(PassKind::Cleanup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_through_file() {
        let json = serde_json::to_string(&DialectConfig::top_only()).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let loaded = DialectConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, DialectConfig::top_only());
    }

    #[test]
    fn minimal_json_uses_defaults() {
        let loaded = DialectConfig::from_json_str(r#"{ "name": "tiny", "passes": ["cleanup", "parameterizer"] }"#).unwrap();
        assert_eq!(loaded.parameter_prefix, "@");
        assert_eq!(loaded.paging, PagingStrategy::Native);
        let dialect = StandardDialect::new(loaded).unwrap();
        assert_eq!(dialect.name(), "tiny");
    }

    #[test]
    fn default_dialect_is_ansi() {
        assert_eq!(DEFAULT_DIALECT.name(), "ansi");
    }
}
