use thiserror::Error;

pub type PlanResult<T> = Result<T, PlanError>;

/// Every failure raised while turning a combinator tree into a plan.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("unsupported construct `{construct}`: {reason}")]
    Unsupported { construct: String, reason: String },

    #[error("cannot compare constructed values with members {left:?} and {right:?}")]
    InvalidComparison { left: Vec<String>, right: Vec<String> },

    #[error("dialect `{dialect}` cannot express this plan: {reason}")]
    DialectPrecondition { dialect: String, reason: String },

    #[error("unknown entity `{0}`")]
    UnknownEntity(String),

    #[error("entity `{entity}` has no member `{member}`")]
    UnknownMember { entity: String, member: String },

    #[error("expression `{0}` is not a sequence")]
    NotASequence(String),

    #[error("sequence contains no elements")]
    EmptySequence,

    #[error("sequence contains more than one element")]
    MoreThanOneElement,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed plan: {0}")]
    Internal(String),

    #[error("while binding {operator}: {source}")]
    AtOperator {
        operator: String,
        #[source]
        source: Box<PlanError>,
    },

    #[error("in pass {pass}: {source}")]
    InPass {
        pass: &'static str,
        #[source]
        source: Box<PlanError>,
    },
}

impl PlanError {
    pub fn unsupported(construct: impl Into<String>, reason: impl Into<String>) -> Self {
        PlanError::Unsupported { construct: construct.into(), reason: reason.into() }
    }

    pub fn dialect_precondition(dialect: impl Into<String>, reason: impl Into<String>) -> Self {
        PlanError::DialectPrecondition { dialect: dialect.into(), reason: reason.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        PlanError::Internal(message.into())
    }

    pub fn at_operator(self, operator: impl Into<String>) -> Self {
        PlanError::AtOperator { operator: operator.into(), source: Box::new(self) }
    }

    pub fn in_pass(self, pass: &'static str) -> Self {
        PlanError::InPass { pass, source: Box::new(self) }
    }

    /// The innermost error, with operator and pass context peeled off.
    pub fn root_cause(&self) -> &PlanError {
        match self {
            PlanError::AtOperator { source, .. } | PlanError::InPass { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for PlanError {
    fn from(err: serde_json::Error) -> Self {
        PlanError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_skips_context_layers() {
        let err = PlanError::unsupported("Power", "no translation")
            .at_operator("Filter")
            .at_operator("Take > Filter")
            .in_pass("binder");
        assert!(matches!(err.root_cause(), PlanError::Unsupported { construct, .. } if construct == "Power"));
    }

    #[test]
    fn display_includes_operator_path() {
        let err = PlanError::unsupported("FlatMap", "index parameter").at_operator("Take > FlatMap");
        let text = err.to_string();
        assert!(text.contains("Take > FlatMap"));
        assert!(text.contains("index parameter"));
    }
}
