use std::sync::Arc;

use crate::expr::{AggregateKind, Expr, ExprRef, OrderDirection, Reduction, SetOperationKind};

pub type QueryRef = Arc<Query>;

/// `|params| body`. Bodies are host expressions whose `Parameter` nodes name
/// one of `params`; they may embed further queries through [`Expr::Query`].
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: ExprRef,
}

impl Lambda {
    pub fn new(param: impl Into<String>, body: ExprRef) -> Self {
        Self { params: vec![param.into()], body }
    }

    pub fn new2(first: impl Into<String>, second: impl Into<String>, body: ExprRef) -> Self {
        Self { params: vec![first.into(), second.into()], body }
    }
}

/// The closed set of combinators a caller can compose.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// All rows of a mapped entity.
    Source { entity: String },
    /// A sequence-valued host expression: a group's elements, a collection
    /// relationship or an in-memory list.
    Sequence(ExprRef),
    Filter { source: QueryRef, predicate: Lambda },
    Project { source: QueryRef, selector: Lambda },
    /// For each outer row, enumerate `collection(outer)`; `result(outer, inner)`
    /// shapes the output (the inner element when absent).
    FlatMap { source: QueryRef, collection: Lambda, result: Option<Lambda> },
    Join { outer: QueryRef, inner: QueryRef, outer_key: Lambda, inner_key: Lambda, result: Lambda },
    GroupBy { source: QueryRef, key: Lambda, element: Option<Lambda>, result: Option<Lambda> },
    OrderBy { source: QueryRef, key: Lambda, direction: OrderDirection },
    ThenBy { source: QueryRef, key: Lambda, direction: OrderDirection },
    Distinct(QueryRef),
    Reverse(QueryRef),
    Skip { source: QueryRef, count: ExprRef },
    Take { source: QueryRef, count: ExprRef },
    DefaultIfEmpty(QueryRef),
    Element { source: QueryRef, kind: Reduction, predicate: Option<Lambda> },
    Any { source: QueryRef, predicate: Option<Lambda> },
    All { source: QueryRef, predicate: Lambda },
    Contains { source: QueryRef, item: ExprRef },
    Aggregate { source: QueryRef, kind: AggregateKind, argument: Option<Lambda> },
    SetOperation { kind: SetOperationKind, left: QueryRef, right: QueryRef },
    Insert { entity: String, instance: ExprRef },
    /// Writes `instance` back, optionally guarded by `check(stored row)`.
    Update { entity: String, instance: ExprRef, check: Option<Lambda> },
    Delete { entity: String, predicate: Lambda },
    Batch { commands: Vec<QueryRef> },
}

impl Query {
    pub fn into_ref(self) -> QueryRef {
        Arc::new(self)
    }

    /// Embeds the query in a host expression.
    pub fn into_expr(self) -> ExprRef {
        Expr::Query(Arc::new(self)).into_ref()
    }

    pub fn operator_name(&self) -> String {
        match self {
            Query::Source { entity } => format!("Source({entity})"),
            Query::Sequence(_) => "Sequence".into(),
            Query::Filter { .. } => "Filter".into(),
            Query::Project { .. } => "Project".into(),
            Query::FlatMap { .. } => "FlatMap".into(),
            Query::Join { .. } => "Join".into(),
            Query::GroupBy { .. } => "GroupBy".into(),
            Query::OrderBy { .. } => "OrderBy".into(),
            Query::ThenBy { .. } => "ThenBy".into(),
            Query::Distinct(_) => "Distinct".into(),
            Query::Reverse(_) => "Reverse".into(),
            Query::Skip { .. } => "Skip".into(),
            Query::Take { .. } => "Take".into(),
            Query::DefaultIfEmpty(_) => "DefaultIfEmpty".into(),
            Query::Element { kind, .. } => kind.name().into(),
            Query::Any { .. } => "Any".into(),
            Query::All { .. } => "All".into(),
            Query::Contains { .. } => "Contains".into(),
            Query::Aggregate { kind, .. } => kind.name().into(),
            Query::SetOperation { kind, .. } => format!("{kind:?}"),
            Query::Insert { .. } => "Insert".into(),
            Query::Update { .. } => "Update".into(),
            Query::Delete { .. } => "Delete".into(),
            Query::Batch { .. } => "Batch".into(),
        }
    }

    /// Operators that produce a single value rather than a sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Query::Element { .. } | Query::Any { .. } | Query::All { .. } | Query::Contains { .. } | Query::Aggregate { .. }
        )
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Query::Insert { .. } | Query::Update { .. } | Query::Delete { .. } | Query::Batch { .. })
    }
}
