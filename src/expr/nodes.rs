use crate::expr::{
    AggregateKind, ExprRef, JoinKind, OrderDirection, Reduction, SetOperationKind, TableAlias,
};
use crate::model::{SqlType, ValueType};

/// A mapped table, the leaf of every `from` chain.
#[derive(Debug, Clone, PartialEq)]
pub struct TableExpr {
    pub alias: TableAlias,
    /// Mapping handle (entity name) the table was produced from.
    pub entity: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnExpr {
    pub alias: TableAlias,
    pub name: String,
    pub ty: ValueType,
    pub sql_type: SqlType,
}

impl ColumnExpr {
    pub fn key(&self) -> (TableAlias, &str) {
        (self.alias, self.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDeclaration {
    pub name: String,
    pub expr: ExprRef,
    pub sql_type: SqlType,
}

impl ColumnDeclaration {
    pub fn new(name: impl Into<String>, expr: ExprRef, sql_type: SqlType) -> Self {
        Self { name: name.into(), expr, sql_type }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderExpr {
    pub direction: OrderDirection,
    pub expr: ExprRef,
}

impl OrderExpr {
    pub fn new(direction: OrderDirection, expr: ExprRef) -> Self {
        Self { direction, expr }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinExpr {
    pub kind: JoinKind,
    pub left: ExprRef,
    pub right: ExprRef,
    pub condition: Option<ExprRef>,
}

/// `UNION` / `UNION ALL` of two selects, usable as a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SetOperationExpr {
    pub kind: SetOperationKind,
    pub alias: TableAlias,
    pub left: ExprRef,
    pub right: ExprRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub kind: AggregateKind,
    pub argument: Option<ExprRef>,
    pub distinct: bool,
    pub ty: ValueType,
}

impl AggregateExpr {
    /// `COUNT(*)`
    pub fn is_row_count(&self) -> bool {
        self.argument.is_none() && self.kind.takes_predicate()
    }
}

/// An aggregate over a group's elements, computed as a correlated scalar
/// subquery until the aggregate rewriter folds it into the select that owns
/// `group_by_alias`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSubqueryExpr {
    pub group_by_alias: TableAlias,
    pub aggregate_in_group_select: ExprRef,
    pub subquery: ExprRef,
    pub ty: ValueType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedValueExpr {
    pub name: String,
    pub ty: ValueType,
    pub sql_type: SqlType,
    /// Host expression the store adapter evaluates to bind the placeholder.
    pub value: ExprRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionExpr {
    pub select: ExprRef,
    pub projector: ExprRef,
    pub reduction: Option<Reduction>,
    /// At most one row per outer row; eligible for server-side outer apply.
    pub is_singleton: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientJoinExpr {
    pub projection: ExprRef,
    pub outer_key: Vec<ExprRef>,
    pub inner_key: Vec<ExprRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InSource {
    Select(ExprRef),
    Values(Vec<ExprRef>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnAssignment {
    pub column: ExprRef,
    pub expr: ExprRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertCommand {
    pub table: ExprRef,
    pub assignments: Vec<ColumnAssignment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCommand {
    pub table: ExprRef,
    pub filter: Option<ExprRef>,
    pub assignments: Vec<ColumnAssignment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteCommand {
    pub table: ExprRef,
    pub filter: Option<ExprRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchCommand {
    pub commands: Vec<ExprRef>,
}
