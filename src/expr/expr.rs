use std::fmt;
use std::sync::Arc;

use crate::error::{PlanError, PlanResult};
use crate::expr::{
    AggregateExpr, AggregateSubqueryExpr, BatchCommand, BinaryOp, ClientJoinExpr, ColumnExpr,
    DeleteCommand, InSource, InsertCommand, JoinExpr, NamedValueExpr, OrderExpr, PlanPrinter,
    ProjectionExpr, SelectExpr, SetOperationExpr, TableAlias, TableExpr, UnaryOp, UpdateCommand,
};
use crate::model::{SqlType, Value, ValueType};
use crate::query::Query;

/// Shared handle to an immutable node. Rewrites compare handles with
/// [`Arc::ptr_eq`] to detect whether a child changed.
pub type ExprRef = Arc<Expr>;

/// One node of a plan: host-level expressions (what lambda bodies are made
/// of) and relational plan nodes live in the same closed union so that a
/// projector can mix client-side construction with column references.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant { value: Value, ty: ValueType },
    /// Lambda parameter reference.
    Parameter { name: String, ty: ValueType },
    /// Read of a variable captured from the caller's scope.
    Captured { name: String, value: Value, ty: ValueType },
    Member { expr: ExprRef, member: String, ty: ValueType },
    Unary { op: UnaryOp, operand: ExprRef, ty: ValueType },
    Binary { op: BinaryOp, left: ExprRef, right: ExprRef, ty: ValueType },
    Conditional { test: ExprRef, if_true: ExprRef, if_false: ExprRef, ty: ValueType },
    Call { function: String, args: Vec<ExprRef>, ty: ValueType },
    /// Constructed record with named members, in declaration order.
    New { type_name: String, members: Vec<(String, ExprRef)> },
    /// Result element of a group-by: key plus the per-group element query.
    Grouping { key: ExprRef, elements: ExprRef },
    Query(Arc<Query>),

    Table(TableExpr),
    SetOperation(SetOperationExpr),
    Column(ColumnExpr),
    Select(SelectExpr),
    Join(JoinExpr),
    Aggregate(AggregateExpr),
    AggregateSubquery(AggregateSubqueryExpr),
    Scalar { select: ExprRef, ty: ValueType },
    Exists { select: ExprRef },
    In { expr: ExprRef, source: InSource },
    IsNull(ExprRef),
    Between { expr: ExprRef, lower: ExprRef, upper: ExprRef },
    RowNumber { order_by: Vec<OrderExpr> },
    OuterJoined { test: ExprRef, value: ExprRef },
    NamedValue(NamedValueExpr),
    Entity { entity: String, expr: ExprRef },
    Projection(ProjectionExpr),
    ClientJoin(ClientJoinExpr),

    Insert(InsertCommand),
    Update(UpdateCommand),
    Delete(DeleteCommand),
    Batch(BatchCommand),
}

impl Expr {
    pub fn into_ref(self) -> ExprRef {
        Arc::new(self)
    }

    pub fn constant(value: Value) -> ExprRef {
        let ty = value.value_type();
        Expr::Constant { value, ty }.into_ref()
    }

    pub fn typed_constant(value: Value, ty: ValueType) -> ExprRef {
        Expr::Constant { value, ty }.into_ref()
    }

    pub fn int(i: i64) -> ExprRef {
        Expr::typed_constant(Value::Int(i), ValueType::Int)
    }

    pub fn parameter(name: impl Into<String>, ty: ValueType) -> ExprRef {
        Expr::Parameter { name: name.into(), ty }.into_ref()
    }

    pub fn captured(name: impl Into<String>, value: Value) -> ExprRef {
        let ty = value.value_type();
        Expr::Captured { name: name.into(), value, ty }.into_ref()
    }

    pub fn column(alias: TableAlias, name: impl Into<String>, ty: ValueType, sql_type: SqlType) -> ExprRef {
        Expr::Column(ColumnExpr { alias, name: name.into(), ty, sql_type }).into_ref()
    }

    pub fn member(expr: ExprRef, member: impl Into<String>, ty: ValueType) -> ExprRef {
        Expr::Member { expr, member: member.into(), ty }.into_ref()
    }

    pub fn binary(op: BinaryOp, left: ExprRef, right: ExprRef) -> ExprRef {
        let ty = if op.is_comparison() || op.is_logical() {
            ValueType::Bool
        } else {
            left.value_type()
        };
        Expr::Binary { op, left, right, ty }.into_ref()
    }

    pub fn eq(left: ExprRef, right: ExprRef) -> ExprRef {
        Expr::binary(BinaryOp::Equal, left, right)
    }

    pub fn and(left: ExprRef, right: ExprRef) -> ExprRef {
        Expr::binary(BinaryOp::And, left, right)
    }

    pub fn or(left: ExprRef, right: ExprRef) -> ExprRef {
        Expr::binary(BinaryOp::Or, left, right)
    }

    pub fn not(operand: ExprRef) -> ExprRef {
        Expr::Unary { op: UnaryOp::Not, operand, ty: ValueType::Bool }.into_ref()
    }

    pub fn new_record<I, K>(type_name: impl Into<String>, members: I) -> ExprRef
    where
        I: IntoIterator<Item = (K, ExprRef)>,
        K: Into<String>,
    {
        Expr::New {
            type_name: type_name.into(),
            members: members.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
        .into_ref()
    }

    pub fn projection(select: SelectExpr, projector: ExprRef) -> ExprRef {
        Expr::Projection(ProjectionExpr {
            select: Expr::Select(select).into_ref(),
            projector,
            reduction: None,
            is_singleton: false,
        })
        .into_ref()
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Expr::Constant { ty, .. }
            | Expr::Parameter { ty, .. }
            | Expr::Captured { ty, .. }
            | Expr::Member { ty, .. }
            | Expr::Unary { ty, .. }
            | Expr::Binary { ty, .. }
            | Expr::Conditional { ty, .. }
            | Expr::Call { ty, .. }
            | Expr::Scalar { ty, .. } => ty.clone(),
            Expr::New { type_name, .. } => ValueType::Record(type_name.clone()),
            Expr::Grouping { elements, .. } => elements.value_type(),
            Expr::Column(c) => c.ty.clone(),
            Expr::Aggregate(a) => a.ty.clone(),
            Expr::AggregateSubquery(a) => a.ty.clone(),
            Expr::NamedValue(nv) => nv.ty.clone(),
            Expr::Exists { .. } | Expr::In { .. } | Expr::IsNull(_) | Expr::Between { .. } => ValueType::Bool,
            Expr::RowNumber { .. } => ValueType::Long,
            Expr::OuterJoined { value, .. } => value.value_type(),
            Expr::Entity { entity, .. } => ValueType::Entity(entity.clone()),
            Expr::Projection(p) => ValueType::sequence_of(p.projector.value_type()),
            Expr::ClientJoin(cj) => cj.projection.value_type(),
            Expr::Query(_)
            | Expr::Table(_)
            | Expr::SetOperation(_)
            | Expr::Select(_)
            | Expr::Join(_)
            | Expr::Insert(_)
            | Expr::Update(_)
            | Expr::Delete(_)
            | Expr::Batch(_) => ValueType::Unknown,
        }
    }

    /// Short variant name, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Constant { .. } => "Constant",
            Expr::Parameter { .. } => "Parameter",
            Expr::Captured { .. } => "Captured",
            Expr::Member { .. } => "Member",
            Expr::Unary { .. } => "Unary",
            Expr::Binary { .. } => "Binary",
            Expr::Conditional { .. } => "Conditional",
            Expr::Call { .. } => "Call",
            Expr::New { .. } => "New",
            Expr::Grouping { .. } => "Grouping",
            Expr::Query(_) => "Query",
            Expr::Table(_) => "Table",
            Expr::SetOperation(_) => "SetOperation",
            Expr::Column(_) => "Column",
            Expr::Select(_) => "Select",
            Expr::Join(_) => "Join",
            Expr::Aggregate(_) => "Aggregate",
            Expr::AggregateSubquery(_) => "AggregateSubquery",
            Expr::Scalar { .. } => "Scalar",
            Expr::Exists { .. } => "Exists",
            Expr::In { .. } => "In",
            Expr::IsNull(_) => "IsNull",
            Expr::Between { .. } => "Between",
            Expr::RowNumber { .. } => "RowNumber",
            Expr::OuterJoined { .. } => "OuterJoined",
            Expr::NamedValue(_) => "NamedValue",
            Expr::Entity { .. } => "Entity",
            Expr::Projection(_) => "Projection",
            Expr::ClientJoin(_) => "ClientJoin",
            Expr::Insert(_) => "Insert",
            Expr::Update(_) => "Update",
            Expr::Delete(_) => "Delete",
            Expr::Batch(_) => "Batch",
        }
    }

    pub fn as_select(&self) -> Option<&SelectExpr> {
        match self {
            Expr::Select(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_column(&self) -> Option<&ColumnExpr> {
        match self {
            Expr::Column(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_projection(&self) -> Option<&ProjectionExpr> {
        match self {
            Expr::Projection(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_join(&self) -> Option<&JoinExpr> {
        match self {
            Expr::Join(j) => Some(j),
            _ => None,
        }
    }

    /// Alias declared by a source node (select, table or set operation).
    pub fn declared_alias(&self) -> Option<TableAlias> {
        match self {
            Expr::Select(s) => Some(s.alias),
            Expr::Table(t) => Some(t.alias),
            Expr::SetOperation(s) => Some(s.alias),
            _ => None,
        }
    }

    pub fn is_null_constant(&self) -> bool {
        matches!(self, Expr::Constant { value: Value::Null, .. })
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Expr::Insert(_) | Expr::Update(_) | Expr::Delete(_) | Expr::Batch(_))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&PlanPrinter::print(self))
    }
}

pub fn expect_select(expr: &ExprRef) -> PlanResult<&SelectExpr> {
    expr.as_select()
        .ok_or_else(|| PlanError::internal(format!("expected a select, found {}", expr.kind_name())))
}

pub fn expect_projection(expr: &ExprRef) -> PlanResult<&ProjectionExpr> {
    expr.as_projection()
        .ok_or_else(|| PlanError::internal(format!("expected a projection, found {}", expr.kind_name())))
}
