use serde::{Deserialize, Serialize};

use crate::expr::{Expr, ExprRef, ProjectionExpr};
use crate::model::{SqlType, ValueType};
use crate::passes::PassKind;

/// How the column projector classifies a sub-expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nomination {
    /// Only the store can evaluate it.
    Must,
    /// Either side can; becomes a column when all its operands can too.
    Can,
    Cannot,
}

/// Which side evaluates scalar work in a projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionAffinity {
    /// Only what must be a column becomes one; the rest runs in the
    /// materializer.
    #[default]
    Client,
    /// Translatable scalar expressions are pushed into the select list.
    Server,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PagingStrategy {
    /// `LIMIT`/`OFFSET` (or `OFFSET ... FETCH`) are available.
    #[default]
    Native,
    RowNumber,
    NestedOrderBy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitSyntax {
    #[default]
    LimitOffset,
    Top,
}

/// Everything the compiler asks of a target dialect.
pub trait QueryLanguage {
    fn name(&self) -> &str;

    fn paging(&self) -> PagingStrategy;

    fn limit_syntax(&self) -> LimitSyntax;

    fn projection_affinity(&self) -> ProjectionAffinity;

    /// Ordered rewrite pipeline run after binding.
    fn passes(&self) -> &[PassKind];

    fn parameter_prefix(&self) -> &str;

    fn allows_subquery_in_select_without_from(&self) -> bool;

    fn validate_aliases(&self) -> bool {
        false
    }

    fn column_type(&self, ty: &ValueType) -> SqlType {
        match ty {
            ValueType::Bool => SqlType::Boolean,
            ValueType::Int => SqlType::Integer,
            ValueType::Long => SqlType::BigInt,
            ValueType::Float => SqlType::Double,
            ValueType::Decimal => SqlType::Decimal,
            ValueType::String => SqlType::VarChar,
            ValueType::DateTime => SqlType::DateTime,
            _ => SqlType::Unknown,
        }
    }

    fn nominate(&self, expr: &Expr, affinity: ProjectionAffinity) -> Nomination {
        match expr {
            Expr::Column(_)
            | Expr::Scalar { .. }
            | Expr::Exists { .. }
            | Expr::AggregateSubquery(_)
            | Expr::Aggregate(_)
            | Expr::RowNumber { .. } => Nomination::Must,
            _ if affinity == ProjectionAffinity::Client => Nomination::Cannot,
            Expr::Constant { ty, .. } | Expr::Captured { ty, .. } if ty.is_scalar() => Nomination::Can,
            Expr::NamedValue(_) | Expr::IsNull(_) | Expr::Between { .. } | Expr::In { .. } => Nomination::Can,
            Expr::Unary { ty, .. } | Expr::Binary { ty, .. } | Expr::Conditional { ty, .. } | Expr::Call { ty, .. }
                if ty.is_scalar() =>
            {
                Nomination::Can
            }
            _ => Nomination::Cannot,
        }
    }

    /// Adds a constant `Test` column to a projection that will sit on the
    /// nullable side of an outer join, and wraps the projector so the
    /// materializer yields nothing when the column comes back null.
    fn add_outer_join_test(&self, projection: &ProjectionExpr) -> ExprRef {
        let Some(select) = projection.select.as_select() else {
            return Expr::Projection(projection.clone()).into_ref();
        };
        let test = Expr::int(1);
        let mut select = select.clone();
        let test_column = match select.columns.iter().find(|c| c.expr == test) {
            Some(decl) => select.column_ref(decl),
            None => {
                let sql_type = self.column_type(&ValueType::Int);
                let name = select.add_column("Test", test, sql_type);
                Expr::column(select.alias, name, ValueType::Int, sql_type)
            }
        };
        Expr::Projection(ProjectionExpr {
            select: select.into_ref(),
            projector: Expr::OuterJoined { test: test_column, value: projection.projector.clone() }.into_ref(),
            reduction: projection.reduction,
            is_singleton: projection.is_singleton,
        })
        .into_ref()
    }
}
