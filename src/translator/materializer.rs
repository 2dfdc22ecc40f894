use crate::error::{PlanError, PlanResult};
use crate::expr::{ColumnExpr, ExprRef, NamedValueExpr, Reduction};
use crate::model::{SqlType, Value, ValueType};
use crate::passes::host_value;

/// A placeholder the store adapter binds before running the text.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameter {
    pub name: String,
    pub ty: ValueType,
    pub sql_type: SqlType,
    /// Host expression that produces the bound value.
    pub source: ExprRef,
}

impl QueryParameter {
    /// Evaluates the host expression behind the placeholder.
    pub fn resolve(&self) -> PlanResult<Value> {
        host_value(&self.source)
            .ok_or_else(|| PlanError::unsupported("parameter", format!("`{}` has no host value", self.name)))
    }
}

impl From<NamedValueExpr> for QueryParameter {
    fn from(named: NamedValueExpr) -> Self {
        QueryParameter { name: named.name, ty: named.ty, sql_type: named.sql_type, source: named.value }
    }
}

/// Key columns matching rows of a client-joined subquery to their outer row.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientJoinKeys {
    pub outer: Vec<ExprRef>,
    pub inner: Vec<ExprRef>,
}

/// A subquery of the projector that runs as its own statement.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedQuery {
    pub text: String,
    pub parameters: Vec<QueryParameter>,
    /// Columns of the enclosing row bound under the placeholder name. Empty
    /// for client joins, which run once for all outer rows.
    pub outer_columns: Vec<(String, ColumnExpr)>,
    pub join: Option<ClientJoinKeys>,
    pub materializer: ResultMaterializer,
}

/// Turns rows returned by the store into the requested shape.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultMaterializer {
    /// Client-side constructor over one row. `None` for commands.
    pub projector: Option<ExprRef>,
    pub reduction: Option<Reduction>,
    pub nested: Vec<NestedQuery>,
}

impl ResultMaterializer {
    pub fn is_reduced(&self) -> bool {
        self.reduction.is_some()
    }

    /// Applies the terminal reduction, if any, to materialized rows.
    pub fn apply<T>(&self, rows: Vec<T>) -> PlanResult<Vec<T>> {
        match self.reduction {
            Some(reduction) => Ok(reduction.reduce(rows)?.into_iter().collect()),
            None => Ok(rows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    #[test]
    fn reduction_keeps_first_row() {
        let materializer = ResultMaterializer { reduction: Some(Reduction::First), ..Default::default() };
        assert_eq!(materializer.apply(vec![3, 4]).unwrap(), vec![3]);
    }

    #[test]
    fn or_default_on_empty_yields_no_rows() {
        let materializer = ResultMaterializer { reduction: Some(Reduction::SingleOrDefault), ..Default::default() };
        assert!(materializer.apply(Vec::<i64>::new()).unwrap().is_empty());
        assert!(matches!(
            ResultMaterializer { reduction: Some(Reduction::Single), ..Default::default() }.apply(vec![1, 2]),
            Err(PlanError::MoreThanOneElement)
        ));
    }

    #[test]
    fn parameter_resolves_captured_member() {
        let order = Value::record(vec![("Zone".to_string(), Value::Int(7))]);
        let source = Expr::member(Expr::captured("order", order), "Zone", ValueType::Int);
        let param = QueryParameter { name: "p0".into(), ty: ValueType::Int, sql_type: SqlType::Integer, source };
        assert_eq!(param.resolve().unwrap(), Value::Int(7));
    }
}
