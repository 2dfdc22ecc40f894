use crate::dialect::QueryLanguage;
use crate::error::{PlanError, PlanResult};
use crate::expr::{expect_select, BinaryOp, Expr, ExprRef, OrderExpr, Rewriter, SelectExpr, TableAlias};
use crate::model::Value;
use crate::passes::OrderByRewriter;

/// Emulates `skip` for dialects that only have `TOP n`:
///
/// ```text
/// SELECT * FROM (
///   SELECT TOP take * FROM (
///     SELECT TOP skip+take * FROM source ORDER BY key
///   ) ORDER BY key DESC
/// ) ORDER BY key
/// ```
pub struct SkipToNestedOrderByRewriter<'a> {
    language: &'a dyn QueryLanguage,
}

impl<'a> SkipToNestedOrderByRewriter<'a> {
    pub fn rewrite(language: &'a dyn QueryLanguage, plan: &ExprRef) -> PlanResult<ExprRef> {
        Rewriter::rewrite(&mut SkipToNestedOrderByRewriter { language }, plan)
    }

    fn sandwich(&self, select: &SelectExpr, skip: &ExprRef) -> PlanResult<SelectExpr> {
        let Some(take) = &select.take else {
            return Err(self.precondition("skip without take cannot be expressed with TOP"));
        };
        if !select.has_order_by() {
            return Err(self.precondition("skip requires an ordering"));
        }

        let first_rows = select.clone().with_skip(None).with_take(Some(add(skip, take)));
        let last_page = first_rows.add_redundant_select(TableAlias::fresh()).with_take(Some(take.clone()));
        let last_page = self.lift_orderings(last_page)?;
        let last_page = last_page.clone().with_order_by(reversed(&last_page.order_by));

        let restored = last_page.add_redundant_select(TableAlias::fresh());
        // A placeholder take lets the ordering travel up one level.
        let restored = self.lift_orderings(restored.with_take(Some(Expr::int(0))))?;
        let order_by = reversed(&restored.order_by);
        Ok(restored.with_order_by(order_by).with_take(None))
    }

    fn lift_orderings(&self, select: SelectExpr) -> PlanResult<SelectExpr> {
        let lifted = OrderByRewriter::rewrite(self.language, &select.into_ref())?;
        Ok(expect_select(&lifted)?.clone())
    }

    fn precondition(&self, reason: &str) -> PlanError {
        PlanError::dialect_precondition(self.language.name(), reason)
    }
}

fn reversed(orderings: &[OrderExpr]) -> Vec<OrderExpr> {
    orderings.iter().map(|o| OrderExpr::new(o.direction.reversed(), o.expr.clone())).collect()
}

fn add(a: &ExprRef, b: &ExprRef) -> ExprRef {
    match (&**a, &**b) {
        (Expr::Constant { value: Value::Int(x), .. }, Expr::Constant { value: Value::Int(y), .. }) => Expr::int(x + y),
        _ => Expr::binary(BinaryOp::Add, a.clone(), b.clone()),
    }
}

impl Rewriter for SkipToNestedOrderByRewriter<'_> {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        let rewritten = self.rewrite_children(expr)?;
        match &*rewritten {
            Expr::Select(select) => match &select.skip {
                Some(skip) => Ok(self.sandwich(select, skip)?.into_ref()),
                None => Ok(rewritten),
            },
            _ => Ok(rewritten),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::StandardDialect;
    use crate::expr::OrderDirection;
    use crate::fixtures::{int_column, passthrough, table};

    fn paged(skip: i64, take: Option<i64>, ordered: bool) -> ExprRef {
        let t = TableAlias::fresh();
        let order_by = if ordered { vec![OrderExpr::new(OrderDirection::Ascending, int_column(t, "id"))] } else { Vec::new() };
        SelectExpr::new(TableAlias::fresh(), vec![passthrough(t, "id")], Some(table(t, "orders")), None)
            .with_order_by(order_by)
            .with_skip(Some(Expr::int(skip)))
            .with_take(take.map(Expr::int))
            .into_ref()
    }

    fn layer(expr: &ExprRef) -> SelectExpr {
        expect_select(expr).unwrap().clone()
    }

    #[test]
    fn paging_becomes_three_ordered_layers() {
        let dialect = StandardDialect::top_only();
        let plan = SkipToNestedOrderByRewriter::rewrite(&dialect, &paged(10, Some(5), true)).unwrap();

        let outer = layer(&plan);
        assert!(outer.take.is_none() && outer.skip.is_none());
        assert_eq!(outer.order_by[0].direction, OrderDirection::Ascending);

        let middle = layer(outer.from.as_ref().unwrap());
        assert_eq!(middle.take, Some(Expr::int(5)));
        assert_eq!(middle.order_by[0].direction, OrderDirection::Descending);

        let inner = layer(middle.from.as_ref().unwrap());
        assert_eq!(inner.take, Some(Expr::int(15)));
        assert!(inner.skip.is_none());
        assert_eq!(inner.order_by[0].direction, OrderDirection::Ascending);
    }

    #[test]
    fn missing_take_is_a_dialect_precondition() {
        let dialect = StandardDialect::top_only();
        let err = SkipToNestedOrderByRewriter::rewrite(&dialect, &paged(10, None, true)).unwrap_err();
        assert!(matches!(err, PlanError::DialectPrecondition { ref dialect, .. } if dialect == "top_only"));
    }

    #[test]
    fn missing_ordering_is_a_dialect_precondition() {
        let dialect = StandardDialect::top_only();
        let err = SkipToNestedOrderByRewriter::rewrite(&dialect, &paged(10, Some(5), false)).unwrap_err();
        assert!(matches!(err, PlanError::DialectPrecondition { .. }));
    }
}
