use crate::dialect::QueryLanguage;
use crate::error::PlanResult;
use crate::expr::{
    expect_select, BinaryOp, Expr, ExprRef, OrderDirection, OrderExpr, Rewriter, SelectExpr, TableAlias,
};
use crate::model::{Value, ValueType};

/// Emulates `skip` with a `ROW_NUMBER() OVER (ORDER BY ...)` column and a
/// range filter one level up.
pub struct SkipToRowNumberRewriter<'a> {
    language: &'a dyn QueryLanguage,
}

impl<'a> SkipToRowNumberRewriter<'a> {
    pub fn rewrite(language: &'a dyn QueryLanguage, plan: &ExprRef) -> PlanResult<ExprRef> {
        Rewriter::rewrite(&mut SkipToRowNumberRewriter { language }, plan)
    }

    fn number_rows(&self, select: &SelectExpr, skip: &ExprRef) -> SelectExpr {
        let int_type = self.language.column_type(&ValueType::Int);
        let mut numbered = select.clone().with_skip(None).with_take(None).with_order_by(Vec::new());
        let mut ordering = select.order_by.clone();

        // Distinct and grouped rows are numbered one level up.
        if select.distinct || select.has_group_by() {
            let inner_alias = TableAlias::fresh();
            ordering = ordering
                .into_iter()
                .map(|o| {
                    let ty = o.expr.value_type();
                    let sql_type = self.language.column_type(&ty);
                    let name = match numbered.columns.iter().find(|d| d.expr == o.expr) {
                        Some(decl) => decl.name.clone(),
                        None => numbered.add_column("ord", o.expr.clone(), sql_type),
                    };
                    OrderExpr::new(o.direction, Expr::column(inner_alias, name, ty, sql_type))
                })
                .collect();
            numbered = numbered.add_redundant_select(inner_alias);
        }

        let row_number = numbered.add_column("rownum", Expr::RowNumber { order_by: ordering }.into_ref(), int_type);
        let numbered_alias = TableAlias::fresh();
        let outer = numbered.add_redundant_select(numbered_alias).remove_column(&row_number);
        let rn = Expr::column(numbered_alias, row_number, ValueType::Int, int_type);

        let window = match &select.take {
            Some(take) => Expr::Between { expr: rn.clone(), lower: add(skip, &Expr::int(1)), upper: add(skip, take) }.into_ref(),
            None => Expr::binary(BinaryOp::GreaterThan, rn.clone(), skip.clone()),
        };
        outer.with_filter(Some(window)).with_order_by(vec![OrderExpr::new(OrderDirection::Ascending, rn)])
    }
}

/// `a + b`, folded when both sides are integer literals.
fn add(a: &ExprRef, b: &ExprRef) -> ExprRef {
    match (&**a, &**b) {
        (Expr::Constant { value: Value::Int(x), .. }, Expr::Constant { value: Value::Int(y), .. }) => Expr::int(x + y),
        _ => Expr::binary(BinaryOp::Add, a.clone(), b.clone()),
    }
}

impl Rewriter for SkipToRowNumberRewriter<'_> {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        let rewritten = self.rewrite_children(expr)?;
        match &*rewritten {
            Expr::Select(select) => match &select.skip {
                Some(skip) => Ok(self.number_rows(select, skip).into_ref()),
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
    use crate::expr::walk;
    use crate::fixtures::{int_column, passthrough, table};

    fn paged(skip: i64, take: Option<i64>) -> (TableAlias, ExprRef) {
        let (t, s) = (TableAlias::fresh(), TableAlias::fresh());
        let select = SelectExpr::new(s, vec![passthrough(t, "id"), passthrough(t, "zone")], Some(table(t, "orders")), None)
            .with_order_by(vec![OrderExpr::new(OrderDirection::Ascending, int_column(t, "id"))])
            .with_skip(Some(Expr::int(skip)))
            .with_take(take.map(Expr::int));
        (s, select.into_ref())
    }

    #[test]
    fn skip_and_take_become_row_number_window() {
        let dialect = StandardDialect::row_number();
        let (alias, plan) = paged(10, Some(5));
        let rewritten = SkipToRowNumberRewriter::rewrite(&dialect, &plan).unwrap();

        let outer = expect_select(&rewritten).unwrap();
        assert_eq!(outer.alias, alias);
        assert!(outer.skip.is_none() && outer.take.is_none());
        assert_eq!(outer.columns.len(), 2);
        let Some(Expr::Between { lower, upper, .. }) = outer.filter.as_deref() else {
            panic!("expected a range filter, got {:?}", outer.filter);
        };
        assert_eq!(lower, &Expr::int(11));
        assert_eq!(upper, &Expr::int(15));

        let numbered = expect_select(outer.from.as_ref().unwrap()).unwrap();
        let row_number = numbered.column("rownum").unwrap();
        assert!(matches!(&*row_number.expr, Expr::RowNumber { order_by } if order_by.len() == 1));
        assert!(!numbered.has_order_by());
    }

    #[test]
    fn skip_without_take_filters_above_offset() {
        let dialect = StandardDialect::row_number();
        let (_, plan) = paged(3, None);
        let rewritten = SkipToRowNumberRewriter::rewrite(&dialect, &plan).unwrap();
        let outer = expect_select(&rewritten).unwrap();
        assert!(matches!(outer.filter.as_deref(), Some(Expr::Binary { op: BinaryOp::GreaterThan, .. })));
    }

    #[test]
    fn select_without_skip_is_untouched() {
        let dialect = StandardDialect::row_number();
        let t = TableAlias::fresh();
        let plan = SelectExpr::new(TableAlias::fresh(), vec![passthrough(t, "id")], Some(table(t, "orders")), None)
            .with_take(Some(Expr::int(3)))
            .into_ref();
        let rewritten = SkipToRowNumberRewriter::rewrite(&dialect, &plan).unwrap();
        assert!(std::sync::Arc::ptr_eq(&plan, &rewritten));
        let mut numbered = 0;
        walk(&rewritten, &mut |e| numbered += matches!(&**e, Expr::RowNumber { .. }) as usize);
        assert_eq!(numbered, 0);
    }
}
