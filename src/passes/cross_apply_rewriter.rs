use std::collections::HashSet;

use crate::binder::ColumnProjector;
use crate::dialect::QueryLanguage;
use crate::error::PlanResult;
use crate::expr::{
    declared_aliases, has_aggregates, referenced_aliases, Expr, ExprRef, JoinExpr, JoinKind, Rewriter, TableAlias,
};

/// Turns `CROSS APPLY` / `OUTER APPLY` into plain joins when the right side
/// correlates with the left only through its filter. The filter becomes
/// the join condition.
pub struct CrossApplyRewriter<'a> {
    language: &'a dyn QueryLanguage,
}

impl<'a> CrossApplyRewriter<'a> {
    pub fn rewrite(language: &'a dyn QueryLanguage, plan: &ExprRef) -> PlanResult<ExprRef> {
        Rewriter::rewrite(&mut CrossApplyRewriter { language }, plan)
    }

    fn decorrelate(&self, join: &JoinExpr) -> PlanResult<Option<ExprRef>> {
        let select = match &*join.right {
            Expr::Table(_) => {
                return Ok(Some(
                    Expr::Join(JoinExpr { kind: JoinKind::Cross, left: join.left.clone(), right: join.right.clone(), condition: None })
                        .into_ref(),
                ));
            }
            Expr::Select(select) => select,
            _ => return Ok(None),
        };
        // Anything that changes meaning once the filter moves out keeps the apply.
        if select.has_paging() || select.has_group_by() || select.distinct || has_aggregates(select) {
            return Ok(None);
        }

        let unfiltered = select.clone().with_filter(None);
        let left_aliases = declared_aliases(&join.left);
        let unfiltered_ref = unfiltered.clone().into_ref();
        if referenced_aliases(&unfiltered_ref).iter().any(|a| left_aliases.contains(a)) {
            return Ok(None);
        }

        let (right, condition) = match &select.filter {
            None => (unfiltered_ref, None),
            Some(filter) => {
                let scope: HashSet<TableAlias> = unfiltered.from.as_deref().map(declared_aliases).unwrap_or_default();
                let pc = ColumnProjector::project(self.language, filter, &unfiltered.columns, unfiltered.alias, &scope)?;
                (unfiltered.with_columns(pc.columns).into_ref(), Some(pc.projector))
            }
        };
        let kind = match (&condition, join.kind) {
            (None, _) => JoinKind::Cross,
            (Some(_), JoinKind::OuterApply) => JoinKind::LeftOuter,
            (Some(_), _) => JoinKind::Inner,
        };
        Ok(Some(Expr::Join(JoinExpr { kind, left: join.left.clone(), right, condition }).into_ref()))
    }
}

impl Rewriter for CrossApplyRewriter<'_> {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        let rewritten = self.rewrite_children(expr)?;
        match &*rewritten {
            Expr::Join(join) if matches!(join.kind, JoinKind::CrossApply | JoinKind::OuterApply) => {
                Ok(self.decorrelate(join)?.unwrap_or(rewritten))
            }
            _ => Ok(rewritten),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::QueryBinder;
    use crate::dialect::StandardDialect;
    use crate::expr::{expect_projection, expect_select, walk};
    use crate::fixtures::{self, member};
    use crate::model::ValueType;
    use crate::query::{Lambda, QueryBuilder};

    fn orders_of_customer(limit: Option<i64>, default_if_empty: bool) -> QueryBuilder {
        let mut orders = QueryBuilder::source("Order").filter(Lambda::new(
            "o",
            Expr::eq(member("o", "Order", "CustomerId", ValueType::Int), member("c", "Customer", "Id", ValueType::Int)),
        ));
        if let Some(n) = limit {
            orders = orders.take(Expr::int(n));
        }
        if default_if_empty {
            orders = orders.default_if_empty();
        }
        QueryBuilder::source("Customer").flat_map(Lambda::new("c", orders.into_expr()), None)
    }

    fn joins(query: QueryBuilder) -> Vec<JoinExpr> {
        let mapping = fixtures::mapping();
        let dialect = StandardDialect::ansi();
        let bound = QueryBinder::bind(&mapping, &dialect, &query.build()).unwrap();
        let plan = CrossApplyRewriter::rewrite(&dialect, &bound).unwrap();
        let mut found = Vec::new();
        walk(&expect_projection(&plan).unwrap().select, &mut |e| {
            if let Some(j) = e.as_join() {
                found.push(j.clone());
            }
        });
        found
    }

    #[test]
    fn filter_correlated_apply_becomes_inner_join() {
        let found = joins(orders_of_customer(None, false));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, JoinKind::Inner);
        let condition = found[0].condition.clone().unwrap();
        let right_alias = expect_select(&found[0].right).unwrap().alias;
        let aliases = referenced_aliases(&condition);
        assert!(aliases.contains(&right_alias));
        assert!(!referenced_aliases(&found[0].right).iter().any(|a| declared_aliases(&found[0].left).contains(a)));
    }

    #[test]
    fn outer_apply_becomes_left_outer_join() {
        let found = joins(orders_of_customer(None, true));
        assert_eq!(found[0].kind, JoinKind::LeftOuter);
    }

    #[test]
    fn apply_over_limited_source_is_kept() {
        let found = joins(orders_of_customer(Some(3), false));
        assert_eq!(found[0].kind, JoinKind::CrossApply);
    }
}
