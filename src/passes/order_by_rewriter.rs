use std::collections::HashSet;
use std::sync::Arc;

use crate::dialect::QueryLanguage;
use crate::error::{PlanError, PlanResult};
use crate::expr::{
    available_column_name, declared_aliases, expect_select, has_aggregates, map_children, ColumnDeclaration, Expr,
    ExprRef, JoinExpr, OrderExpr, Rewriter, TableAlias,
};

/// Lifts orderings of inner selects to the outermost select, or to the
/// nearest select that pages. Orderings under a group-by, distinct or
/// aggregate select are dropped; reverse flags flip what has been gathered
/// and fail when nothing was.
pub struct OrderByRewriter<'a> {
    language: &'a dyn QueryLanguage,
    gathered: Option<Vec<OrderExpr>>,
    is_outer_most: bool,
}

impl<'a> OrderByRewriter<'a> {
    pub fn rewrite(language: &'a dyn QueryLanguage, plan: &ExprRef) -> PlanResult<ExprRef> {
        let mut rewriter = OrderByRewriter { language, gathered: None, is_outer_most: true };
        Rewriter::rewrite(&mut rewriter, plan)
    }

    fn prepend(&mut self, orderings: Vec<OrderExpr>) {
        if orderings.is_empty() {
            return;
        }
        let mut merged = orderings;
        merged.extend(self.gathered.take().unwrap_or_default());
        let mut seen = HashSet::new();
        merged.retain(|o| match o.expr.as_column() {
            Some(c) => seen.insert((c.alias, c.name.clone())),
            None => true,
        });
        self.gathered = Some(merged);
    }

    fn reverse(&mut self) {
        if let Some(gathered) = &mut self.gathered {
            for ordering in gathered.iter_mut() {
                ordering.direction = ordering.direction.reversed();
            }
        }
    }

    /// Re-expresses orderings over `produced` aliases as references to
    /// columns of the select named `alias`, declaring missing columns.
    /// Orderings on anything outside `produced` cannot travel further.
    fn rebind(
        &self,
        orderings: Vec<OrderExpr>,
        alias: TableAlias,
        produced: &HashSet<TableAlias>,
        mut columns: Vec<ColumnDeclaration>,
    ) -> (Vec<ColumnDeclaration>, Vec<OrderExpr>) {
        let mut rebound = Vec::with_capacity(orderings.len());
        for ordering in orderings {
            let column = ordering.expr.as_column();
            if column.is_some_and(|c| !produced.contains(&c.alias)) {
                continue;
            }
            let existing = columns.iter().find(|decl| {
                decl.expr == ordering.expr
                    || matches!((column, decl.expr.as_column()), (Some(c), Some(d)) if c.key() == d.key())
            });
            let reference = match existing {
                Some(decl) => Expr::column(alias, decl.name.clone(), ordering.expr.value_type(), decl.sql_type),
                None => {
                    let sql_type = match column {
                        Some(c) => c.sql_type,
                        None => self.language.column_type(&ordering.expr.value_type()),
                    };
                    let base = column.map_or_else(|| format!("c{}", columns.len()), |c| c.name.clone());
                    let name = available_column_name(&columns, &base);
                    columns.push(ColumnDeclaration::new(name.clone(), ordering.expr.clone(), sql_type));
                    Expr::column(alias, name, ordering.expr.value_type(), sql_type)
                }
            };
            rebound.push(OrderExpr::new(ordering.direction, reference));
        }
        (columns, rebound)
    }

    fn rewrite_select(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        let outer_most = std::mem::replace(&mut self.is_outer_most, false);
        let result = self.rewrite_select_clauses(expr, outer_most);
        self.is_outer_most = outer_most;
        result
    }

    fn rewrite_select_clauses(&mut self, expr: &ExprRef, outer_most: bool) -> PlanResult<ExprRef> {
        let rewritten = self.rewrite_children(expr)?;
        let select = expect_select(&rewritten)?;

        let has_group_by = select.has_group_by();
        let can_have_order_by = outer_most || select.has_paging();
        let can_receive = can_have_order_by && !has_group_by && !select.distinct && !has_aggregates(select);

        if select.has_order_by() {
            self.prepend(select.order_by.clone());
        }
        if select.reverse {
            if self.gathered.as_ref().is_none_or(|g| g.is_empty()) {
                let construct = if select.take.is_some() { "Last" } else { "Reverse" };
                return Err(PlanError::unsupported(construct, "the sequence has no ordering to reverse"));
            }
            self.reverse();
        }

        let order_by = if can_receive {
            self.gathered.clone().unwrap_or_default()
        } else if can_have_order_by {
            select.order_by.clone()
        } else {
            Vec::new()
        };

        let can_pass_on = !outer_most && !has_group_by && !select.distinct;
        let mut columns = select.columns.clone();
        if let Some(gathered) = self.gathered.take() {
            if can_pass_on {
                let produced = select.from.as_deref().map(declared_aliases).unwrap_or_default();
                let (rebound_columns, rebound) = self.rebind(gathered, select.alias, &produced, columns);
                columns = rebound_columns;
                self.prepend(rebound);
            }
        }

        if order_by == select.order_by && columns == select.columns && !select.reverse {
            return Ok(rewritten);
        }
        Ok(select.clone().with_columns(columns).with_order_by(order_by).with_reverse(false).into_ref())
    }

    fn rewrite_join(&mut self, expr: &ExprRef, join: &JoinExpr) -> PlanResult<ExprRef> {
        let left = self.rewrite(&join.left)?;
        let left_orderings = self.gathered.take();
        let right = self.rewrite(&join.right)?;
        self.prepend(left_orderings.unwrap_or_default());
        let condition = join.condition.as_ref().map(|c| self.rewrite(c)).transpose()?;

        let unchanged = Arc::ptr_eq(&left, &join.left)
            && Arc::ptr_eq(&right, &join.right)
            && match (&condition, &join.condition) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
        if unchanged {
            return Ok(expr.clone());
        }
        Ok(Expr::Join(JoinExpr { kind: join.kind, left, right, condition }).into_ref())
    }

    /// Rewrites the children under a fresh ordering scope.
    fn scoped(&mut self, outer_most: bool, expr: &ExprRef) -> PlanResult<ExprRef> {
        let gathered = self.gathered.take();
        let saved = std::mem::replace(&mut self.is_outer_most, outer_most);
        let result = map_children(expr, |child| self.rewrite(child));
        self.gathered = gathered;
        self.is_outer_most = saved;
        result
    }
}

impl Rewriter for OrderByRewriter<'_> {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        match &**expr {
            Expr::Select(_) => self.rewrite_select(expr),
            Expr::Join(join) => self.rewrite_join(expr, join),
            // Nested projections run as their own queries.
            Expr::Projection(_) => self.scoped(true, expr),
            Expr::Scalar { .. } | Expr::Exists { .. } | Expr::In { .. } => self.scoped(false, expr),
            _ => self.rewrite_children(expr),
        }
    }
}
