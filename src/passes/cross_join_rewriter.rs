use std::collections::HashSet;
use std::sync::Arc;

use crate::error::PlanResult;
use crate::expr::{
    declared_aliases, expect_select, join_conjunction, map_select_children, referenced_aliases, split_conjunction, Expr,
    ExprRef, JoinExpr, JoinKind, Rewriter, SelectExpr, TableAlias,
};

/// Promotes filter conjuncts that relate both sides of a cross join into
/// its condition, turning it into an inner join.
pub struct CrossJoinRewriter {
    current_filter: Option<ExprRef>,
}

impl CrossJoinRewriter {
    pub fn rewrite(plan: &ExprRef) -> PlanResult<ExprRef> {
        Rewriter::rewrite(&mut CrossJoinRewriter { current_filter: None }, plan)
    }

    fn rewrite_select(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        let select = expect_select(expr)?;
        // The filter is rewritten first so that promoted and kept conjuncts
        // carry the rewrites made inside them.
        let filter = select.filter.as_ref().map(|f| self.rewrite(f)).transpose()?;
        let saved = std::mem::replace(&mut self.current_filter, filter);
        let without_filter = SelectExpr { filter: None, ..select.clone() };
        let rest = map_select_children(&without_filter, |child| self.rewrite(child));
        let remaining = std::mem::replace(&mut self.current_filter, saved);
        let rest = rest?;

        let filter_unchanged = match (&remaining, &select.filter) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if rest.is_none() && filter_unchanged {
            return Ok(expr.clone());
        }
        Ok(rest.unwrap_or(without_filter).with_filter(remaining).into_ref())
    }

    fn promote(&mut self, join: &JoinExpr) -> Option<ExprRef> {
        let filter = self.current_filter.as_ref()?;
        let left = declared_aliases(&join.left);
        let right = declared_aliases(&join.right);
        let (promoted, kept): (Vec<_>, Vec<_>) =
            split_conjunction(filter).into_iter().partition(|part| relates_both(part, &left, &right));
        let condition = join_conjunction(promoted)?;
        self.current_filter = join_conjunction(kept);
        Some(
            Expr::Join(JoinExpr { kind: JoinKind::Inner, left: join.left.clone(), right: join.right.clone(), condition: Some(condition) })
                .into_ref(),
        )
    }
}

/// Reads at least one alias of each side and nothing from elsewhere.
fn relates_both(part: &ExprRef, left: &HashSet<TableAlias>, right: &HashSet<TableAlias>) -> bool {
    let referenced = referenced_aliases(part);
    referenced.iter().any(|a| left.contains(a))
        && referenced.iter().any(|a| right.contains(a))
        && referenced.iter().all(|a| left.contains(a) || right.contains(a))
}

impl Rewriter for CrossJoinRewriter {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        match &**expr {
            Expr::Select(_) => self.rewrite_select(expr),
            Expr::Join(_) => {
                let rewritten = self.rewrite_children(expr)?;
                match &*rewritten {
                    Expr::Join(join) if join.kind == JoinKind::Cross => Ok(self.promote(join).unwrap_or(rewritten)),
                    _ => Ok(rewritten),
                }
            }
            _ => self.rewrite_children(expr),
        }
    }
}
