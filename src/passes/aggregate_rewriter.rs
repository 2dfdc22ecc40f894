use std::collections::HashMap;
use std::sync::Arc;

use crate::dialect::QueryLanguage;
use crate::error::PlanResult;
use crate::expr::{map_select_children, walk, Expr, ExprRef, Rewriter, TableAlias};

/// Folds aggregates over a group's elements into the grouped select.
///
/// Each `AggregateSubquery` whose group select is reachable becomes a new
/// `aggN` column of that select plus a column reference at the use site;
/// anything left over falls back to its correlated scalar subquery.
pub struct AggregateRewriter<'a> {
    language: &'a dyn QueryLanguage,
    lookup: HashMap<TableAlias, Vec<ExprRef>>,
    map: HashMap<*const Expr, ExprRef>,
}

impl<'a> AggregateRewriter<'a> {
    pub fn rewrite(language: &'a dyn QueryLanguage, plan: &ExprRef) -> PlanResult<ExprRef> {
        let mut lookup: HashMap<TableAlias, Vec<ExprRef>> = HashMap::new();
        walk(plan, &mut |e| {
            if let Expr::AggregateSubquery(a) = &**e {
                lookup.entry(a.group_by_alias).or_default().push(e.clone());
            }
        });
        if lookup.is_empty() {
            return Ok(plan.clone());
        }
        let mut rewriter = AggregateRewriter { language, lookup, map: HashMap::new() };
        Rewriter::rewrite(&mut rewriter, plan)
    }
}

impl Rewriter for AggregateRewriter<'_> {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        if let Some(mapped) = self.map.get(&Arc::as_ptr(expr)) {
            return Ok(mapped.clone());
        }
        match &**expr {
            Expr::Select(select) => {
                let mut select = map_select_children(select, |c| self.rewrite(c))?.unwrap_or_else(|| select.clone());
                let Some(aggregates) = self.lookup.remove(&select.alias) else {
                    return Ok(select.into_ref());
                };
                for node in aggregates {
                    let Expr::AggregateSubquery(agg) = &*node else { continue };
                    let sql_type = self.language.column_type(&agg.ty);
                    let name = select.add_column("agg", agg.aggregate_in_group_select.clone(), sql_type);
                    let column = Expr::column(select.alias, name, agg.ty.clone(), sql_type);
                    self.map.insert(Arc::as_ptr(&node), column);
                }
                Ok(select.into_ref())
            }
            Expr::AggregateSubquery(agg) => self.rewrite(&agg.subquery),
            _ => self.rewrite_children(expr),
        }
    }
}
