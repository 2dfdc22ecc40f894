use std::collections::{HashMap, HashSet};

use crate::error::{PlanError, PlanResult};
use crate::expr::{
    has_aggregates, map_select_children, transform_up, Expr, ExprRef, Rewriter, SelectExpr, TableAlias,
};

/// Removes selects that only pass their source's columns through, then
/// merges selects into their source where the clauses allow it.
pub struct RedundantSubqueryRemover;

impl RedundantSubqueryRemover {
    pub fn rewrite(plan: &ExprRef) -> PlanResult<ExprRef> {
        let plan = transform_up(plan, &mut |e| match &**e {
            Expr::Select(select) => {
                let mut redundant = Vec::new();
                if let Some(from) = &select.from {
                    gather_redundant(from, &mut redundant);
                }
                if redundant.is_empty() {
                    return Ok(None);
                }
                SubqueryRemover::remove(e, &redundant).map(Some)
            }
            Expr::Projection(p) => match p.select.as_select() {
                Some(select) if is_redundant(select) && select.from.as_ref().is_some_and(|f| f.as_select().is_some()) => {
                    SubqueryRemover::remove(e, &[p.select.clone()]).map(Some)
                }
                _ => Ok(None),
            },
            _ => Ok(None),
        })?;
        SubqueryMerger::merge(&plan)
    }
}

/// Every column is a plain reference under its own name.
pub fn is_simple_projection(select: &SelectExpr) -> bool {
    select.columns.iter().all(|d| matches!(&*d.expr, Expr::Column(c) if c.name == d.name))
}

/// Each column reads the same-named column at the same position of the
/// `FROM` select.
pub fn is_name_map_projection(select: &SelectExpr) -> bool {
    let Some(from) = select.from.as_ref().and_then(|f| f.as_select()) else {
        return false;
    };
    select.columns.len() == from.columns.len()
        && select
            .columns
            .iter()
            .zip(&from.columns)
            .all(|(d, f)| matches!(&*d.expr, Expr::Column(c) if c.name == f.name))
}

fn is_redundant(select: &SelectExpr) -> bool {
    select.from.is_some()
        && (is_simple_projection(select) || is_name_map_projection(select))
        && !select.distinct
        && !select.reverse
        && select.take.is_none()
        && select.skip.is_none()
        && select.filter.is_none()
        && select.order_by.is_empty()
        && select.group_by.is_empty()
}

fn gather_redundant(source: &ExprRef, out: &mut Vec<ExprRef>) {
    match &**source {
        Expr::Select(select) if is_redundant(select) => out.push(source.clone()),
        Expr::Join(join) => {
            gather_redundant(&join.left, out);
            gather_redundant(&join.right, out);
        }
        _ => {}
    }
}

/// Splices the given selects out of a tree, replacing each with its own
/// `FROM` and resolving references to its columns to their definitions.
pub struct SubqueryRemover {
    removed: HashSet<TableAlias>,
    columns: HashMap<TableAlias, HashMap<String, ExprRef>>,
}

impl SubqueryRemover {
    pub fn remove(expr: &ExprRef, selects: &[ExprRef]) -> PlanResult<ExprRef> {
        let mut remover = SubqueryRemover { removed: HashSet::new(), columns: HashMap::new() };
        for select in selects.iter().filter_map(|s| s.as_select()) {
            remover.removed.insert(select.alias);
            remover
                .columns
                .insert(select.alias, select.columns.iter().map(|c| (c.name.clone(), c.expr.clone())).collect());
        }
        Rewriter::rewrite(&mut remover, expr)
    }
}

impl Rewriter for SubqueryRemover {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        match &**expr {
            Expr::Select(select) if self.removed.contains(&select.alias) => match &select.from {
                Some(from) => self.rewrite(from),
                None => Err(PlanError::internal("cannot remove a select without a source")),
            },
            Expr::Column(c) => match self.columns.get(&c.alias) {
                Some(names) => match names.get(&c.name) {
                    Some(definition) => {
                        let definition = definition.clone();
                        self.rewrite(&definition)
                    }
                    None => Err(PlanError::internal(format!("reference to undefined column {}", c.name))),
                },
                None => Ok(expr.clone()),
            },
            _ => self.rewrite_children(expr),
        }
    }
}

/// Folds a select into the left-most select of its `FROM` when the two
/// sets of clauses compose into one.
struct SubqueryMerger {
    top_level: bool,
}

impl SubqueryMerger {
    fn merge(plan: &ExprRef) -> PlanResult<ExprRef> {
        Rewriter::rewrite(&mut SubqueryMerger { top_level: true }, plan)
    }
}

impl Rewriter for SubqueryMerger {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        let Expr::Select(select) = &**expr else {
            return self.rewrite_children(expr);
        };
        let was_top_level = std::mem::replace(&mut self.top_level, false);
        let mut current = match map_select_children(select, |c| self.rewrite(c))? {
            Some(rebuilt) => rebuilt.into_ref(),
            None => expr.clone(),
        };
        loop {
            let Some(select) = current.as_select() else { break };
            let Some(from) = select.from.as_ref().and_then(left_most_select) else { break };
            if !can_merge_with_from(select, &from, was_top_level) {
                break;
            }
            let Some(from_select) = from.as_select() else { break };
            let merged = SubqueryRemover::remove(&current, &[from.clone()])?;
            let Some(merged_select) = merged.as_select() else { break };
            let filter = match (&from_select.filter, &merged_select.filter) {
                (Some(inner), Some(outer)) => Some(Expr::and(inner.clone(), outer.clone())),
                (Some(inner), None) => Some(inner.clone()),
                (None, outer) => outer.clone(),
            };
            let order_by = if merged_select.has_order_by() { merged_select.order_by.clone() } else { from_select.order_by.clone() };
            let group_by = if merged_select.has_group_by() { merged_select.group_by.clone() } else { from_select.group_by.clone() };
            let skip = merged_select.skip.clone().or_else(|| from_select.skip.clone());
            let take = merged_select.take.clone().or_else(|| from_select.take.clone());
            let distinct = merged_select.distinct || from_select.distinct;
            current = SelectExpr { filter, order_by, group_by, skip, take, distinct, ..merged_select.clone() }.into_ref();
        }
        Ok(current)
    }
}

fn left_most_select(source: &ExprRef) -> Option<ExprRef> {
    match &**source {
        Expr::Select(_) => Some(source.clone()),
        Expr::Join(join) => left_most_select(&join.left),
        _ => None,
    }
}

fn is_column_projection(select: &SelectExpr) -> bool {
    select.columns.iter().all(|d| matches!(&*d.expr, Expr::Column(_) | Expr::Constant { .. }))
}

fn can_merge_with_from(select: &SelectExpr, from: &ExprRef, is_top_level: bool) -> bool {
    let Some(from) = from.as_select() else { return false };
    if !is_column_projection(from) {
        return false;
    }
    let name_map = is_name_map_projection(select);
    let sel_order = select.has_order_by();
    let sel_group = select.has_group_by();
    let sel_aggregates = has_aggregates(select);
    let sel_join = select.from.as_ref().is_some_and(|f| f.as_join().is_some());
    let sel_filter = select.filter.is_some();
    let from_order = from.has_order_by();
    let from_group = from.has_group_by();
    let from_aggregates = has_aggregates(from);

    if sel_order && from_order {
        return false;
    }
    if sel_group && from_group {
        return false;
    }
    if select.reverse || from.reverse {
        return false;
    }
    if from_order && (sel_group || sel_aggregates || select.distinct) {
        return false;
    }
    if from_group {
        return false;
    }
    // A filter above paging must stay above it.
    if from.take.is_some()
        && (select.take.is_some() || select.skip.is_some() || select.distinct || sel_aggregates || sel_group || sel_join || sel_filter)
    {
        return false;
    }
    if from.skip.is_some() && (select.skip.is_some() || select.distinct || sel_aggregates || sel_group || sel_join || sel_filter) {
        return false;
    }
    if from.distinct
        && (select.take.is_some()
            || select.skip.is_some()
            || !name_map
            || sel_group
            || sel_aggregates
            || (sel_order && !is_top_level)
            || sel_join)
    {
        return false;
    }
    if from_aggregates && (select.take.is_some() || select.skip.is_some() || select.distinct || sel_aggregates || sel_group || sel_join) {
        return false;
    }
    true
}
