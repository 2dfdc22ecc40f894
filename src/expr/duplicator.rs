use std::collections::{HashMap, HashSet};

use crate::error::PlanResult;
use crate::expr::{all_declared_aliases, transform_up, ColumnExpr, Expr, ExprRef, SelectExpr, SetOperationExpr, TableAlias, TableExpr};

/// Deep copy of a plan in which every alias the plan declares is replaced
/// by a fresh one. References to aliases declared outside the plan are left
/// alone, so a duplicated correlated subquery still correlates.
pub struct QueryDuplicator {
    renames: HashMap<TableAlias, TableAlias>,
}

impl QueryDuplicator {
    pub fn duplicate(expr: &ExprRef) -> PlanResult<ExprRef> {
        let renames = all_declared_aliases(expr).into_iter().map(|a| (a, TableAlias::fresh())).collect();
        QueryDuplicator { renames }.run(expr)
    }

    /// Like [`QueryDuplicator::duplicate`], also returning the alias map.
    pub fn duplicate_with_map(expr: &ExprRef) -> PlanResult<(ExprRef, HashMap<TableAlias, TableAlias>)> {
        let renames: HashMap<_, _> = all_declared_aliases(expr).into_iter().map(|a| (a, TableAlias::fresh())).collect();
        let out = QueryDuplicator { renames: renames.clone() }.run(expr)?;
        Ok((out, renames))
    }

    fn run(&self, expr: &ExprRef) -> PlanResult<ExprRef> {
        let rename = |a: TableAlias| self.renames.get(&a).copied();
        transform_up(expr, &mut |e: &ExprRef| {
            Ok(match &**e {
                Expr::Table(t) => rename(t.alias).map(|alias| Expr::Table(TableExpr { alias, ..t.clone() }).into_ref()),
                Expr::SetOperation(s) => {
                    rename(s.alias).map(|alias| Expr::SetOperation(SetOperationExpr { alias, ..s.clone() }).into_ref())
                }
                Expr::Select(s) => rename(s.alias).map(|alias| SelectExpr { alias, ..s.clone() }.into_ref()),
                Expr::Column(c) => rename(c.alias).map(|alias| Expr::Column(ColumnExpr { alias, ..c.clone() }).into_ref()),
                _ => None,
            })
        })
    }
}

/// Redirects every column that references one of `old_aliases` to
/// `new_alias`, keeping the column name.
pub struct ColumnMapper;

impl ColumnMapper {
    pub fn map(expr: &ExprRef, new_alias: TableAlias, old_aliases: &HashSet<TableAlias>) -> PlanResult<ExprRef> {
        transform_up(expr, &mut |e: &ExprRef| {
            Ok(match &**e {
                Expr::Column(c) if old_aliases.contains(&c.alias) => {
                    Some(Expr::Column(ColumnExpr { alias: new_alias, ..c.clone() }).into_ref())
                }
                _ => None,
            })
        })
    }
}
