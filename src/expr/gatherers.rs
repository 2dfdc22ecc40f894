use std::collections::HashSet;

use crate::error::{PlanError, PlanResult};
use crate::expr::{children, walk, BinaryOp, ColumnExpr, Expr, ExprRef, SelectExpr, TableAlias};

/// Aliases a source expression makes visible to the select that owns it:
/// the select, table or set operation itself, or both sides of a join. Does
/// not look inside nested selects.
pub fn declared_aliases(source: &Expr) -> HashSet<TableAlias> {
    let mut aliases = HashSet::new();
    collect_declared(source, &mut aliases);
    aliases
}

fn collect_declared(source: &Expr, aliases: &mut HashSet<TableAlias>) {
    match source {
        Expr::Select(s) => {
            aliases.insert(s.alias);
        }
        Expr::Table(t) => {
            aliases.insert(t.alias);
        }
        Expr::SetOperation(s) => {
            aliases.insert(s.alias);
        }
        Expr::Join(j) => {
            collect_declared(&j.left, aliases);
            collect_declared(&j.right, aliases);
        }
        _ => {}
    }
}

/// Every alias declared anywhere in the tree.
pub fn all_declared_aliases(expr: &ExprRef) -> HashSet<TableAlias> {
    let mut aliases = HashSet::new();
    walk(expr, &mut |e| {
        if let Some(alias) = e.declared_alias() {
            aliases.insert(alias);
        }
    });
    aliases
}

/// Aliases of every column reference in the tree, nested selects included.
pub fn referenced_aliases(expr: &ExprRef) -> HashSet<TableAlias> {
    let mut aliases = HashSet::new();
    walk(expr, &mut |e| {
        if let Expr::Column(c) = &**e {
            aliases.insert(c.alias);
        }
    });
    aliases
}

/// Column references reachable without entering a nested select, each
/// once, in visiting order. If `expr` is itself a select, its own clauses
/// are searched.
pub fn referenced_columns(expr: &Expr) -> Vec<ColumnExpr> {
    let mut columns = Vec::new();
    let mut seen = HashSet::new();
    collect_columns(expr, true, &mut seen, &mut columns);
    columns
}

fn collect_columns(expr: &Expr, first: bool, seen: &mut HashSet<(TableAlias, String)>, columns: &mut Vec<ColumnExpr>) {
    match expr {
        Expr::Column(c) => {
            if seen.insert((c.alias, c.name.clone())) {
                columns.push(c.clone());
            }
        }
        Expr::Select(_) if !first => {}
        _ => {
            for child in children(expr) {
                collect_columns(child, false, seen, columns);
            }
        }
    }
}

/// Whether the select computes an aggregate in its own clauses.
pub fn has_aggregates(select: &SelectExpr) -> bool {
    fn visit(expr: &Expr) -> bool {
        match expr {
            Expr::Aggregate(_) => true,
            Expr::Select(_) | Expr::Scalar { .. } | Expr::Exists { .. } | Expr::In { .. } => false,
            _ => children(expr).into_iter().any(|c| visit(c)),
        }
    }
    select.columns.iter().any(|c| visit(&c.expr))
        || select.filter.as_deref().is_some_and(visit)
        || select.order_by.iter().any(|o| visit(&o.expr))
}

/// Whether any nested projection hides inside `expr`.
pub fn contains_projection(expr: &ExprRef) -> bool {
    let mut found = false;
    walk(expr, &mut |e| found |= matches!(&**e, Expr::Projection(_) | Expr::ClientJoin(_)));
    found
}

/// Checks that every column reference names an alias declared somewhere in
/// the same tree.
pub fn validate_aliases(root: &ExprRef) -> PlanResult<()> {
    let declared = all_declared_aliases(root);
    match referenced_aliases(root).into_iter().find(|alias| !declared.contains(alias)) {
        Some(alias) => Err(PlanError::internal(format!("column references undeclared alias {alias:?}"))),
        None => Ok(()),
    }
}

/// Splits a predicate into its top-level `AND` operands.
pub fn split_conjunction(predicate: &ExprRef) -> Vec<ExprRef> {
    match &**predicate {
        Expr::Binary { op: BinaryOp::And, left, right, .. } => {
            let mut out = split_conjunction(left);
            out.extend(split_conjunction(right));
            out
        }
        _ => vec![predicate.clone()],
    }
}

/// Left-deep `AND` of the operands; `None` for an empty list.
pub fn join_conjunction(predicates: impl IntoIterator<Item = ExprRef>) -> Option<ExprRef> {
    predicates.into_iter().reduce(Expr::and)
}

/// `existing AND extra`, treating a missing predicate as `true`.
pub fn and_also(existing: Option<&ExprRef>, extra: ExprRef) -> ExprRef {
    match existing {
        Some(e) => Expr::and(e.clone(), extra),
        None => extra,
    }
}
