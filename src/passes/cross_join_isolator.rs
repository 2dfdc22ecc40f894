use std::collections::HashMap;

use crate::error::PlanResult;
use crate::expr::{
    available_column_name, declared_aliases, expect_projection, referenced_columns, ColumnDeclaration, ColumnExpr,
    Expr, ExprRef, JoinExpr, JoinKind, Rewriter, SelectExpr, TableAlias,
};

/// Keeps cross joins and conditional joins from being direct siblings. A
/// join whose kind disagrees with its parent join is wrapped in a select
/// that exposes the columns read above it, and those reads are remapped.
pub struct CrossJoinIsolator {
    /// Columns read by the enclosing select or projector, by alias.
    referenced: HashMap<TableAlias, Vec<ColumnExpr>>,
    remapped: HashMap<(TableAlias, String), ExprRef>,
    parent_join: Option<JoinKind>,
}

fn by_alias(columns: Vec<ColumnExpr>) -> HashMap<TableAlias, Vec<ColumnExpr>> {
    let mut grouped: HashMap<TableAlias, Vec<ColumnExpr>> = HashMap::new();
    for column in columns {
        grouped.entry(column.alias).or_default().push(column);
    }
    grouped
}

impl CrossJoinIsolator {
    pub fn rewrite(plan: &ExprRef) -> PlanResult<ExprRef> {
        let mut isolator = CrossJoinIsolator { referenced: HashMap::new(), remapped: HashMap::new(), parent_join: None };
        Rewriter::rewrite(&mut isolator, plan)
    }

    fn scoped(&mut self, expr: &ExprRef, referenced: Vec<ColumnExpr>) -> PlanResult<ExprRef> {
        let saved = std::mem::replace(&mut self.referenced, by_alias(referenced));
        let parent = self.parent_join.take();
        let result = self.rewrite_children(expr);
        self.referenced = saved;
        self.parent_join = parent;
        result
    }

    fn rewrite_join(&mut self, expr: &ExprRef, kind: JoinKind) -> PlanResult<ExprRef> {
        let parent = self.parent_join.replace(kind);
        let rewritten = self.rewrite_children(expr);
        self.parent_join = parent;
        let rewritten = rewritten?;
        match parent {
            Some(parent) if (kind == JoinKind::Cross) != (parent == JoinKind::Cross) => Ok(self.isolate(rewritten)),
            _ => Ok(rewritten),
        }
    }

    fn isolate(&mut self, source: ExprRef) -> ExprRef {
        let alias = TableAlias::fresh();
        let mut columns: Vec<ColumnDeclaration> = Vec::new();
        for declared in declared_aliases(&source) {
            for column in self.referenced.get(&declared).into_iter().flatten() {
                let name = available_column_name(&columns, &column.name);
                columns.push(ColumnDeclaration::new(name.clone(), Expr::Column(column.clone()).into_ref(), column.sql_type));
                let reference = Expr::column(alias, name, column.ty.clone(), column.sql_type);
                self.remapped.insert((column.alias, column.name.clone()), reference);
            }
        }
        SelectExpr::new(alias, columns, Some(source), None).into_ref()
    }
}

impl Rewriter for CrossJoinIsolator {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        match &**expr {
            Expr::Projection(_) => {
                let referenced = referenced_columns(&expect_projection(expr)?.projector);
                self.scoped(expr, referenced)
            }
            Expr::Select(_) => {
                let referenced = referenced_columns(expr);
                self.scoped(expr, referenced)
            }
            Expr::Join(JoinExpr { kind, .. }) => self.rewrite_join(expr, *kind),
            Expr::Column(c) => Ok(self.remapped.get(&(c.alias, c.name.clone())).cloned().unwrap_or_else(|| expr.clone())),
            _ => self.rewrite_children(expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{expect_select, referenced_aliases};
    use crate::fixtures::{int_column, passthrough, table};

    #[test]
    fn cross_join_under_inner_join_is_wrapped() {
        let (a, b, c) = (TableAlias::fresh(), TableAlias::fresh(), TableAlias::fresh());
        let cross = Expr::Join(JoinExpr { kind: JoinKind::Cross, left: table(a, "customers"), right: table(b, "orders"), condition: None })
            .into_ref();
        let condition = Expr::eq(int_column(a, "id"), int_column(c, "customer_id"));
        let inner = Expr::Join(JoinExpr { kind: JoinKind::Inner, left: cross, right: table(c, "orders"), condition: Some(condition) })
            .into_ref();
        let select = SelectExpr::new(TableAlias::fresh(), vec![passthrough(b, "zone"), passthrough(c, "total")], Some(inner), None)
            .into_ref();

        let plan = CrossJoinIsolator::rewrite(&select).unwrap();
        let outer = expect_select(&plan).unwrap();
        let join = outer.from.as_ref().and_then(|f| f.as_join().cloned()).unwrap();
        let wrapper = expect_select(&join.left).unwrap();
        assert!(matches!(wrapper.from.as_deref(), Some(Expr::Join(j)) if j.kind == JoinKind::Cross));
        assert_eq!(wrapper.columns.len(), 2);

        let outer_reads = referenced_aliases(&outer.columns[0].expr);
        assert_eq!(outer_reads.into_iter().collect::<Vec<_>>(), vec![wrapper.alias]);
        let condition_reads = referenced_aliases(join.condition.as_ref().unwrap());
        assert!(condition_reads.contains(&wrapper.alias) && condition_reads.contains(&c));
        assert!(!condition_reads.contains(&a));
    }

    #[test]
    fn uniform_joins_are_untouched() {
        let (a, b, c) = (TableAlias::fresh(), TableAlias::fresh(), TableAlias::fresh());
        let inner = Expr::Join(JoinExpr { kind: JoinKind::Cross, left: table(a, "customers"), right: table(b, "orders"), condition: None })
            .into_ref();
        let outer = Expr::Join(JoinExpr { kind: JoinKind::Cross, left: inner, right: table(c, "orders"), condition: None }).into_ref();
        let select = SelectExpr::new(TableAlias::fresh(), vec![passthrough(a, "id")], Some(outer), None).into_ref();
        let plan = CrossJoinIsolator::rewrite(&select).unwrap();
        assert!(std::sync::Arc::ptr_eq(&plan, &select));
    }
}
