use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::PlanResult;
use crate::expr::{
    map_children, ColumnDeclaration, ClientJoinExpr, Expr, ExprRef, InSource, JoinExpr, JoinKind, OrderExpr,
    ProjectionExpr, SelectExpr, SetOperationExpr, SetOperationKind, TableAlias,
};

/// Drops column declarations nothing above them reads.
///
/// Consumers are visited before producers: a projection's projector before
/// its select, a select's columns before its clauses and its `FROM`.
#[derive(Default)]
pub struct UnusedColumnRemover {
    used: HashMap<TableAlias, HashSet<String>>,
    retain_all: bool,
}

impl UnusedColumnRemover {
    pub fn rewrite(plan: &ExprRef) -> PlanResult<ExprRef> {
        UnusedColumnRemover::default().visit(plan)
    }

    fn mark(&mut self, alias: TableAlias, name: &str) {
        self.used.entry(alias).or_default().insert(name.to_string());
    }

    fn is_used(&self, alias: TableAlias, name: &str) -> bool {
        self.used.get(&alias).is_some_and(|names| names.contains(name))
    }

    fn any_used(&self, alias: TableAlias) -> bool {
        self.used.get(&alias).is_some_and(|names| !names.is_empty())
    }

    fn mark_first_column(&mut self, select: &ExprRef) {
        if let Some(s) = select.as_select() {
            if let Some(first) = s.columns.first() {
                self.mark(s.alias, &first.name);
            }
        }
    }

    fn visit(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        match &**expr {
            Expr::Column(c) => {
                self.mark(c.alias, &c.name);
                Ok(expr.clone())
            }
            Expr::Scalar { select, .. } | Expr::In { source: InSource::Select(select), .. } => {
                self.mark_first_column(select);
                map_children(expr, |c| self.visit(c))
            }
            Expr::Aggregate(a) => {
                if a.is_row_count() {
                    self.retain_all = true;
                }
                map_children(expr, |c| self.visit(c))
            }
            Expr::Select(select) => self.visit_select(expr, select),
            Expr::Projection(p) => {
                let projector = self.visit(&p.projector)?;
                let select = self.visit(&p.select)?;
                if Arc::ptr_eq(&projector, &p.projector) && Arc::ptr_eq(&select, &p.select) {
                    return Ok(expr.clone());
                }
                Ok(Expr::Projection(ProjectionExpr { select, projector, ..p.clone() }).into_ref())
            }
            Expr::ClientJoin(cj) => {
                let inner_key = self.visit_all(&cj.inner_key)?;
                let outer_key = self.visit_all(&cj.outer_key)?;
                let projection = self.visit(&cj.projection)?;
                Ok(Expr::ClientJoin(ClientJoinExpr { projection, outer_key, inner_key }).into_ref())
            }
            Expr::Join(join) => self.visit_join(expr, join),
            Expr::SetOperation(set) => self.visit_set_operation(set),
            _ => map_children(expr, |c| self.visit(c)),
        }
    }

    fn visit_all(&mut self, exprs: &[ExprRef]) -> PlanResult<Vec<ExprRef>> {
        exprs.iter().map(|e| self.visit(e)).collect()
    }

    fn visit_opt(&mut self, expr: &Option<ExprRef>) -> PlanResult<Option<ExprRef>> {
        expr.as_ref().map(|e| self.visit(e)).transpose()
    }

    fn visit_select(&mut self, expr: &ExprRef, select: &SelectExpr) -> PlanResult<ExprRef> {
        let was_retained = std::mem::replace(&mut self.retain_all, false);
        let mut changed = false;
        let mut columns = Vec::with_capacity(select.columns.len());
        for decl in &select.columns {
            if was_retained || select.distinct || self.is_used(select.alias, &decl.name) {
                let e = self.visit(&decl.expr)?;
                changed |= !Arc::ptr_eq(&e, &decl.expr);
                columns.push(ColumnDeclaration { expr: e, ..decl.clone() });
            } else {
                changed = true;
            }
        }
        let take = self.visit_opt(&select.take)?;
        let skip = self.visit_opt(&select.skip)?;
        let group_by = self.visit_all(&select.group_by)?;
        let order_by = select
            .order_by
            .iter()
            .map(|o| Ok(OrderExpr::new(o.direction, self.visit(&o.expr)?)))
            .collect::<PlanResult<Vec<_>>>()?;
        let filter = self.visit_opt(&select.filter)?;
        let from = self.visit_opt(&select.from)?;
        self.used.remove(&select.alias);
        self.retain_all = was_retained;

        changed |= !same_opt(&take, &select.take)
            || !same_opt(&skip, &select.skip)
            || !same_opt(&filter, &select.filter)
            || !same_opt(&from, &select.from)
            || group_by.iter().zip(&select.group_by).any(|(a, b)| !Arc::ptr_eq(a, b))
            || order_by.iter().zip(&select.order_by).any(|(a, b)| !Arc::ptr_eq(&a.expr, &b.expr));
        if !changed {
            return Ok(expr.clone());
        }
        Ok(SelectExpr { columns, from, filter, order_by, group_by, skip, take, ..select.clone() }.into_ref())
    }

    fn visit_join(&mut self, expr: &ExprRef, join: &JoinExpr) -> PlanResult<ExprRef> {
        if join.kind == JoinKind::SingletonLeftOuter {
            if let Some(alias) = join.right.declared_alias() {
                if !self.any_used(alias) {
                    return self.visit(&join.left);
                }
            }
        }
        let condition = self.visit_opt(&join.condition)?;
        let right = self.visit(&join.right)?;
        let left = self.visit(&join.left)?;
        if same_opt(&condition, &join.condition) && Arc::ptr_eq(&left, &join.left) && Arc::ptr_eq(&right, &join.right) {
            return Ok(expr.clone());
        }
        Ok(Expr::Join(JoinExpr { kind: join.kind, left, right, condition }).into_ref())
    }

    /// Both operands must keep identical column lists; a distinct union
    /// keeps every column since each one takes part in duplicate removal.
    fn visit_set_operation(&mut self, set: &SetOperationExpr) -> PlanResult<ExprRef> {
        let sides = [&set.left, &set.right];
        let distinct = matches!(set.kind, SetOperationKind::Union);
        for side in sides {
            if let Some(s) = side.as_select() {
                for decl in &s.columns {
                    if distinct || self.is_used(set.alias, &decl.name) {
                        self.mark(s.alias, &decl.name);
                    }
                }
            }
        }
        self.used.remove(&set.alias);
        let left = self.visit(&set.left)?;
        let right = self.visit(&set.right)?;
        Ok(Expr::SetOperation(SetOperationExpr { kind: set.kind, alias: set.alias, left, right }).into_ref())
    }
}

fn same_opt(a: &Option<ExprRef>, b: &Option<ExprRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
