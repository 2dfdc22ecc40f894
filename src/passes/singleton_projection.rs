use std::collections::HashSet;
use std::sync::Arc;

use crate::binder::ColumnProjector;
use crate::error::{PlanError, PlanResult};
use crate::expr::{
    expect_projection, expect_select, has_aggregates, ColumnMapper, Expr, ExprRef, JoinExpr, JoinKind,
    ProjectionExpr, Rewriter, SelectExpr, TableAlias,
};
use crate::passes::PassContext;

/// Folds nested projections that yield at most one row per outer row into
/// the enclosing select as an outer apply.
pub struct SingletonProjectionRewriter<'a> {
    ctx: PassContext<'a>,
    is_top_level: bool,
    current_select: Option<SelectExpr>,
    deferred: bool,
}

impl<'a> SingletonProjectionRewriter<'a> {
    pub fn rewrite(ctx: PassContext<'a>, plan: &ExprRef) -> PlanResult<ExprRef> {
        let mut rewriter = SingletonProjectionRewriter { ctx, is_top_level: true, current_select: None, deferred: false };
        Rewriter::rewrite(&mut rewriter, plan)
    }

    fn as_new_top_level(&mut self, f: impl FnOnce(&mut Self) -> PlanResult<ExprRef>) -> PlanResult<ExprRef> {
        let saved_top = std::mem::replace(&mut self.is_top_level, true);
        let saved_select = self.current_select.take();
        let result = f(self);
        self.is_top_level = saved_top;
        self.current_select = saved_select;
        result
    }

    fn rewrite_projection(&mut self, expr: &ExprRef, projection: &ProjectionExpr) -> PlanResult<ExprRef> {
        if self.is_top_level {
            self.is_top_level = false;
            let original = expect_select(&projection.select)?;
            let saved = self.current_select.replace(original.clone());
            let projector = self.rewrite(&projection.projector);
            let current = std::mem::replace(&mut self.current_select, saved);
            let projector = projector?;
            let current = current.ok_or_else(|| PlanError::internal("projection lost its select"))?;
            if Arc::ptr_eq(&projector, &projection.projector) && current == *original {
                return Ok(expr.clone());
            }
            return Ok(Expr::Projection(ProjectionExpr { select: current.into_ref(), projector, ..projection.clone() }).into_ref());
        }

        let joinable = projection.is_singleton && !self.deferred && self.current_select.as_ref().is_some_and(can_join_on_server);
        if joinable {
            if let Some(current) = self.current_select.take() {
                return self.join_singleton(current, projection);
            }
        }
        self.as_new_top_level(|this| this.rewrite_projection(expr, projection))
    }

    fn join_singleton(&mut self, current: SelectExpr, projection: &ProjectionExpr) -> PlanResult<ExprRef> {
        let inner_alias = TableAlias::fresh();
        let current = current.add_redundant_select(inner_alias);
        let source = ColumnMapper::map(&projection.select, inner_alias, &HashSet::from([current.alias]))?;
        let tested = self.ctx.language.add_outer_join_test(&ProjectionExpr { select: source, ..projection.clone() });
        let tested = expect_projection(&tested)?;
        let source_alias = expect_select(&tested.select)?.alias;
        let scope = HashSet::from([inner_alias, source_alias]);
        let pc = ColumnProjector::project(self.ctx.language, &tested.projector, &current.columns, current.alias, &scope)?;
        let left = current.from.clone().ok_or_else(|| PlanError::internal("redundant select without source"))?;
        let join = Expr::Join(JoinExpr { kind: JoinKind::OuterApply, left, right: tested.select.clone(), condition: None }).into_ref();
        self.current_select = Some(SelectExpr::new(current.alias, pc.columns, Some(join), None));
        self.rewrite(&pc.projector)
    }
}

fn can_join_on_server(select: &SelectExpr) -> bool {
    !select.distinct && !select.has_group_by() && !has_aggregates(select)
}

impl Rewriter for SingletonProjectionRewriter<'_> {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        match &**expr {
            Expr::Projection(p) => self.rewrite_projection(expr, p),
            Expr::ClientJoin(_) => self.as_new_top_level(|this| this.rewrite_children(expr)),
            Expr::Scalar { .. } | Expr::Exists { .. } | Expr::In { .. } => Ok(expr.clone()),
            Expr::Insert(_) | Expr::Update(_) | Expr::Delete(_) | Expr::Batch(_) => {
                self.is_top_level = true;
                self.rewrite_children(expr)
            }
            Expr::New { type_name, members } => {
                let mut changed = false;
                let mut rebuilt = Vec::with_capacity(members.len());
                for (name, member) in members {
                    let saved = std::mem::replace(&mut self.deferred, self.ctx.mapping.policy().is_deferred(type_name, name));
                    let result = self.rewrite(member);
                    self.deferred = saved;
                    let result = result?;
                    changed |= !Arc::ptr_eq(&result, member);
                    rebuilt.push((name.clone(), result));
                }
                if !changed {
                    return Ok(expr.clone());
                }
                Ok(Expr::New { type_name: type_name.clone(), members: rebuilt }.into_ref())
            }
            _ => self.rewrite_children(expr),
        }
    }
}
