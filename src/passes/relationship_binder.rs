use std::sync::Arc;

use crate::binder::{bind_member, ColumnProjector};
use crate::error::PlanResult;
use crate::expr::{
    declared_aliases, expect_projection, map_select_children, Expr, ExprRef, JoinExpr, JoinKind, ProjectionExpr,
    Rewriter, SelectExpr, TableAlias,
};
use crate::mapping::relationship_projection;
use crate::passes::PassContext;

/// Expands relationship members left behind by the binder.
///
/// A singleton relationship read inside a select becomes an outer apply
/// against that select's source; a collection relationship becomes a
/// nested projection.
pub struct RelationshipBinder<'a> {
    ctx: PassContext<'a>,
    current_from: Option<ExprRef>,
}

impl<'a> RelationshipBinder<'a> {
    pub fn rewrite(ctx: PassContext<'a>, plan: &ExprRef) -> PlanResult<ExprRef> {
        Rewriter::rewrite(&mut RelationshipBinder { ctx, current_from: None }, plan)
    }

    fn rewrite_select(&mut self, expr: &ExprRef, select: &SelectExpr) -> PlanResult<ExprRef> {
        let from = select.from.as_ref().map(|f| self.rewrite(f)).transpose()?;
        let saved = std::mem::replace(&mut self.current_from, from);
        let clauses = map_select_children(&select.clone().with_from(None), |c| self.rewrite(c));
        let from = std::mem::replace(&mut self.current_from, saved);
        let clauses = clauses?;

        let from_changed = match (&from, &select.from) {
            (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
            (None, None) => false,
            _ => true,
        };
        if !from_changed && clauses.is_none() {
            return Ok(expr.clone());
        }
        Ok(clauses.unwrap_or_else(|| select.clone()).with_from(from).into_ref())
    }

    fn rewrite_projection(&mut self, expr: &ExprRef, projection: &ProjectionExpr) -> PlanResult<ExprRef> {
        let select = self.rewrite(&projection.select)?;
        let saved = std::mem::replace(&mut self.current_from, Some(select.clone()));
        let projector = self.rewrite(&projection.projector);
        let from = std::mem::replace(&mut self.current_from, saved);
        let projector = projector?;

        match from {
            Some(from) if !Arc::ptr_eq(&from, &select) => {
                // The projector now reads joined selects; give it a select of its own.
                let alias = TableAlias::fresh();
                let scope = declared_aliases(&from);
                let pc = ColumnProjector::project(self.ctx.language, &projector, &[], alias, &scope)?;
                Ok(Expr::Projection(ProjectionExpr {
                    select: SelectExpr::new(alias, pc.columns, Some(from), None).into_ref(),
                    projector: pc.projector,
                    ..projection.clone()
                })
                .into_ref())
            }
            _ if Arc::ptr_eq(&select, &projection.select) && Arc::ptr_eq(&projector, &projection.projector) => {
                Ok(expr.clone())
            }
            _ => Ok(Expr::Projection(ProjectionExpr { select, projector, ..projection.clone() }).into_ref()),
        }
    }

    fn rewrite_member(&mut self, expr: &ExprRef, source: &ExprRef, member: &str) -> PlanResult<ExprRef> {
        let bound_source = self.rewrite(source)?;
        if let Expr::Entity { entity, .. } = &*bound_source {
            let mapping = self.ctx.mapping;
            if let Some(rel) = mapping.entity_or_err(entity)?.relationship(member) {
                let projection = relationship_projection(mapping, self.ctx.language, &bound_source, rel)?;
                let projection = self.rewrite(&projection)?;
                if rel.singleton {
                    if let Some(from) = self.current_from.clone() {
                        let tested = self.ctx.language.add_outer_join_test(expect_projection(&projection)?);
                        let tested = expect_projection(&tested)?;
                        self.current_from = Some(
                            Expr::Join(JoinExpr {
                                kind: JoinKind::OuterApply,
                                left: from,
                                right: tested.select.clone(),
                                condition: None,
                            })
                            .into_ref(),
                        );
                        return Ok(tested.projector.clone());
                    }
                }
                return Ok(projection);
            }
        }
        if Arc::ptr_eq(&bound_source, source) {
            return Ok(expr.clone());
        }
        bind_member(self.ctx.mapping, &bound_source, member, expr.value_type())
    }
}

impl Rewriter for RelationshipBinder<'_> {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        match &**expr {
            Expr::Select(select) => self.rewrite_select(expr, select),
            Expr::Projection(projection) => self.rewrite_projection(expr, projection),
            Expr::Member { expr: source, member, .. } => self.rewrite_member(expr, source, member),
            _ => self.rewrite_children(expr),
        }
    }
}
