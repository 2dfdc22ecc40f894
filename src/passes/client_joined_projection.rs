use std::collections::HashSet;
use std::sync::Arc;

use crate::binder::ColumnProjector;
use crate::error::PlanResult;
use crate::expr::{
    expect_projection, expect_select, has_aggregates, referenced_aliases, split_conjunction, BinaryOp, ClientJoinExpr,
    ColumnMapper, Expr, ExprRef, JoinExpr, JoinKind, ProjectionExpr, QueryDuplicator, Rewriter, SelectExpr,
    TableAlias,
};
use crate::passes::PassContext;

/// Turns nested collection projections into client joins: one query for
/// all inner rows of all outer rows, stitched back by recovered key pairs.
pub struct ClientJoinedProjectionRewriter<'a> {
    ctx: PassContext<'a>,
    is_top_level: bool,
    can_join_on_client: bool,
    deferred: bool,
    current_select: Option<SelectExpr>,
}

impl<'a> ClientJoinedProjectionRewriter<'a> {
    pub fn rewrite(ctx: PassContext<'a>, plan: &ExprRef) -> PlanResult<ExprRef> {
        let mut rewriter = ClientJoinedProjectionRewriter {
            ctx,
            is_top_level: true,
            can_join_on_client: true,
            deferred: false,
            current_select: None,
        };
        Rewriter::rewrite(&mut rewriter, plan)
    }

    fn can_join_on_client(&self, select: &SelectExpr) -> bool {
        self.can_join_on_client
            && !self.deferred
            && select.skip.is_none()
            && select.take.is_none()
            && !select.distinct
            && !select.has_group_by()
            && !has_aggregates(select)
    }

    fn rewrite_projection(&mut self, expr: &ExprRef, projection: &ProjectionExpr) -> PlanResult<ExprRef> {
        let select = expect_select(&projection.select)?.clone();
        let outer = self.current_select.replace(select.clone());
        let result = self.rewrite_nested(expr, projection, &select, outer.as_ref());
        self.current_select = outer;
        result
    }

    fn rewrite_nested(
        &mut self,
        expr: &ExprRef,
        projection: &ProjectionExpr,
        select: &SelectExpr,
        outer: Option<&SelectExpr>,
    ) -> PlanResult<ExprRef> {
        if self.is_top_level {
            self.is_top_level = false;
            return self.rewrite_children(expr);
        }
        if !self.can_join_on_client(select) {
            let saved = std::mem::replace(&mut self.can_join_on_client, false);
            let result = self.rewrite_children(expr);
            self.can_join_on_client = saved;
            return result;
        }
        if let Some(outer) = outer {
            if let Some(client_join) = self.client_join(projection, outer)? {
                return Ok(client_join);
            }
        }
        // No key pair: the projection runs as its own query per outer row.
        self.rewrite_children(expr)
    }

    fn client_join(&mut self, projection: &ProjectionExpr, outer: &SelectExpr) -> PlanResult<Option<ExprRef>> {
        let new_outer = QueryDuplicator::duplicate(&outer.clone().into_ref())?;
        let new_outer_alias = expect_select(&new_outer)?.alias;
        let inner_select = ColumnMapper::map(&projection.select, new_outer_alias, &HashSet::from([outer.alias]))?;
        let tested = self.ctx.language.add_outer_join_test(&ProjectionExpr { select: inner_select, ..projection.clone() });
        let tested = expect_projection(&tested)?;
        let mut inner = expect_select(&tested.select)?.clone();

        let mut outer_keys = Vec::new();
        let mut inner_keys = Vec::new();
        let recovered = inner
            .filter
            .as_ref()
            .is_some_and(|f| equi_join_keys(f, new_outer_alias, &mut outer_keys, &mut inner_keys));
        if !recovered {
            return Ok(None);
        }

        // Inner keys read the inner select's sources; expose them as its
        // columns so the joined select can see them.
        let mut exposed = Vec::with_capacity(inner_keys.len());
        for key in inner_keys {
            let sql_type = key.as_column().map(|c| c.sql_type).unwrap_or_default();
            let ty = key.value_type();
            let name = match inner.columns.iter().find(|c| c.expr == key) {
                Some(existing) => existing.name.clone(),
                None => inner.add_column("key", key, sql_type),
            };
            exposed.push(Expr::column(inner.alias, name, ty, sql_type));
        }

        let alias = TableAlias::fresh();
        let scope = HashSet::from([new_outer_alias, inner.alias]);
        let pc = ColumnProjector::project(self.ctx.language, &tested.projector, &[], alias, &scope)?;
        let join = Expr::Join(JoinExpr {
            kind: JoinKind::CrossApply,
            left: new_outer.clone(),
            right: inner.into_ref(),
            condition: None,
        })
        .into_ref();
        let mut joined = SelectExpr::new(alias, pc.columns, Some(join), None).with_distinct(projection.is_singleton);

        // Inner keys are read from the joined rows, outer keys from the outer select.
        let mut inner_key_refs = Vec::with_capacity(exposed.len());
        for key in exposed {
            let (ty, sql_type) = (key.value_type(), key.as_column().map(|c| c.sql_type).unwrap_or_default());
            let name = match joined.columns.iter().find(|c| c.expr == key) {
                Some(existing) => existing.name.clone(),
                None => joined.add_column("key", key, sql_type),
            };
            inner_key_refs.push(Expr::column(alias, name, ty, sql_type));
        }
        let outer_key = outer_keys
            .iter()
            .map(|k| ColumnMapper::map(k, outer.alias, &HashSet::from([new_outer_alias])))
            .collect::<PlanResult<Vec<_>>>()?;

        let saved = self.current_select.replace(joined.clone());
        let projector = self.rewrite(&pc.projector);
        self.current_select = saved;

        let projection = Expr::Projection(ProjectionExpr { select: joined.into_ref(), projector: projector?, ..projection.clone() }).into_ref();
        Ok(Some(Expr::ClientJoin(ClientJoinExpr { projection, outer_key, inner_key: inner_key_refs }).into_ref()))
    }
}

/// Splits `predicate` into `outer == inner` column pairs. Every conjunct
/// that reads the outer alias must be such a pair.
fn equi_join_keys(predicate: &ExprRef, outer_alias: TableAlias, outer: &mut Vec<ExprRef>, inner: &mut Vec<ExprRef>) -> bool {
    if let Expr::Binary { op: BinaryOp::Equal, left, right, .. } = &**predicate {
        if let (Some(l), Some(r)) = (left.as_column(), right.as_column()) {
            if l.alias == outer_alias {
                outer.push(left.clone());
                inner.push(right.clone());
                return true;
            }
            if r.alias == outer_alias {
                inner.push(left.clone());
                outer.push(right.clone());
                return true;
            }
        }
    }
    let parts = split_conjunction(predicate);
    if parts.len() < 2 {
        return false;
    }
    let mut had_key = false;
    for part in &parts {
        if referenced_aliases(part).contains(&outer_alias) {
            if !equi_join_keys(part, outer_alias, outer, inner) {
                return false;
            }
            had_key = true;
        }
    }
    had_key
}

impl Rewriter for ClientJoinedProjectionRewriter<'_> {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        match &**expr {
            Expr::Projection(p) => self.rewrite_projection(expr, p),
            Expr::Scalar { .. } | Expr::Exists { .. } | Expr::In { .. } => Ok(expr.clone()),
            Expr::Insert(_) | Expr::Update(_) | Expr::Delete(_) | Expr::Batch(_) => {
                self.is_top_level = true;
                self.rewrite_children(expr)
            }
            Expr::New { type_name, members } => {
                let mut changed = false;
                let mut rebuilt = Vec::with_capacity(members.len());
                for (name, member) in members {
                    let deferred = self.ctx.mapping.policy().is_deferred(type_name, name);
                    let saved = std::mem::replace(&mut self.deferred, deferred);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::QueryBinder;
    use crate::dialect::StandardDialect;
    use crate::expr::{declared_aliases, walk};
    use crate::fixtures::{self, member};
    use crate::model::ValueType;
    use crate::query::{Lambda, QueryBuilder};

    fn customers_with_orders(correlation: BinaryOp) -> QueryBuilder {
        let orders = QueryBuilder::source("Order")
            .filter(Lambda::new(
                "o",
                Expr::binary(
                    correlation,
                    member("o", "Order", "CustomerId", ValueType::Int),
                    member("c", "Customer", "Id", ValueType::Int),
                ),
            ))
            .into_expr();
        QueryBuilder::source("Customer").project(Lambda::new(
            "c",
            Expr::new_record("CustomerOrders", [("Name", member("c", "Customer", "Name", ValueType::String)), ("Orders", orders)]),
        ))
    }

    fn rewrite(query: QueryBuilder) -> ExprRef {
        let mapping = fixtures::mapping();
        let dialect = StandardDialect::ansi();
        let bound = QueryBinder::bind(&mapping, &dialect, &query.build()).unwrap();
        ClientJoinedProjectionRewriter::rewrite(PassContext { mapping: &mapping, language: &dialect }, &bound).unwrap()
    }

    fn client_joins(plan: &ExprRef) -> Vec<ClientJoinExpr> {
        let mut found = Vec::new();
        walk(plan, &mut |e| {
            if let Expr::ClientJoin(cj) = &**e {
                found.push(cj.clone());
            }
        });
        found
    }

    #[test]
    fn equi_correlated_collection_becomes_client_join() {
        let plan = rewrite(customers_with_orders(BinaryOp::Equal));
        let joins = client_joins(&plan);
        assert_eq!(joins.len(), 1, "{plan}");
        assert_eq!(joins[0].outer_key.len(), 1);
        assert_eq!(joins[0].inner_key.len(), 1);
        let joined = expect_select(&expect_projection(&joins[0].projection).unwrap().select).unwrap().clone();
        let key = joined.column(&joins[0].inner_key[0].as_column().unwrap().name).unwrap();
        let visible = declared_aliases(joined.from.as_ref().unwrap());
        let read = key.expr.as_column().unwrap();
        assert!(visible.contains(&read.alias), "key reads {:?} outside {visible:?}", read.alias);
    }

    #[test]
    fn joined_select_reads_only_its_own_sources() {
        let plan = rewrite(customers_with_orders(BinaryOp::Equal));
        let joined = expect_select(&expect_projection(&client_joins(&plan)[0].projection).unwrap().select).unwrap().clone();
        let visible = declared_aliases(joined.from.as_ref().unwrap());
        for column in &joined.columns {
            for alias in referenced_aliases(&column.expr) {
                assert!(visible.contains(&alias), "{} reads {alias:?} outside {visible:?}", column.name);
            }
        }
    }

    #[test]
    fn non_equi_correlation_falls_back_to_nested_projection() {
        let plan = rewrite(customers_with_orders(BinaryOp::LessThan));
        assert!(client_joins(&plan).is_empty());
        let mut nested = 0;
        walk(&expect_projection(&plan).unwrap().projector, &mut |e| {
            if matches!(&**e, Expr::Projection(_)) {
                nested += 1;
            }
        });
        assert_eq!(nested, 1);
    }
}
