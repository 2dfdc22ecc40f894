use std::sync::Arc;

use crate::error::PlanResult;
use crate::expr::{
    AggregateExpr, AggregateSubqueryExpr, BatchCommand, ClientJoinExpr, ColumnAssignment, ColumnDeclaration,
    DeleteCommand, Expr, ExprRef, InSource, InsertCommand, JoinExpr, OrderExpr, ProjectionExpr, SelectExpr,
    SetOperationExpr, UpdateCommand,
};

/// Direct children of a node, in evaluation order. For a select that is
/// `from`, `filter`, `columns`, `order_by`, `group_by`, `skip`, `take`.
///
/// `Query`, `NamedValue` and the leaf nodes have no children; an
/// `AggregateSubquery` only exposes its subquery.
pub fn children(expr: &Expr) -> Vec<&ExprRef> {
    let mut out = Vec::new();
    match expr {
        Expr::Constant { .. }
        | Expr::Parameter { .. }
        | Expr::Captured { .. }
        | Expr::Query(_)
        | Expr::Table(_)
        | Expr::Column(_)
        | Expr::NamedValue(_) => {}
        Expr::Member { expr, .. } => out.push(expr),
        Expr::Unary { operand, .. } => out.push(operand),
        Expr::Binary { left, right, .. } => {
            out.push(left);
            out.push(right);
        }
        Expr::Conditional { test, if_true, if_false, .. } => {
            out.push(test);
            out.push(if_true);
            out.push(if_false);
        }
        Expr::Call { args, .. } => out.extend(args),
        Expr::New { members, .. } => out.extend(members.iter().map(|(_, e)| e)),
        Expr::Grouping { key, elements } => {
            out.push(key);
            out.push(elements);
        }
        Expr::SetOperation(s) => {
            out.push(&s.left);
            out.push(&s.right);
        }
        Expr::Select(s) => {
            out.extend(&s.from);
            out.extend(&s.filter);
            out.extend(s.columns.iter().map(|c| &c.expr));
            out.extend(s.order_by.iter().map(|o| &o.expr));
            out.extend(&s.group_by);
            out.extend(&s.skip);
            out.extend(&s.take);
        }
        Expr::Join(j) => {
            out.push(&j.left);
            out.push(&j.right);
            out.extend(&j.condition);
        }
        Expr::Aggregate(a) => out.extend(&a.argument),
        Expr::AggregateSubquery(a) => out.push(&a.subquery),
        Expr::Scalar { select, .. } | Expr::Exists { select } => out.push(select),
        Expr::In { expr, source } => {
            out.push(expr);
            match source {
                InSource::Select(select) => out.push(select),
                InSource::Values(values) => out.extend(values),
            }
        }
        Expr::IsNull(e) => out.push(e),
        Expr::Between { expr, lower, upper } => {
            out.push(expr);
            out.push(lower);
            out.push(upper);
        }
        Expr::RowNumber { order_by } => out.extend(order_by.iter().map(|o| &o.expr)),
        Expr::OuterJoined { test, value } => {
            out.push(test);
            out.push(value);
        }
        Expr::Entity { expr, .. } => out.push(expr),
        Expr::Projection(p) => {
            out.push(&p.select);
            out.push(&p.projector);
        }
        Expr::ClientJoin(cj) => {
            out.push(&cj.projection);
            out.extend(&cj.outer_key);
            out.extend(&cj.inner_key);
        }
        Expr::Insert(c) => {
            out.push(&c.table);
            for a in &c.assignments {
                out.push(&a.column);
                out.push(&a.expr);
            }
        }
        Expr::Update(c) => {
            out.push(&c.table);
            out.extend(&c.filter);
            for a in &c.assignments {
                out.push(&a.column);
                out.push(&a.expr);
            }
        }
        Expr::Delete(c) => {
            out.push(&c.table);
            out.extend(&c.filter);
        }
        Expr::Batch(b) => out.extend(&b.commands),
    }
    out
}

/// Visits every node of the tree in pre-order.
pub fn walk<'a>(expr: &'a ExprRef, f: &mut impl FnMut(&'a ExprRef)) {
    f(expr);
    for child in children(expr) {
        walk(child, f);
    }
}

struct ChildMapper<F> {
    f: F,
    changed: bool,
}

impl<F> ChildMapper<F>
where
    F: FnMut(&ExprRef) -> PlanResult<ExprRef>,
{
    fn one(&mut self, e: &ExprRef) -> PlanResult<ExprRef> {
        let mapped = (self.f)(e)?;
        if !Arc::ptr_eq(&mapped, e) {
            self.changed = true;
        }
        Ok(mapped)
    }

    fn opt(&mut self, e: &Option<ExprRef>) -> PlanResult<Option<ExprRef>> {
        e.as_ref().map(|e| self.one(e)).transpose()
    }

    fn many(&mut self, es: &[ExprRef]) -> PlanResult<Vec<ExprRef>> {
        es.iter().map(|e| self.one(e)).collect()
    }

    fn orders(&mut self, os: &[OrderExpr]) -> PlanResult<Vec<OrderExpr>> {
        os.iter().map(|o| Ok(OrderExpr::new(o.direction, self.one(&o.expr)?))).collect()
    }

    fn decls(&mut self, ds: &[ColumnDeclaration]) -> PlanResult<Vec<ColumnDeclaration>> {
        ds.iter()
            .map(|d| Ok(ColumnDeclaration::new(d.name.clone(), self.one(&d.expr)?, d.sql_type)))
            .collect()
    }

    fn assignments(&mut self, assignments: &[ColumnAssignment]) -> PlanResult<Vec<ColumnAssignment>> {
        assignments
            .iter()
            .map(|a| Ok(ColumnAssignment { column: self.one(&a.column)?, expr: self.one(&a.expr)? }))
            .collect()
    }

    fn select(&mut self, s: &SelectExpr) -> PlanResult<SelectExpr> {
        let from = self.opt(&s.from)?;
        let filter = self.opt(&s.filter)?;
        let columns = self.decls(&s.columns)?;
        let order_by = self.orders(&s.order_by)?;
        let group_by = self.many(&s.group_by)?;
        let skip = self.opt(&s.skip)?;
        let take = self.opt(&s.take)?;
        Ok(SelectExpr { alias: s.alias, columns, from, filter, order_by, group_by, distinct: s.distinct, skip, take, reverse: s.reverse })
    }

    fn rebuild(&mut self, expr: &Expr) -> PlanResult<Option<Expr>> {
        let rebuilt = match expr {
            Expr::Constant { .. }
            | Expr::Parameter { .. }
            | Expr::Captured { .. }
            | Expr::Query(_)
            | Expr::Table(_)
            | Expr::Column(_)
            | Expr::NamedValue(_) => return Ok(None),
            Expr::Member { expr, member, ty } => Expr::Member { expr: self.one(expr)?, member: member.clone(), ty: ty.clone() },
            Expr::Unary { op, operand, ty } => Expr::Unary { op: *op, operand: self.one(operand)?, ty: ty.clone() },
            Expr::Binary { op, left, right, ty } => Expr::Binary {
                op: *op,
                left: self.one(left)?,
                right: self.one(right)?,
                ty: ty.clone(),
            },
            Expr::Conditional { test, if_true, if_false, ty } => Expr::Conditional {
                test: self.one(test)?,
                if_true: self.one(if_true)?,
                if_false: self.one(if_false)?,
                ty: ty.clone(),
            },
            Expr::Call { function, args, ty } => Expr::Call { function: function.clone(), args: self.many(args)?, ty: ty.clone() },
            Expr::New { type_name, members } => Expr::New {
                type_name: type_name.clone(),
                members: members
                    .iter()
                    .map(|(name, e)| Ok((name.clone(), self.one(e)?)))
                    .collect::<PlanResult<_>>()?,
            },
            Expr::Grouping { key, elements } => Expr::Grouping { key: self.one(key)?, elements: self.one(elements)? },
            Expr::SetOperation(s) => Expr::SetOperation(SetOperationExpr {
                kind: s.kind,
                alias: s.alias,
                left: self.one(&s.left)?,
                right: self.one(&s.right)?,
            }),
            Expr::Select(s) => Expr::Select(self.select(s)?),
            Expr::Join(j) => Expr::Join(JoinExpr {
                kind: j.kind,
                left: self.one(&j.left)?,
                right: self.one(&j.right)?,
                condition: self.opt(&j.condition)?,
            }),
            Expr::Aggregate(a) => Expr::Aggregate(AggregateExpr {
                kind: a.kind,
                argument: self.opt(&a.argument)?,
                distinct: a.distinct,
                ty: a.ty.clone(),
            }),
            Expr::AggregateSubquery(a) => Expr::AggregateSubquery(AggregateSubqueryExpr {
                group_by_alias: a.group_by_alias,
                aggregate_in_group_select: a.aggregate_in_group_select.clone(),
                subquery: self.one(&a.subquery)?,
                ty: a.ty.clone(),
            }),
            Expr::Scalar { select, ty } => Expr::Scalar { select: self.one(select)?, ty: ty.clone() },
            Expr::Exists { select } => Expr::Exists { select: self.one(select)? },
            Expr::In { expr, source } => {
                let expr = self.one(expr)?;
                let source = match source {
                    InSource::Select(select) => InSource::Select(self.one(select)?),
                    InSource::Values(values) => InSource::Values(self.many(values)?),
                };
                Expr::In { expr, source }
            }
            Expr::IsNull(e) => Expr::IsNull(self.one(e)?),
            Expr::Between { expr, lower, upper } => Expr::Between {
                expr: self.one(expr)?,
                lower: self.one(lower)?,
                upper: self.one(upper)?,
            },
            Expr::RowNumber { order_by } => Expr::RowNumber { order_by: self.orders(order_by)? },
            Expr::OuterJoined { test, value } => Expr::OuterJoined { test: self.one(test)?, value: self.one(value)? },
            Expr::Entity { entity, expr } => Expr::Entity { entity: entity.clone(), expr: self.one(expr)? },
            Expr::Projection(p) => Expr::Projection(ProjectionExpr {
                select: self.one(&p.select)?,
                projector: self.one(&p.projector)?,
                reduction: p.reduction,
                is_singleton: p.is_singleton,
            }),
            Expr::ClientJoin(cj) => Expr::ClientJoin(ClientJoinExpr {
                projection: self.one(&cj.projection)?,
                outer_key: self.many(&cj.outer_key)?,
                inner_key: self.many(&cj.inner_key)?,
            }),
            Expr::Insert(c) => Expr::Insert(InsertCommand { table: self.one(&c.table)?, assignments: self.assignments(&c.assignments)? }),
            Expr::Update(c) => Expr::Update(UpdateCommand {
                table: self.one(&c.table)?,
                filter: self.opt(&c.filter)?,
                assignments: self.assignments(&c.assignments)?,
            }),
            Expr::Delete(c) => Expr::Delete(DeleteCommand { table: self.one(&c.table)?, filter: self.opt(&c.filter)? }),
            Expr::Batch(b) => Expr::Batch(BatchCommand { commands: self.many(&b.commands)? }),
        };
        Ok(Some(rebuilt))
    }
}

/// Rebuilds `expr` with every direct child replaced by `f(child)`.
///
/// When `f` hands back every child unchanged (same `Arc`), the original
/// handle is returned so unchanged subtrees stay shared.
pub fn map_children<F>(expr: &ExprRef, f: F) -> PlanResult<ExprRef>
where
    F: FnMut(&ExprRef) -> PlanResult<ExprRef>,
{
    let mut mapper = ChildMapper { f, changed: false };
    match mapper.rebuild(expr)? {
        Some(rebuilt) if mapper.changed => Ok(Arc::new(rebuilt)),
        _ => Ok(expr.clone()),
    }
}

/// Child-wise rewrite of a select that keeps it a [`SelectExpr`]. Returns
/// `None` when nothing changed.
pub fn map_select_children<F>(select: &SelectExpr, f: F) -> PlanResult<Option<SelectExpr>>
where
    F: FnMut(&ExprRef) -> PlanResult<ExprRef>,
{
    let mut mapper = ChildMapper { f, changed: false };
    let rebuilt = mapper.select(select)?;
    Ok(mapper.changed.then_some(rebuilt))
}

/// A bottom-up tree rewrite. Implementors override [`Rewriter::rewrite`]
/// for the node kinds they care about and fall back to
/// [`Rewriter::rewrite_children`] for everything else.
pub trait Rewriter {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        self.rewrite_children(expr)
    }

    fn rewrite_children(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        map_children(expr, |child| self.rewrite(child))
    }
}

/// Rewrites with a plain function applied after the children were rewritten.
pub fn transform_up<F>(expr: &ExprRef, f: &mut F) -> PlanResult<ExprRef>
where
    F: FnMut(&ExprRef) -> PlanResult<Option<ExprRef>>,
{
    let rebuilt = map_children(expr, |child| transform_up(child, f))?;
    Ok(f(&rebuilt)?.unwrap_or(rebuilt))
}
