use std::collections::HashMap;
use std::sync::Arc;

use crate::dialect::QueryLanguage;
use crate::error::PlanResult;
use crate::expr::{
    map_children, transform_up, ColumnAssignment, Expr, ExprRef, InsertCommand, NamedValueExpr, ProjectionExpr,
    Rewriter, UpdateCommand,
};
use crate::model::{SqlType, Value, ValueType};

/// Replaces literals and captured reads with named placeholders. Numeric
/// and boolean literals stay inline; equal values of one type share a
/// placeholder, typed by the first column it is bound against. Projectors
/// run on the client and are left alone.
pub struct Parameterizer<'a> {
    language: &'a dyn QueryLanguage,
    by_value: HashMap<(ValueType, Value), ExprRef>,
    /// Store type each placeholder name settled on.
    pinned: HashMap<String, SqlType>,
    next: usize,
    in_projector: bool,
}

/// Value of a literal, a captured read, or a member path over either.
pub fn host_value(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Constant { value, .. } | Expr::Captured { value, .. } => Some(value.clone()),
        Expr::Member { expr, member, .. } => host_value(expr)?.member(member),
        Expr::NamedValue(nv) => host_value(&nv.value),
        _ => None,
    }
}

fn rooted_in_capture(expr: &Expr) -> bool {
    match expr {
        Expr::Captured { .. } => true,
        Expr::Member { expr, .. } => rooted_in_capture(expr),
        _ => false,
    }
}

impl<'a> Parameterizer<'a> {
    pub fn rewrite(language: &'a dyn QueryLanguage, plan: &ExprRef) -> PlanResult<ExprRef> {
        let mut parameterizer =
            Parameterizer { language, by_value: HashMap::new(), pinned: HashMap::new(), next: 0, in_projector: false };
        let rewritten = Rewriter::rewrite(&mut parameterizer, plan)?;
        if parameterizer.pinned.is_empty() {
            return Ok(rewritten);
        }
        // Occurrences seen before the first bound use still carry the default type.
        let pinned = parameterizer.pinned;
        transform_up(&rewritten, &mut |e| {
            Ok(match &**e {
                Expr::NamedValue(nv) => pinned.get(&nv.name).map(|&sql_type| with_sql_type(e, sql_type)),
                _ => None,
            })
        })
    }

    /// Types a placeholder for the column it meets, unless an earlier use
    /// already decided its type.
    fn bind_type(&mut self, expr: &ExprRef, sql_type: SqlType) -> ExprRef {
        match &**expr {
            Expr::NamedValue(nv) => {
                let sql_type = *self.pinned.entry(nv.name.clone()).or_insert(sql_type);
                with_sql_type(expr, sql_type)
            }
            _ => expr.clone(),
        }
    }

    fn named(&mut self, ty: &ValueType, value: Value, source: &ExprRef) -> ExprRef {
        let key = (ty.clone(), value);
        if let Some(existing) = self.by_value.get(&key) {
            return existing.clone();
        }
        let named = Expr::NamedValue(NamedValueExpr {
            name: format!("p{}", self.next),
            ty: ty.clone(),
            sql_type: self.language.column_type(ty),
            value: source.clone(),
        })
        .into_ref();
        self.next += 1;
        self.by_value.insert(key, named.clone());
        named
    }

    fn rewrite_projection(&mut self, expr: &ExprRef, projection: &ProjectionExpr) -> PlanResult<ExprRef> {
        let saved = std::mem::replace(&mut self.in_projector, false);
        let select = self.rewrite(&projection.select);
        self.in_projector = true;
        let projector = select.and_then(|select| Ok((select, self.rewrite(&projection.projector)?)));
        self.in_projector = saved;
        let (select, projector) = projector?;
        if Arc::ptr_eq(&select, &projection.select) && Arc::ptr_eq(&projector, &projection.projector) {
            return Ok(expr.clone());
        }
        Ok(Expr::Projection(ProjectionExpr { select, projector, ..projection.clone() }).into_ref())
    }

    fn typed_assignments(&mut self, assignments: &[ColumnAssignment]) -> Vec<ColumnAssignment> {
        assignments
            .iter()
            .map(|a| {
                let expr = match a.column.as_column() {
                    Some(c) => self.bind_type(&a.expr, c.sql_type),
                    None => a.expr.clone(),
                };
                ColumnAssignment { column: a.column.clone(), expr }
            })
            .collect()
    }
}

/// The placeholder retyped to the store type it is bound against.
fn with_sql_type(expr: &ExprRef, sql_type: SqlType) -> ExprRef {
    match &**expr {
        Expr::NamedValue(nv) if nv.sql_type != sql_type => Expr::NamedValue(NamedValueExpr { sql_type, ..nv.clone() }).into_ref(),
        _ => expr.clone(),
    }
}

impl Rewriter for Parameterizer<'_> {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        match &**expr {
            Expr::Projection(p) => self.rewrite_projection(expr, p),
            Expr::Select(_) => {
                let saved = std::mem::replace(&mut self.in_projector, false);
                let result = self.rewrite_children(expr);
                self.in_projector = saved;
                result
            }
            _ if self.in_projector => self.rewrite_children(expr),
            Expr::Constant { value, ty } => {
                if value.is_null() || ty.is_numeric() {
                    Ok(expr.clone())
                } else {
                    Ok(self.named(ty, value.clone(), expr))
                }
            }
            Expr::Captured { value, ty, .. } => Ok(self.named(ty, value.clone(), expr)),
            Expr::Member { ty, .. } if rooted_in_capture(expr) => match host_value(expr) {
                Some(value) => Ok(self.named(ty, value, expr)),
                None => self.rewrite_children(expr),
            },
            Expr::Binary { op, ty, .. } => {
                let rewritten = self.rewrite_children(expr)?;
                let Expr::Binary { left, right, .. } = &*rewritten else {
                    return Ok(rewritten);
                };
                let (new_left, new_right) = match (left.as_column(), right.as_column()) {
                    (None, Some(c)) => (self.bind_type(left, c.sql_type), right.clone()),
                    (Some(c), None) => (left.clone(), self.bind_type(right, c.sql_type)),
                    _ => return Ok(rewritten),
                };
                if Arc::ptr_eq(&new_left, left) && Arc::ptr_eq(&new_right, right) {
                    return Ok(rewritten);
                }
                Ok(Expr::Binary { op: *op, left: new_left, right: new_right, ty: ty.clone() }.into_ref())
            }
            Expr::Insert(_) | Expr::Update(_) => {
                let rewritten = map_children(expr, |child| self.rewrite(child))?;
                match &*rewritten {
                    Expr::Insert(insert) => {
                        let assignments = self.typed_assignments(&insert.assignments);
                        if assignments == insert.assignments {
                            return Ok(rewritten);
                        }
                        Ok(Expr::Insert(InsertCommand { table: insert.table.clone(), assignments }).into_ref())
                    }
                    Expr::Update(update) => {
                        let assignments = self.typed_assignments(&update.assignments);
                        if assignments == update.assignments {
                            return Ok(rewritten);
                        }
                        Ok(Expr::Update(UpdateCommand { assignments, ..update.clone() }).into_ref())
                    }
                    _ => Ok(rewritten),
                }
            }
            _ => self.rewrite_children(expr),
        }
    }
}
