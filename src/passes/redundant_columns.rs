use std::collections::{HashMap, HashSet};

use crate::error::PlanResult;
use crate::expr::{map_select_children, walk, ColumnDeclaration, Expr, ExprRef, Rewriter, SelectExpr, TableAlias};

/// Collapses column declarations of one select that compute the same
/// column, redirecting references to the first declaration.
///
/// Operands of set operations are left alone so both sides stay aligned.
pub struct RedundantColumnRemover {
    map: HashMap<(TableAlias, String), ExprRef>,
    pinned: HashSet<TableAlias>,
}

impl RedundantColumnRemover {
    pub fn rewrite(plan: &ExprRef) -> PlanResult<ExprRef> {
        let mut pinned = HashSet::new();
        walk(plan, &mut |e| {
            if let Expr::SetOperation(set) = &**e {
                pinned.extend(set.left.declared_alias());
                pinned.extend(set.right.declared_alias());
            }
        });
        let mut remover = RedundantColumnRemover { map: HashMap::new(), pinned };
        Rewriter::rewrite(&mut remover, plan)
    }

    fn collapse(&mut self, select: SelectExpr) -> SelectExpr {
        if self.pinned.contains(&select.alias) {
            return select;
        }
        let mut kept: Vec<ColumnDeclaration> = Vec::with_capacity(select.columns.len());
        let mut removed = false;
        for decl in &select.columns {
            let duplicate_of = match &*decl.expr {
                Expr::Column(c) => kept.iter().find(|k| matches!(&*k.expr, Expr::Column(kc) if kc.alias == c.alias && kc.name == c.name)),
                _ => None,
            };
            match duplicate_of {
                Some(first) => {
                    self.map.insert((select.alias, decl.name.clone()), select.column_ref(first));
                    removed = true;
                }
                None => kept.push(decl.clone()),
            }
        }
        if removed { select.with_columns(kept) } else { select }
    }
}

impl Rewriter for RedundantColumnRemover {
    fn rewrite(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        match &**expr {
            Expr::Column(c) => Ok(self.map.get(&(c.alias, c.name.clone())).cloned().unwrap_or_else(|| expr.clone())),
            Expr::Select(select) => {
                let rebuilt = map_select_children(select, |c| self.rewrite(c))?;
                let before = select.columns.len();
                let collapsed = self.collapse(rebuilt.clone().unwrap_or_else(|| select.clone()));
                if rebuilt.is_none() && collapsed.columns.len() == before {
                    return Ok(expr.clone());
                }
                Ok(collapsed.into_ref())
            }
            _ => self.rewrite_children(expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::TableExpr;
    use crate::model::{SqlType, ValueType};

    #[test]
    fn duplicate_column_is_collapsed_and_references_redirected() {
        let (t, s, o) = (TableAlias::fresh(), TableAlias::fresh(), TableAlias::fresh());
        let zone = Expr::column(t, "zone", ValueType::Int, SqlType::Integer);
        let from = Expr::Table(TableExpr { alias: t, entity: "Order".into(), name: "orders".into() }).into_ref();
        let inner = SelectExpr::new(
            s,
            vec![
                ColumnDeclaration::new("zone", zone.clone(), SqlType::Integer),
                ColumnDeclaration::new("c0", zone, SqlType::Integer),
            ],
            Some(from),
            None,
        );
        let outer_column = Expr::column(s, "c0", ValueType::Int, SqlType::Integer);
        let outer = SelectExpr::new(o, vec![ColumnDeclaration::new("x", outer_column, SqlType::Integer)], Some(inner.into_ref()), None);
        let rewritten = RedundantColumnRemover::rewrite(&outer.into_ref()).unwrap();

        let outer = rewritten.as_select().unwrap();
        assert_eq!(outer.columns[0].expr.as_column().unwrap().name, "zone");
        assert_eq!(outer.from.as_ref().unwrap().as_select().unwrap().columns.len(), 1);
    }
}
