use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::dialect::{Nomination, ProjectionAffinity, QueryLanguage};
use crate::error::PlanResult;
use crate::expr::{available_column_name, children, map_children, walk, ColumnDeclaration, Expr, ExprRef, TableAlias};

/// Result of splitting an expression into store-side columns and a
/// client-side projector over them.
#[derive(Debug, Clone)]
pub struct ProjectedColumns {
    pub projector: ExprRef,
    pub columns: Vec<ColumnDeclaration>,
}

/// Decides, bottom-up, which sub-expressions become columns of a new select
/// named `new_alias` and rewrites the expression to read them back.
///
/// Columns of `existing_aliases` are re-exposed under unique names; any
/// other nominated sub-expression is hoisted into a `cN` column. Columns of
/// other aliases are outer references and are left alone.
pub struct ColumnProjector<'a> {
    language: &'a dyn QueryLanguage,
    existing_aliases: &'a HashSet<TableAlias>,
    new_alias: TableAlias,
    candidates: HashSet<*const Expr>,
    columns: Vec<ColumnDeclaration>,
    mapped: HashMap<(TableAlias, String), ExprRef>,
    hoisted: HashMap<*const Expr, ExprRef>,
    next_column: usize,
}

impl<'a> ColumnProjector<'a> {
    pub fn project(
        language: &'a dyn QueryLanguage,
        expr: &ExprRef,
        existing_columns: &[ColumnDeclaration],
        new_alias: TableAlias,
        existing_aliases: &'a HashSet<TableAlias>,
    ) -> PlanResult<ProjectedColumns> {
        let affinity = language.projection_affinity();
        Self::project_with(language, affinity, expr, existing_columns, new_alias, existing_aliases)
    }

    pub fn project_with(
        language: &'a dyn QueryLanguage,
        affinity: ProjectionAffinity,
        expr: &ExprRef,
        existing_columns: &[ColumnDeclaration],
        new_alias: TableAlias,
        existing_aliases: &'a HashSet<TableAlias>,
    ) -> PlanResult<ProjectedColumns> {
        let candidates = Nominator::nominate(language, affinity, existing_aliases, expr);
        let mut mapped = HashMap::new();
        for decl in existing_columns {
            if let Expr::Column(c) = &*decl.expr {
                let reference = Expr::column(new_alias, decl.name.clone(), c.ty.clone(), decl.sql_type);
                mapped.insert((c.alias, c.name.clone()), reference);
            }
        }
        let mut projector = ColumnProjector {
            language,
            existing_aliases,
            new_alias,
            candidates,
            columns: existing_columns.to_vec(),
            mapped,
            hoisted: HashMap::new(),
            next_column: 0,
        };
        let rewritten = projector.visit(expr)?;
        Ok(ProjectedColumns { projector: rewritten, columns: projector.columns })
    }

    fn next_column_name(&mut self) -> String {
        loop {
            let name = format!("c{}", self.next_column);
            self.next_column += 1;
            if !self.columns.iter().any(|c| c.name == name) {
                return name;
            }
        }
    }

    fn visit(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        let key = Arc::as_ptr(expr);
        if !self.candidates.contains(&key) {
            return map_children(expr, |child| self.visit(child));
        }
        if let Expr::Column(c) = &**expr {
            let column_key = (c.alias, c.name.clone());
            if let Some(mapped) = self.mapped.get(&column_key) {
                return Ok(mapped.clone());
            }
            if !self.existing_aliases.contains(&c.alias) {
                return Ok(expr.clone());
            }
            let name = available_column_name(&self.columns, &c.name);
            self.columns.push(ColumnDeclaration::new(name.clone(), expr.clone(), c.sql_type));
            let reference = Expr::column(self.new_alias, name, c.ty.clone(), c.sql_type);
            self.mapped.insert(column_key, reference.clone());
            return Ok(reference);
        }
        if let Some(reference) = self.hoisted.get(&key) {
            return Ok(reference.clone());
        }
        let name = self.next_column_name();
        let ty = expr.value_type();
        let sql_type = self.language.column_type(&ty);
        self.columns.push(ColumnDeclaration::new(name.clone(), expr.clone(), sql_type));
        let reference = Expr::column(self.new_alias, name, ty, sql_type);
        self.hoisted.insert(key, reference.clone());
        Ok(reference)
    }
}

/// Bottom-up candidate selection. A node is a candidate when the dialect
/// says it must be a column, or when it can be and none of its operands
/// were blocked.
struct Nominator<'a> {
    language: &'a dyn QueryLanguage,
    affinity: ProjectionAffinity,
    existing_aliases: &'a HashSet<TableAlias>,
    candidates: HashSet<*const Expr>,
    blocked: bool,
}

impl<'a> Nominator<'a> {
    fn nominate(
        language: &'a dyn QueryLanguage,
        affinity: ProjectionAffinity,
        existing_aliases: &'a HashSet<TableAlias>,
        expr: &ExprRef,
    ) -> HashSet<*const Expr> {
        let mut nominator = Nominator { language, affinity, existing_aliases, candidates: HashSet::new(), blocked: false };
        nominator.visit(expr);
        nominator.candidates
    }

    fn visit(&mut self, expr: &ExprRef) {
        let saved = self.blocked;
        self.blocked = false;
        match &**expr {
            // A nested query stays client-side, but whatever it reads from
            // the current scope has to travel through the new select.
            Expr::Projection(_) | Expr::ClientJoin(_) => {
                self.nominate_free_columns(expr);
                self.blocked = true;
            }
            _ => match self.language.nominate(expr, self.affinity) {
                Nomination::Must => {
                    self.candidates.insert(Arc::as_ptr(expr));
                }
                nomination => {
                    for child in children(expr) {
                        self.visit(child);
                    }
                    if !self.blocked {
                        if nomination == Nomination::Can {
                            self.candidates.insert(Arc::as_ptr(expr));
                        } else {
                            self.blocked = true;
                        }
                    }
                }
            },
        }
        self.blocked |= saved;
    }

    fn nominate_free_columns(&mut self, expr: &ExprRef) {
        let existing = self.existing_aliases;
        let candidates = &mut self.candidates;
        walk(expr, &mut |e| {
            if let Expr::Column(c) = &**e {
                if existing.contains(&c.alias) {
                    candidates.insert(Arc::as_ptr(e));
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{DialectConfig, StandardDialect};
    use crate::expr::{BinaryOp, SelectExpr, TableExpr};
    use crate::model::{SqlType, ValueType};

    fn server_dialect() -> StandardDialect {
        let mut config = DialectConfig::ansi();
        config.projection_affinity = ProjectionAffinity::Server;
        StandardDialect::new(config).unwrap()
    }

    #[test]
    fn client_affinity_keeps_arithmetic_in_projector() {
        let dialect = StandardDialect::ansi();
        let t = TableAlias::fresh();
        let price = Expr::column(t, "price", ValueType::Int, SqlType::Integer);
        let doubled = Expr::binary(BinaryOp::Multiply, price, Expr::int(2));
        let new_alias = TableAlias::fresh();
        let scope = HashSet::from([t]);
        let pc = ColumnProjector::project(&dialect, &doubled, &[], new_alias, &scope).unwrap();
        assert_eq!(pc.columns.len(), 1);
        assert_eq!(pc.columns[0].name, "price");
        match &*pc.projector {
            Expr::Binary { left, .. } => assert_eq!(left.as_column().unwrap().alias, new_alias),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn server_affinity_hoists_arithmetic() {
        let dialect = server_dialect();
        let t = TableAlias::fresh();
        let price = Expr::column(t, "price", ValueType::Int, SqlType::Integer);
        let doubled = Expr::binary(BinaryOp::Multiply, price, Expr::int(2));
        let scope = HashSet::from([t]);
        let pc = ColumnProjector::project(&dialect, &doubled, &[], TableAlias::fresh(), &scope).unwrap();
        assert_eq!(pc.columns.len(), 1);
        assert_eq!(pc.columns[0].name, "c0");
        assert!(pc.projector.as_column().is_some());
    }

    #[test]
    fn repeated_column_is_declared_once() {
        let dialect = StandardDialect::ansi();
        let t = TableAlias::fresh();
        let record = Expr::new_record(
            "Pair",
            [
                ("A", Expr::column(t, "zone", ValueType::Int, SqlType::Integer)),
                ("B", Expr::column(t, "zone", ValueType::Int, SqlType::Integer)),
            ],
        );
        let scope = HashSet::from([t]);
        let pc = ColumnProjector::project(&dialect, &record, &[], TableAlias::fresh(), &scope).unwrap();
        assert_eq!(pc.columns.len(), 1);
    }

    #[test]
    fn outer_references_are_left_alone() {
        let dialect = StandardDialect::ansi();
        let (t, outer) = (TableAlias::fresh(), TableAlias::fresh());
        let col = Expr::column(outer, "id", ValueType::Int, SqlType::Integer);
        let scope = HashSet::from([t]);
        let pc = ColumnProjector::project(&dialect, &col, &[], TableAlias::fresh(), &scope).unwrap();
        assert!(pc.columns.is_empty());
        assert!(Arc::ptr_eq(&pc.projector, &col));
    }

    #[test]
    fn nested_projection_reads_through_new_select() {
        let dialect = StandardDialect::ansi();
        let (t, u, inner) = (TableAlias::fresh(), TableAlias::fresh(), TableAlias::fresh());
        let table = Expr::Table(TableExpr { alias: u, entity: "Order".into(), name: "orders".into() }).into_ref();
        let correlation = Expr::eq(
            Expr::column(u, "customer_id", ValueType::Int, SqlType::Integer),
            Expr::column(t, "id", ValueType::Int, SqlType::Integer),
        );
        let nested = Expr::projection(
            SelectExpr::new(inner, vec![], Some(table), Some(correlation)),
            Expr::column(inner, "id", ValueType::Int, SqlType::Integer),
        );
        let new_alias = TableAlias::fresh();
        let scope = HashSet::from([t]);
        let pc = ColumnProjector::project(&dialect, &nested, &[], new_alias, &scope).unwrap();
        assert_eq!(pc.columns.len(), 1);
        assert!(crate::expr::referenced_aliases(&pc.projector).contains(&new_alias));
        assert!(!crate::expr::referenced_aliases(&pc.projector).contains(&t));
    }
}
