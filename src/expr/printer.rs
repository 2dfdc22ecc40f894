use std::collections::HashMap;

use crate::expr::{ColumnDeclaration, Expr, ExprRef, InSource, OrderDirection, OrderExpr, TableAlias, UnaryOp};

/// Debug rendering of a plan. Aliases print as `t0`, `t1`, ... in order of
/// first appearance, so two alpha-equivalent trees print identically.
#[derive(Default)]
pub struct PlanPrinter {
    aliases: HashMap<TableAlias, usize>,
    out: String,
}

impl PlanPrinter {
    pub fn print(expr: &Expr) -> String {
        let mut printer = PlanPrinter::default();
        printer.visit(expr);
        printer.out
    }

    fn alias(&mut self, alias: TableAlias) -> String {
        let next = self.aliases.len();
        let n = *self.aliases.entry(alias).or_insert(next);
        format!("t{n}")
    }

    fn push(&mut self, s: &str) {
        self.out.push_str(s);
    }

    fn list(&mut self, items: &[ExprRef]) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.visit(item);
        }
    }

    fn orders(&mut self, orders: &[OrderExpr]) {
        for (i, o) in orders.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.visit(&o.expr);
            if o.direction == OrderDirection::Descending {
                self.push(" DESC");
            }
        }
    }

    fn columns(&mut self, columns: &[ColumnDeclaration]) {
        for (i, c) in columns.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.visit(&c.expr);
            self.push(&format!(" AS {}", c.name));
        }
    }

    fn visit(&mut self, expr: &Expr) {
        match expr {
            Expr::Constant { value, .. } => self.push(&value.to_string()),
            Expr::Parameter { name, .. } => self.push(&format!("${name}")),
            Expr::Captured { name, .. } => self.push(&format!("@{name}")),
            Expr::Member { expr, member, .. } => {
                self.visit(expr);
                self.push(&format!(".{member}"));
            }
            Expr::Unary { op, operand, .. } => {
                self.push(match op {
                    UnaryOp::Not => "NOT(",
                    UnaryOp::Negate => "-(",
                });
                self.visit(operand);
                self.push(")");
            }
            Expr::Binary { op, left, right, .. } => {
                self.push("(");
                self.visit(left);
                self.push(&format!(" {} ", op.symbol()));
                self.visit(right);
                self.push(")");
            }
            Expr::Conditional { test, if_true, if_false, .. } => {
                self.push("IIF(");
                self.list(&[test.clone(), if_true.clone(), if_false.clone()]);
                self.push(")");
            }
            Expr::Call { function, args, .. } => {
                self.push(&format!("{function}("));
                self.list(args);
                self.push(")");
            }
            Expr::New { type_name, members } => {
                self.push(&format!("new {type_name}{{"));
                for (i, (name, e)) in members.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    self.push(&format!("{name} = "));
                    self.visit(e);
                }
                self.push("}");
            }
            Expr::Grouping { key, elements } => {
                self.push("Grouping(");
                self.visit(key);
                self.push(", ");
                self.visit(elements);
                self.push(")");
            }
            Expr::Query(q) => self.push(&format!("Query({})", q.operator_name())),
            Expr::Table(t) => {
                let a = self.alias(t.alias);
                self.push(&format!("{} AS {a}", t.name));
            }
            Expr::SetOperation(s) => {
                let a = self.alias(s.alias);
                self.push(&format!("{:?}(", s.kind));
                self.visit(&s.left);
                self.push(", ");
                self.visit(&s.right);
                self.push(&format!(") AS {a}"));
            }
            Expr::Column(c) => {
                let a = self.alias(c.alias);
                self.push(&format!("{a}.{}", c.name));
            }
            Expr::Select(s) => {
                let a = self.alias(s.alias);
                self.push("SELECT ");
                if s.distinct {
                    self.push("DISTINCT ");
                }
                self.columns(&s.columns);
                if let Some(from) = &s.from {
                    self.push(" FROM (");
                    self.visit(from);
                    self.push(")");
                }
                if let Some(filter) = &s.filter {
                    self.push(" WHERE ");
                    self.visit(filter);
                }
                if !s.group_by.is_empty() {
                    self.push(" GROUP BY ");
                    self.list(&s.group_by);
                }
                if !s.order_by.is_empty() {
                    self.push(" ORDER BY ");
                    self.orders(&s.order_by);
                }
                if let Some(skip) = &s.skip {
                    self.push(" SKIP ");
                    self.visit(skip);
                }
                if let Some(take) = &s.take {
                    self.push(" TAKE ");
                    self.visit(take);
                }
                if s.reverse {
                    self.push(" REVERSE");
                }
                self.push(&format!(" AS {a}"));
            }
            Expr::Join(j) => {
                self.visit(&j.left);
                self.push(&format!(" {} ", j.kind.name()));
                self.visit(&j.right);
                if let Some(cond) = &j.condition {
                    self.push(" ON ");
                    self.visit(cond);
                }
            }
            Expr::Aggregate(a) => {
                self.push(&format!("{}(", a.kind.name()));
                if a.distinct {
                    self.push("DISTINCT ");
                }
                match &a.argument {
                    Some(arg) => self.visit(arg),
                    None => self.push("*"),
                }
                self.push(")");
            }
            Expr::AggregateSubquery(a) => {
                let g = self.alias(a.group_by_alias);
                self.push(&format!("AggregateSubquery({g}, "));
                self.visit(&a.subquery);
                self.push(")");
            }
            Expr::Scalar { select, .. } => {
                self.push("SCALAR(");
                self.visit(select);
                self.push(")");
            }
            Expr::Exists { select } => {
                self.push("EXISTS(");
                self.visit(select);
                self.push(")");
            }
            Expr::In { expr, source } => {
                self.visit(expr);
                self.push(" IN (");
                match source {
                    InSource::Select(select) => self.visit(select),
                    InSource::Values(values) => self.list(values),
                }
                self.push(")");
            }
            Expr::IsNull(e) => {
                self.visit(e);
                self.push(" IS NULL");
            }
            Expr::Between { expr, lower, upper } => {
                self.visit(expr);
                self.push(" BETWEEN ");
                self.visit(lower);
                self.push(" AND ");
                self.visit(upper);
            }
            Expr::RowNumber { order_by } => {
                self.push("ROW_NUMBER(");
                self.orders(order_by);
                self.push(")");
            }
            Expr::OuterJoined { test, value } => {
                self.push("OuterJoined(");
                self.visit(test);
                self.push(", ");
                self.visit(value);
                self.push(")");
            }
            Expr::NamedValue(nv) => self.push(&format!(":{}", nv.name)),
            Expr::Entity { entity, expr } => {
                self.push(&format!("Entity<{entity}>("));
                self.visit(expr);
                self.push(")");
            }
            Expr::Projection(p) => {
                self.push("Projection(");
                self.visit(&p.select);
                self.push(" => ");
                self.visit(&p.projector);
                if let Some(r) = p.reduction {
                    self.push(&format!(" |> {}", r.name()));
                }
                self.push(")");
            }
            Expr::ClientJoin(cj) => {
                self.push("ClientJoin(outer: [");
                self.list(&cj.outer_key);
                self.push("], inner: [");
                self.list(&cj.inner_key);
                self.push("], ");
                self.visit(&cj.projection);
                self.push(")");
            }
            Expr::Insert(c) => {
                self.push("INSERT ");
                self.visit(&c.table);
                self.assignments(&c.assignments);
            }
            Expr::Update(c) => {
                self.push("UPDATE ");
                self.visit(&c.table);
                self.assignments(&c.assignments);
                if let Some(filter) = &c.filter {
                    self.push(" WHERE ");
                    self.visit(filter);
                }
            }
            Expr::Delete(c) => {
                self.push("DELETE ");
                self.visit(&c.table);
                if let Some(filter) = &c.filter {
                    self.push(" WHERE ");
                    self.visit(filter);
                }
            }
            Expr::Batch(b) => {
                self.push("BATCH[");
                self.list(&b.commands);
                self.push("]");
            }
        }
    }

    fn assignments(&mut self, assignments: &[crate::expr::ColumnAssignment]) {
        self.push(" SET ");
        for (i, a) in assignments.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.visit(&a.column);
            self.push(" = ");
            self.visit(&a.expr);
        }
    }
}
