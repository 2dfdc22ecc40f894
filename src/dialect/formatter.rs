use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::dialect::{LimitSyntax, QueryLanguage};
use crate::error::{PlanError, PlanResult};
use crate::expr::{
    all_declared_aliases, AggregateKind, BinaryOp, ColumnDeclaration, ColumnExpr, Expr, ExprRef, InSource, JoinKind,
    NamedValueExpr, OrderDirection, OrderExpr, SelectExpr, SetOperationKind, TableAlias, UnaryOp,
};
use crate::model::Value;

static PLAIN_IDENTIFIER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

/// Double-quotes `name` unless it is a plain identifier.
pub fn quote_identifier(name: &str) -> String {
    let plain = PLAIN_IDENTIFIER.as_ref().is_some_and(|re| re.is_match(name));
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Text of one statement plus what must be bound before running it.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedQuery {
    pub text: String,
    /// Placeholders in order of first appearance.
    pub parameters: Vec<NamedValueExpr>,
    /// Columns of an enclosing query, bound per outer row under the given
    /// placeholder name.
    pub outer_columns: Vec<(String, ColumnExpr)>,
}

/// Renders a finished plan as query text.
pub trait SqlEmitter {
    fn emit(&self, language: &dyn QueryLanguage, statement: &ExprRef) -> PlanResult<EmittedQuery>;
}

/// SQL for the built-in dialects.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlFormatter;

impl SqlEmitter for SqlFormatter {
    fn emit(&self, language: &dyn QueryLanguage, statement: &ExprRef) -> PlanResult<EmittedQuery> {
        let statement = match &**statement {
            Expr::Projection(p) => &p.select,
            _ => statement,
        };
        let mut writer = SqlWriter {
            language,
            declared: all_declared_aliases(statement),
            aliases: HashMap::new(),
            parameters: IndexMap::new(),
            outer: IndexMap::new(),
            bare: None,
            depth: 0,
            out: String::new(),
        };
        writer.statement(statement)?;
        Ok(EmittedQuery {
            text: writer.out,
            parameters: writer.parameters.into_values().collect(),
            outer_columns: writer.outer.into_values().collect(),
        })
    }
}

struct SqlWriter<'a> {
    language: &'a dyn QueryLanguage,
    declared: HashSet<TableAlias>,
    aliases: HashMap<TableAlias, usize>,
    parameters: IndexMap<String, NamedValueExpr>,
    outer: IndexMap<(TableAlias, String), (String, ColumnExpr)>,
    /// Table of the command being written; its columns print unqualified.
    bare: Option<TableAlias>,
    depth: usize,
    out: String,
}

impl SqlWriter<'_> {
    fn push(&mut self, s: &str) {
        self.out.push_str(s);
    }

    fn newline(&mut self) {
        self.out.push('\n');
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
    }

    fn alias(&mut self, alias: TableAlias) -> String {
        let next = self.aliases.len();
        let n = *self.aliases.entry(alias).or_insert(next);
        format!("t{n}")
    }

    fn unsupported(node: &Expr) -> PlanError {
        PlanError::unsupported(node.kind_name(), "has no SQL form; it must be rewritten before emitting")
    }

    fn statement(&mut self, expr: &ExprRef) -> PlanResult<()> {
        match &**expr {
            Expr::Select(s) => self.select(s),
            Expr::Insert(insert) => {
                let table = self.command_table(&insert.table)?;
                self.push(&format!("INSERT INTO {table} ("));
                let names = insert
                    .assignments
                    .iter()
                    .map(|a| assigned_column(&a.column))
                    .collect::<PlanResult<Vec<_>>>()?;
                self.push(&names.join(", "));
                self.push(")");
                self.newline();
                self.push("VALUES (");
                for (i, a) in insert.assignments.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    self.expr(&a.expr)?;
                }
                self.push(")");
                Ok(())
            }
            Expr::Update(update) => {
                let table = self.command_table(&update.table)?;
                self.push(&format!("UPDATE {table}"));
                self.newline();
                self.push("SET ");
                for (i, a) in update.assignments.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    let name = assigned_column(&a.column)?;
                    self.push(&format!("{name} = "));
                    self.expr(&a.expr)?;
                }
                self.filter(update.filter.as_ref())
            }
            Expr::Delete(delete) => {
                let table = self.command_table(&delete.table)?;
                self.push(&format!("DELETE FROM {table}"));
                self.filter(delete.filter.as_ref())
            }
            Expr::Batch(batch) => {
                for (i, command) in batch.commands.iter().enumerate() {
                    if i > 0 {
                        self.push(";\n");
                    }
                    self.statement(command)?;
                }
                Ok(())
            }
            other => Err(Self::unsupported(other)),
        }
    }

    fn command_table(&mut self, table: &ExprRef) -> PlanResult<String> {
        match &**table {
            Expr::Table(t) => {
                self.bare = Some(t.alias);
                Ok(quote_identifier(&t.name))
            }
            other => Err(Self::unsupported(other)),
        }
    }

    fn filter(&mut self, filter: Option<&ExprRef>) -> PlanResult<()> {
        if let Some(filter) = filter {
            self.newline();
            self.push("WHERE ");
            self.expr(filter)?;
        }
        Ok(())
    }

    fn select(&mut self, s: &SelectExpr) -> PlanResult<()> {
        if s.reverse {
            return Err(PlanError::unsupported("Reverse", "reverse flags must be resolved into orderings"));
        }
        let top = self.language.limit_syntax() == LimitSyntax::Top;
        if top && s.skip.is_some() {
            return Err(PlanError::dialect_precondition(
                self.language.name(),
                "skip must be rewritten before emitting TOP",
            ));
        }

        self.push("SELECT ");
        if s.distinct {
            self.push("DISTINCT ");
        }
        if top {
            if let Some(take) = &s.take {
                self.push("TOP (");
                self.expr(take)?;
                self.push(") ");
            }
        }
        self.columns(&s.columns)?;
        if let Some(from) = &s.from {
            self.newline();
            self.push("FROM ");
            self.source(from)?;
        }
        self.filter(s.filter.as_ref())?;
        if !s.group_by.is_empty() {
            self.newline();
            self.push("GROUP BY ");
            for (i, g) in s.group_by.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.expr(g)?;
            }
        }
        if !s.order_by.is_empty() {
            self.newline();
            self.push("ORDER BY ");
            self.orderings(&s.order_by)?;
        }
        if !top {
            if let Some(take) = &s.take {
                self.newline();
                self.push("LIMIT ");
                self.expr(take)?;
            }
            if let Some(skip) = &s.skip {
                self.newline();
                self.push("OFFSET ");
                self.expr(skip)?;
            }
        }
        Ok(())
    }

    fn columns(&mut self, columns: &[ColumnDeclaration]) -> PlanResult<()> {
        if columns.is_empty() {
            self.push("NULL AS tmp");
            return Ok(());
        }
        for (i, decl) in columns.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.expr(&decl.expr)?;
            let same_name = matches!(&*decl.expr, Expr::Column(c) if c.name == decl.name);
            if !same_name {
                self.push(&format!(" AS {}", quote_identifier(&decl.name)));
            }
        }
        Ok(())
    }

    fn orderings(&mut self, orderings: &[OrderExpr]) -> PlanResult<()> {
        for (i, o) in orderings.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.expr(&o.expr)?;
            if o.direction == OrderDirection::Descending {
                self.push(" DESC");
            }
        }
        Ok(())
    }

    fn nested_select(&mut self, select: &ExprRef) -> PlanResult<()> {
        let Expr::Select(s) = &**select else {
            return Err(Self::unsupported(select));
        };
        self.push("(");
        self.depth += 1;
        self.newline();
        self.select(s)?;
        self.depth -= 1;
        self.newline();
        self.push(")");
        Ok(())
    }

    fn source(&mut self, source: &ExprRef) -> PlanResult<()> {
        match &**source {
            Expr::Table(t) => {
                let alias = self.alias(t.alias);
                self.push(&format!("{} AS {alias}", quote_identifier(&t.name)));
            }
            Expr::Select(s) => {
                self.nested_select(source)?;
                let alias = self.alias(s.alias);
                self.push(&format!(" AS {alias}"));
            }
            Expr::SetOperation(set) => {
                let operator = match set.kind {
                    SetOperationKind::Union => "UNION",
                    SetOperationKind::Concat => "UNION ALL",
                    SetOperationKind::Intersect => "INTERSECT",
                    SetOperationKind::Except => "EXCEPT",
                };
                self.push("(");
                self.depth += 1;
                self.newline();
                self.statement(&set.left)?;
                self.newline();
                self.push(operator);
                self.newline();
                self.statement(&set.right)?;
                self.depth -= 1;
                self.newline();
                let alias = self.alias(set.alias);
                self.push(&format!(") AS {alias}"));
            }
            Expr::Join(join) => {
                self.source(&join.left)?;
                self.newline();
                self.push(match join.kind {
                    JoinKind::Cross => "CROSS JOIN ",
                    JoinKind::Inner => "INNER JOIN ",
                    JoinKind::CrossApply => "CROSS APPLY ",
                    JoinKind::OuterApply => "OUTER APPLY ",
                    JoinKind::LeftOuter | JoinKind::SingletonLeftOuter => "LEFT OUTER JOIN ",
                });
                self.source(&join.right)?;
                if let Some(condition) = &join.condition {
                    self.push(" ON ");
                    self.expr(condition)?;
                }
            }
            other => return Err(Self::unsupported(other)),
        }
        Ok(())
    }

    fn column(&mut self, c: &ColumnExpr) {
        if self.bare == Some(c.alias) {
            self.push(&quote_identifier(&c.name));
            return;
        }
        if !self.declared.contains(&c.alias) {
            let next = self.outer.len();
            let (name, _) = self
                .outer
                .entry((c.alias, c.name.clone()))
                .or_insert_with(|| (format!("o{next}_{}", c.name), c.clone()));
            let placeholder = format!("{}{name}", self.language.parameter_prefix());
            self.push(&placeholder);
            return;
        }
        let alias = self.alias(c.alias);
        self.push(&format!("{alias}.{}", quote_identifier(&c.name)));
    }

    fn constant(&mut self, value: &Value) -> PlanResult<()> {
        let text = match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.into_inner().to_string(),
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            Value::DateTime(d) => format!("'{}'", d.format("%Y-%m-%d %H:%M:%S")),
            Value::List(_) | Value::Record(_) => {
                return Err(PlanError::unsupported("Constant", format!("{value} is not a scalar literal")));
            }
        };
        self.push(&text);
        Ok(())
    }

    fn binary(&mut self, op: BinaryOp, left: &ExprRef, right: &ExprRef) -> PlanResult<()> {
        let operator = match op {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "<>",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Coalesce => {
                self.push("COALESCE(");
                self.expr(left)?;
                self.push(", ");
                self.expr(right)?;
                self.push(")");
                return Ok(());
            }
            BinaryOp::Power => return Err(PlanError::unsupported("Power", "no portable SQL operator")),
        };
        if matches!(op, BinaryOp::Equal | BinaryOp::NotEqual) && right.is_null_constant() {
            self.push("(");
            self.expr(left)?;
            self.push(if op == BinaryOp::Equal { " IS NULL)" } else { " IS NOT NULL)" });
            return Ok(());
        }
        self.push("(");
        self.expr(left)?;
        self.push(&format!(" {operator} "));
        self.expr(right)?;
        self.push(")");
        Ok(())
    }

    fn expr(&mut self, expr: &ExprRef) -> PlanResult<()> {
        match &**expr {
            Expr::Constant { value, .. } => self.constant(value)?,
            Expr::Column(c) => self.column(c),
            Expr::NamedValue(nv) => {
                let placeholder = format!("{}{}", self.language.parameter_prefix(), nv.name);
                self.parameters.entry(nv.name.clone()).or_insert_with(|| nv.clone());
                self.push(&placeholder);
            }
            Expr::Unary { op, operand, .. } => {
                self.push(match op {
                    UnaryOp::Not => "NOT ",
                    UnaryOp::Negate => "-",
                });
                self.push("(");
                self.expr(operand)?;
                self.push(")");
            }
            Expr::Binary { op, left, right, .. } => self.binary(*op, left, right)?,
            Expr::Conditional { test, if_true, if_false, .. } => {
                self.push("CASE WHEN ");
                self.expr(test)?;
                self.push(" THEN ");
                self.expr(if_true)?;
                self.push(" ELSE ");
                self.expr(if_false)?;
                self.push(" END");
            }
            Expr::Call { function, args, .. } => {
                self.push(&format!("{}(", function.to_uppercase()));
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    self.expr(arg)?;
                }
                self.push(")");
            }
            Expr::Aggregate(a) => {
                self.push(match a.kind {
                    AggregateKind::Count | AggregateKind::LongCount => "COUNT(",
                    AggregateKind::Sum => "SUM(",
                    AggregateKind::Min => "MIN(",
                    AggregateKind::Max => "MAX(",
                    AggregateKind::Average => "AVG(",
                });
                if a.distinct {
                    self.push("DISTINCT ");
                }
                match &a.argument {
                    Some(argument) => self.expr(argument)?,
                    None => self.push("*"),
                }
                self.push(")");
            }
            Expr::Scalar { select, .. } => self.nested_select(select)?,
            Expr::Exists { select } => {
                self.push("EXISTS");
                self.nested_select(select)?;
            }
            Expr::In { expr, source } => {
                self.expr(expr)?;
                self.push(" IN ");
                match source {
                    InSource::Select(select) => self.nested_select(select)?,
                    InSource::Values(values) => {
                        self.push("(");
                        for (i, v) in values.iter().enumerate() {
                            if i > 0 {
                                self.push(", ");
                            }
                            self.expr(v)?;
                        }
                        self.push(")");
                    }
                }
            }
            Expr::IsNull(operand) => {
                self.push("(");
                self.expr(operand)?;
                self.push(" IS NULL)");
            }
            Expr::Between { expr, lower, upper } => {
                self.expr(expr)?;
                self.push(" BETWEEN ");
                self.expr(lower)?;
                self.push(" AND ");
                self.expr(upper)?;
            }
            Expr::RowNumber { order_by } => {
                self.push("ROW_NUMBER() OVER (ORDER BY ");
                if order_by.is_empty() {
                    self.push("(SELECT 1)");
                } else {
                    self.orderings(order_by)?;
                }
                self.push(")");
            }
            other => return Err(Self::unsupported(other)),
        }
        Ok(())
    }
}

fn assigned_column(column: &ExprRef) -> PlanResult<String> {
    match column.as_column() {
        Some(c) => Ok(quote_identifier(&c.name)),
        None => Err(PlanError::internal("assignment target is not a column")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::StandardDialect;
    use crate::expr::{DeleteCommand, TableExpr};
    use crate::fixtures::{int_column, passthrough, table};
    use crate::model::{SqlType, ValueType};

    fn emit(dialect: &StandardDialect, plan: &ExprRef) -> PlanResult<EmittedQuery> {
        SqlFormatter.emit(dialect, plan)
    }

    fn city_placeholder() -> ExprRef {
        Expr::NamedValue(NamedValueExpr {
            name: "p0".into(),
            ty: ValueType::String,
            sql_type: SqlType::VarChar,
            value: Expr::constant(Value::from("Oslo")),
        })
        .into_ref()
    }

    #[test]
    fn filtered_select_with_placeholder() {
        let t = TableAlias::fresh();
        let city = Expr::column(t, "city", ValueType::String, SqlType::VarChar);
        let select = SelectExpr::new(
            TableAlias::fresh(),
            vec![passthrough(t, "id"), ColumnDeclaration::new("town", city.clone(), SqlType::VarChar)],
            Some(table(t, "customers")),
            Some(Expr::eq(city, city_placeholder())),
        );
        let emitted = emit(&StandardDialect::ansi(), &select.into_ref()).unwrap();
        assert_eq!(emitted.text, "SELECT t0.id, t0.city AS town\nFROM customers AS t0\nWHERE (t0.city = @p0)");
        assert_eq!(emitted.parameters.len(), 1);
        assert_eq!(emitted.parameters[0].name, "p0");
    }

    #[test]
    fn awkward_identifiers_are_quoted() {
        assert_eq!(quote_identifier("zone"), "zone");
        assert_eq!(quote_identifier("order total"), "\"order total\"");
        assert_eq!(quote_identifier("1st"), "\"1st\"");
    }

    #[test]
    fn paging_uses_limit_offset_or_top() {
        let t = TableAlias::fresh();
        let paged = SelectExpr::new(TableAlias::fresh(), vec![passthrough(t, "id")], Some(table(t, "orders")), None)
            .with_take(Some(Expr::int(5)));

        let ansi = emit(&StandardDialect::ansi(), &paged.clone().with_skip(Some(Expr::int(10))).into_ref()).unwrap();
        assert!(ansi.text.ends_with("LIMIT 5\nOFFSET 10"), "{}", ansi.text);

        let top = emit(&StandardDialect::top_only(), &paged.clone().into_ref()).unwrap();
        assert!(top.text.starts_with("SELECT TOP (5) t0.id"), "{}", top.text);

        let err = emit(&StandardDialect::top_only(), &paged.with_skip(Some(Expr::int(10))).into_ref()).unwrap_err();
        assert!(matches!(err, PlanError::DialectPrecondition { .. }));
    }

    #[test]
    fn empty_column_list_selects_a_placeholder() {
        let t = TableAlias::fresh();
        let select = SelectExpr::new(TableAlias::fresh(), vec![], Some(table(t, "orders")), None);
        let emitted = emit(&StandardDialect::ansi(), &select.into_ref()).unwrap();
        assert!(emitted.text.starts_with("SELECT NULL AS tmp\nFROM orders AS t0"));
    }

    #[test]
    fn apply_and_row_number_render() {
        let (a, b, s) = (TableAlias::fresh(), TableAlias::fresh(), TableAlias::fresh());
        let right = SelectExpr::new(s, vec![passthrough(b, "zone")], Some(table(b, "orders")), None).into_ref();
        let join = Expr::Join(crate::expr::JoinExpr { kind: JoinKind::OuterApply, left: table(a, "customers"), right, condition: None })
            .into_ref();
        let rownum = Expr::RowNumber { order_by: vec![OrderExpr::new(OrderDirection::Descending, int_column(a, "id"))] }.into_ref();
        let select = SelectExpr::new(TableAlias::fresh(), vec![ColumnDeclaration::new("rn", rownum, SqlType::Integer)], Some(join), None);
        let text = emit(&StandardDialect::row_number(), &select.into_ref()).unwrap().text;
        assert!(text.contains("ROW_NUMBER() OVER (ORDER BY t0.id DESC) AS rn"), "{text}");
        assert!(text.contains("OUTER APPLY (\n  SELECT t1.zone\n  FROM orders AS t1\n) AS t2"), "{text}");
    }

    #[test]
    fn entity_nodes_cannot_be_emitted() {
        let t = TableAlias::fresh();
        let entity = Expr::Entity { entity: "Order".into(), expr: int_column(t, "id") }.into_ref();
        let select = SelectExpr::new(TableAlias::fresh(), vec![ColumnDeclaration::new("e", entity, SqlType::Unknown)], Some(table(t, "orders")), None);
        let err = emit(&StandardDialect::ansi(), &select.into_ref()).unwrap_err();
        assert!(matches!(err, PlanError::Unsupported { .. }));
    }

    #[test]
    fn delete_names_columns_without_alias() {
        let t = TableAlias::fresh();
        let delete = Expr::Delete(DeleteCommand {
            table: Expr::Table(TableExpr { alias: t, entity: "Order".into(), name: "orders".into() }).into_ref(),
            filter: Some(Expr::eq(int_column(t, "zone"), Expr::int(4))),
        })
        .into_ref();
        let emitted = emit(&StandardDialect::ansi(), &delete).unwrap();
        assert_eq!(emitted.text, "DELETE FROM orders\nWHERE (zone = 4)");
    }

    #[test]
    fn outer_columns_become_per_row_placeholders() {
        let (outer, t) = (TableAlias::fresh(), TableAlias::fresh());
        let select = SelectExpr::new(
            TableAlias::fresh(),
            vec![passthrough(t, "id")],
            Some(table(t, "orders")),
            Some(Expr::eq(int_column(t, "customer_id"), int_column(outer, "id"))),
        );
        let emitted = emit(&StandardDialect::ansi(), &select.into_ref()).unwrap();
        assert!(emitted.text.ends_with("WHERE (t0.customer_id = @o0_id)"), "{}", emitted.text);
        assert_eq!(emitted.outer_columns.len(), 1);
        assert_eq!(emitted.outer_columns[0].1.alias, outer);
    }
}
