use crate::expr::{ColumnDeclaration, ColumnExpr, Expr, ExprRef, OrderExpr, TableAlias};
use crate::model::SqlType;

/// A `SELECT` block. `alias` names the rows it produces for the enclosing
/// scope; `from` is `None` only for scalar selects such as `SELECT 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectExpr {
    pub alias: TableAlias,
    pub columns: Vec<ColumnDeclaration>,
    pub from: Option<ExprRef>,
    pub filter: Option<ExprRef>,
    pub order_by: Vec<OrderExpr>,
    pub group_by: Vec<ExprRef>,
    pub distinct: bool,
    pub skip: Option<ExprRef>,
    pub take: Option<ExprRef>,
    pub reverse: bool,
}

impl SelectExpr {
    pub fn new(alias: TableAlias, columns: Vec<ColumnDeclaration>, from: Option<ExprRef>, filter: Option<ExprRef>) -> Self {
        Self {
            alias,
            columns,
            from,
            filter,
            order_by: Vec::new(),
            group_by: Vec::new(),
            distinct: false,
            skip: None,
            take: None,
            reverse: false,
        }
    }

    pub fn with_alias(mut self, alias: TableAlias) -> Self {
        self.alias = alias;
        self
    }

    pub fn with_columns(mut self, columns: Vec<ColumnDeclaration>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_from(mut self, from: Option<ExprRef>) -> Self {
        self.from = from;
        self
    }

    pub fn with_filter(mut self, filter: Option<ExprRef>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_order_by(mut self, order_by: Vec<OrderExpr>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn with_group_by(mut self, group_by: Vec<ExprRef>) -> Self {
        self.group_by = group_by;
        self
    }

    pub fn with_distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    pub fn with_skip(mut self, skip: Option<ExprRef>) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_take(mut self, take: Option<ExprRef>) -> Self {
        self.take = take;
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn into_ref(self) -> ExprRef {
        Expr::Select(self).into_ref()
    }

    pub fn has_group_by(&self) -> bool {
        !self.group_by.is_empty()
    }

    pub fn has_order_by(&self) -> bool {
        !self.order_by.is_empty()
    }

    pub fn has_paging(&self) -> bool {
        self.skip.is_some() || self.take.is_some()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDeclaration> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column reference to a declared column of this select, as seen from
    /// the enclosing scope.
    pub fn column_ref(&self, decl: &ColumnDeclaration) -> ExprRef {
        Expr::Column(ColumnExpr {
            alias: self.alias,
            name: decl.name.clone(),
            ty: decl.expr.value_type(),
            sql_type: decl.sql_type,
        })
        .into_ref()
    }

    /// Appends a column under a free name and returns the name used.
    pub fn add_column(&mut self, base: &str, expr: ExprRef, sql_type: SqlType) -> String {
        let name = available_column_name(&self.columns, base);
        self.columns.push(ColumnDeclaration::new(name.clone(), expr, sql_type));
        name
    }

    pub fn remove_column(mut self, name: &str) -> Self {
        self.columns.retain(|c| c.name != name);
        self
    }

    /// Pushes everything this select does into a new inner select named
    /// `inner_alias`, leaving an outer select that keeps the original alias
    /// and re-exposes every column. References from above stay valid.
    pub fn add_redundant_select(&self, inner_alias: TableAlias) -> SelectExpr {
        let columns = self
            .columns
            .iter()
            .map(|d| {
                let reference = Expr::Column(ColumnExpr {
                    alias: inner_alias,
                    name: d.name.clone(),
                    ty: d.expr.value_type(),
                    sql_type: d.sql_type,
                })
                .into_ref();
                ColumnDeclaration::new(d.name.clone(), reference, d.sql_type)
            })
            .collect();
        let inner = self.clone().with_alias(inner_alias);
        SelectExpr::new(self.alias, columns, Some(inner.into_ref()), None)
    }
}

/// First name derived from `base` (`base`, `base1`, `base2`, ...) that no
/// declaration in `columns` uses yet.
pub fn available_column_name(columns: &[ColumnDeclaration], base: &str) -> String {
    let taken = |name: &str| columns.iter().any(|c| c.name == name);
    if !taken(base) {
        return base.to_string();
    }
    let mut suffix = 1;
    loop {
        let candidate = format!("{base}{suffix}");
        if !taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::TableExpr;
    use crate::model::ValueType;

    fn table(alias: TableAlias) -> ExprRef {
        Expr::Table(TableExpr { alias, entity: "Order".into(), name: "orders".into() }).into_ref()
    }

    #[test]
    fn available_name_skips_taken() {
        let t = TableAlias::fresh();
        let col = Expr::column(t, "id", ValueType::Int, SqlType::Integer);
        let columns = vec![
            ColumnDeclaration::new("c0", col.clone(), SqlType::Integer),
            ColumnDeclaration::new("c01", col.clone(), SqlType::Integer),
            ColumnDeclaration::new("c02", col, SqlType::Integer),
        ];
        assert_eq!(available_column_name(&columns, "c0"), "c03");
        assert_eq!(available_column_name(&columns, "id"), "id");
    }

    #[test]
    fn redundant_select_keeps_outer_alias() {
        let t = TableAlias::fresh();
        let s = TableAlias::fresh();
        let col = Expr::column(t, "id", ValueType::Int, SqlType::Integer);
        let select = SelectExpr::new(s, vec![ColumnDeclaration::new("id", col, SqlType::Integer)], Some(table(t)), None)
            .with_take(Some(Expr::int(3)));

        let inner_alias = TableAlias::fresh();
        let wrapped = select.add_redundant_select(inner_alias);
        assert_eq!(wrapped.alias, s);
        assert!(wrapped.take.is_none());
        let inner = wrapped.from.as_ref().and_then(|f| f.as_select()).unwrap();
        assert_eq!(inner.alias, inner_alias);
        assert!(inner.take.is_some());
        assert_eq!(wrapped.columns[0].expr.as_column().unwrap().alias, inner_alias);
    }
}
