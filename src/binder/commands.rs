use crate::binder::{bind_member, QueryBinder};
use crate::error::{PlanError, PlanResult};
use crate::expr::{
    join_conjunction, BatchCommand, ColumnAssignment, DeleteCommand, Expr, ExprRef, InsertCommand, TableAlias,
    UpdateCommand,
};
use crate::mapping::{entity_expression, table_expression, EntityMapping, MemberMapping};
use crate::query::{Lambda, QueryRef};

impl<'a> QueryBinder<'a> {
    fn member_column(&self, member: &MemberMapping, alias: TableAlias) -> ExprRef {
        let sql_type = member.sql_type.unwrap_or_else(|| self.language.column_type(&member.ty));
        Expr::column(alias, member.column.clone(), member.ty.clone(), sql_type)
    }

    fn assignments<'m>(
        &self,
        members: impl Iterator<Item = &'m MemberMapping>,
        instance: &ExprRef,
        alias: TableAlias,
    ) -> PlanResult<Vec<ColumnAssignment>> {
        members
            .map(|m| {
                Ok(ColumnAssignment {
                    column: self.member_column(m, alias),
                    expr: bind_member(self.mapping, instance, &m.name, m.ty.clone())?,
                })
            })
            .collect()
    }

    pub(crate) fn bind_insert(&mut self, entity: &str, instance: &ExprRef) -> PlanResult<ExprRef> {
        let mapping = self.mapping;
        let mapped = mapping.entity_or_err(entity)?;
        let instance = self.bind_expr(instance)?;
        let alias = TableAlias::fresh();
        let assignments = self.assignments(mapped.members.iter().filter(|m| !m.generated), &instance, alias)?;
        Ok(Expr::Insert(InsertCommand { table: table_expression(mapped, alias), assignments }).into_ref())
    }

    pub(crate) fn bind_update(&mut self, entity: &str, instance: &ExprRef, check: Option<&Lambda>) -> PlanResult<ExprRef> {
        let mapping = self.mapping;
        let mapped = mapping.entity_or_err(entity)?;
        let instance = self.bind_expr(instance)?;
        let alias = TableAlias::fresh();

        let mut conditions = self.key_predicates(mapped, &instance, alias)?;
        if let Some(check) = check {
            let row = entity_expression(self.language, mapped, alias);
            conditions.push(self.bind_lambda(check, &[row])?);
        }
        let assignments = self.assignments(
            mapped.members.iter().filter(|m| !m.primary_key && !m.generated),
            &instance,
            alias,
        )?;
        Ok(Expr::Update(UpdateCommand {
            table: table_expression(mapped, alias),
            filter: join_conjunction(conditions),
            assignments,
        })
        .into_ref())
    }

    fn key_predicates(&self, mapped: &EntityMapping, instance: &ExprRef, alias: TableAlias) -> PlanResult<Vec<ExprRef>> {
        let keys: Vec<&MemberMapping> = mapped.primary_key().collect();
        if keys.is_empty() {
            return Err(PlanError::unsupported(
                format!("Update of {}", mapped.name),
                "entity declares no primary key",
            ));
        }
        keys.into_iter()
            .map(|k| Ok(Expr::eq(self.member_column(k, alias), bind_member(self.mapping, instance, &k.name, k.ty.clone())?)))
            .collect()
    }

    pub(crate) fn bind_delete(&mut self, entity: &str, predicate: &Lambda) -> PlanResult<ExprRef> {
        let mapping = self.mapping;
        let mapped = mapping.entity_or_err(entity)?;
        let alias = TableAlias::fresh();
        let row = entity_expression(self.language, mapped, alias);
        let filter = self.bind_lambda(predicate, &[row])?;
        Ok(Expr::Delete(DeleteCommand { table: table_expression(mapped, alias), filter: Some(filter) }).into_ref())
    }

    pub(crate) fn bind_batch(&mut self, commands: &[QueryRef]) -> PlanResult<ExprRef> {
        let mut bound = Vec::with_capacity(commands.len());
        for command in commands {
            if !command.is_command() {
                return Err(PlanError::unsupported("Batch", format!("`{}` is not a command", command.operator_name())));
            }
            bound.push(self.bind_query(command)?);
        }
        Ok(Expr::Batch(BatchCommand { commands: bound }).into_ref())
    }
}

#[cfg(test)]
mod tests {
    use crate::binder::QueryBinder;
    use crate::dialect::StandardDialect;
    use crate::expr::{BinaryOp, Expr};
    use crate::fixtures;
    use crate::model::{Value, ValueType};
    use crate::query::{Lambda, Query};

    #[test]
    fn insert_skips_generated_members() {
        let mapping = fixtures::mapping();
        let order = Value::record([("Id", Value::Int(7)), ("CustomerId", Value::Int(1)), ("Zone", Value::Int(2))]);
        let query = Query::Insert { entity: "Order".into(), instance: Expr::captured("order", order) }.into_ref();
        let bound = QueryBinder::bind(&mapping, &StandardDialect::ansi(), &query).unwrap();
        let Expr::Insert(insert) = &*bound else { panic!("expected insert, got {bound}") };
        let columns: Vec<String> = insert
            .assignments
            .iter()
            .filter_map(|a| a.column.as_column().map(|c| c.name.clone()))
            .collect();
        assert!(!columns.contains(&"id".to_string()));
        assert!(columns.contains(&"zone".to_string()));
    }

    #[test]
    fn update_filters_on_primary_key() {
        let mapping = fixtures::mapping();
        let customer = Value::record([("Id", Value::Int(3)), ("Name", Value::from("Ann")), ("City", Value::from("Oslo"))]);
        let query = Query::Update { entity: "Customer".into(), instance: Expr::captured("c", customer), check: None }.into_ref();
        let bound = QueryBinder::bind(&mapping, &StandardDialect::ansi(), &query).unwrap();
        let Expr::Update(update) = &*bound else { panic!("expected update, got {bound}") };
        assert_eq!(update.assignments.len(), 2);
        let filter = update.filter.as_ref().unwrap();
        assert!(matches!(&**filter, Expr::Binary { op: BinaryOp::Equal, .. }));
    }

    #[test]
    fn delete_binds_predicate_against_table_row() {
        let mapping = fixtures::mapping();
        let predicate = Lambda::new(
            "o",
            Expr::eq(fixtures::member("o", "Order", "Zone", ValueType::Int), Expr::int(4)),
        );
        let query = Query::Delete { entity: "Order".into(), predicate }.into_ref();
        let bound = QueryBinder::bind(&mapping, &StandardDialect::ansi(), &query).unwrap();
        assert!(bound.to_string().contains("zone == 4"), "{bound}");
    }

    #[test]
    fn batch_rejects_read_queries() {
        let mapping = fixtures::mapping();
        let query = Query::Batch { commands: vec![Query::Source { entity: "Order".into() }.into_ref()] }.into_ref();
        assert!(QueryBinder::bind(&mapping, &StandardDialect::ansi(), &query).is_err());
    }
}
