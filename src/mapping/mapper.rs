use std::collections::HashSet;

use crate::binder::{bind_member, ColumnProjector};
use crate::dialect::QueryLanguage;
use crate::error::PlanResult;
use crate::expr::{join_conjunction, Expr, ExprRef, ProjectionExpr, Reduction, SelectExpr, TableAlias, TableExpr};
use crate::mapping::{EntityMapping, Mapping, RelationshipMapping};
use crate::model::ValueType;

pub fn table_expression(entity: &EntityMapping, alias: TableAlias) -> ExprRef {
    Expr::Table(TableExpr { alias, entity: entity.name.clone(), name: entity.table.clone() }).into_ref()
}

/// The entity as a constructed value whose members read the columns of
/// the table named `alias`.
pub fn entity_expression(language: &dyn QueryLanguage, entity: &EntityMapping, alias: TableAlias) -> ExprRef {
    let members = entity.members.iter().map(|m| {
        let sql_type = m.sql_type.unwrap_or_else(|| language.column_type(&m.ty));
        (m.name.clone(), Expr::column(alias, m.column.clone(), m.ty.clone(), sql_type))
    });
    Expr::Entity { entity: entity.name.clone(), expr: Expr::new_record(entity.name.clone(), members) }.into_ref()
}

/// `SELECT <all members> FROM <table>` as a projection producing entities.
pub fn query_expression(language: &dyn QueryLanguage, entity: &EntityMapping) -> PlanResult<ExprRef> {
    let table_alias = TableAlias::fresh();
    let select_alias = TableAlias::fresh();
    let row = entity_expression(language, entity, table_alias);
    let scope = HashSet::from([table_alias]);
    let pc = ColumnProjector::project(language, &row, &[], select_alias, &scope)?;
    let select = SelectExpr::new(select_alias, pc.columns, Some(table_expression(entity, table_alias)), None);
    Ok(Expr::projection(select, pc.projector))
}

/// The rows `source.<rel>` navigates to: the related table filtered by key
/// equality with `source`, which stays an outer reference.
pub fn relationship_projection(
    mapping: &dyn Mapping,
    language: &dyn QueryLanguage,
    source: &ExprRef,
    rel: &RelationshipMapping,
) -> PlanResult<ExprRef> {
    let related = mapping.entity_or_err(&rel.related_entity)?;
    let table_alias = TableAlias::fresh();
    let select_alias = TableAlias::fresh();
    let row = entity_expression(language, related, table_alias);

    let mut conditions = Vec::with_capacity(rel.key_members.len());
    for (key, related_key) in rel.key_members.iter().zip(&rel.related_key_members) {
        let outer = bind_member(mapping, source, key, ValueType::Unknown)?;
        let inner = bind_member(mapping, &row, related_key, ValueType::Unknown)?;
        conditions.push(Expr::eq(inner, outer));
    }

    let scope = HashSet::from([table_alias]);
    let pc = ColumnProjector::project(language, &row, &[], select_alias, &scope)?;
    let select = SelectExpr::new(
        select_alias,
        pc.columns,
        Some(table_expression(related, table_alias)),
        join_conjunction(conditions),
    );
    Ok(Expr::Projection(ProjectionExpr {
        select: select.into_ref(),
        projector: pc.projector,
        reduction: rel.singleton.then_some(Reduction::SingleOrDefault),
        is_singleton: rel.singleton,
    })
    .into_ref())
}
