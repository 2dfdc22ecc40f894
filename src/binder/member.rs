use crate::error::{PlanError, PlanResult};
use crate::expr::{Expr, ExprRef};
use crate::mapping::Mapping;
use crate::model::ValueType;

/// Resolves `source.member` against an already bound source.
///
/// Constructed values and entities yield the member's expression directly;
/// relationship members of an entity stay as `Member` nodes for the
/// relationship binder. Anything else is kept as a plain member access.
pub fn bind_member(mapping: &dyn Mapping, source: &ExprRef, member: &str, ty: ValueType) -> PlanResult<ExprRef> {
    match &**source {
        Expr::New { type_name, members } => members
            .iter()
            .find(|(name, _)| name == member)
            .map(|(_, e)| e.clone())
            .ok_or_else(|| PlanError::UnknownMember { entity: type_name.clone(), member: member.to_string() }),
        Expr::Entity { entity, expr } => {
            let mapped = mapping.entity_or_err(entity)?;
            if let Some(m) = mapped.member(member) {
                return bind_member(mapping, expr, &m.name, m.ty.clone());
            }
            match mapped.relationship(member) {
                Some(rel) => {
                    let related = ValueType::Entity(rel.related_entity.clone());
                    let ty = if rel.singleton { related } else { ValueType::sequence_of(related) };
                    Ok(Expr::member(source.clone(), member, ty))
                }
                None => Err(PlanError::UnknownMember { entity: entity.clone(), member: member.to_string() }),
            }
        }
        Expr::OuterJoined { test, value } => {
            let inner = bind_member(mapping, value, member, ty)?;
            if inner.as_column().is_some() {
                Ok(inner)
            } else {
                Ok(Expr::OuterJoined { test: test.clone(), value: inner }.into_ref())
            }
        }
        Expr::Grouping { key, .. } if member == "Key" => Ok(key.clone()),
        Expr::Conditional { test, if_true, if_false, .. } => {
            let if_true = bind_member(mapping, if_true, member, ty.clone())?;
            let if_false = bind_member(mapping, if_false, member, ty.clone())?;
            Ok(Expr::Conditional { test: test.clone(), if_true, if_false, ty }.into_ref())
        }
        Expr::Constant { value, .. } => match value.member(member) {
            Some(v) => Ok(Expr::typed_constant(v, ty)),
            None => Err(PlanError::UnknownMember { entity: value.value_type().to_string(), member: member.to_string() }),
        },
        Expr::Projection(_) | Expr::ClientJoin(_) => {
            Err(PlanError::unsupported(format!("member `{member}`"), "member access on a sequence"))
        }
        _ => Ok(Expr::member(source.clone(), member, ty)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::TableAlias;
    use crate::mapping::{BasicMapping, EntityMapping, MemberMapping, RelationshipMapping};
    use crate::dialect::StandardDialect;
    use crate::mapping::entity_expression;
    use crate::model::SqlType;

    fn mapping() -> BasicMapping {
        BasicMapping::new()
            .with_entity(
                EntityMapping::new("Customer", "customers")
                    .with_member(MemberMapping::new("Id", "id", ValueType::Int).key())
                    .with_relationship(RelationshipMapping {
                        name: "Orders".into(),
                        related_entity: "Order".into(),
                        key_members: vec!["Id".into()],
                        related_key_members: vec!["CustomerId".into()],
                        singleton: false,
                    }),
            )
            .with_entity(
                EntityMapping::new("Order", "orders")
                    .with_member(MemberMapping::new("Id", "id", ValueType::Int).key())
                    .with_member(MemberMapping::new("CustomerId", "customer_id", ValueType::Int)),
            )
    }

    #[test]
    fn entity_member_resolves_to_column() {
        let m = mapping();
        let alias = TableAlias::fresh();
        let entity = entity_expression(&StandardDialect::ansi(), m.entity("Customer").unwrap(), alias);
        let id = bind_member(&m, &entity, "Id", ValueType::Unknown).unwrap();
        let col = id.as_column().unwrap();
        assert_eq!((col.alias, col.name.as_str()), (alias, "id"));
        assert_eq!(col.sql_type, SqlType::Integer);
    }

    #[test]
    fn relationship_member_is_deferred() {
        let m = mapping();
        let entity = entity_expression(&StandardDialect::ansi(), m.entity("Customer").unwrap(), TableAlias::fresh());
        let orders = bind_member(&m, &entity, "Orders", ValueType::Unknown).unwrap();
        assert!(matches!(&*orders, Expr::Member { member, .. } if member == "Orders"));
        assert!(orders.value_type().is_sequence());
    }

    #[test]
    fn unknown_member_fails() {
        let m = mapping();
        let entity = entity_expression(&StandardDialect::ansi(), m.entity("Customer").unwrap(), TableAlias::fresh());
        let err = bind_member(&m, &entity, "Nope", ValueType::Unknown).unwrap_err();
        assert!(matches!(err, PlanError::UnknownMember { .. }));
    }

    #[test]
    fn outer_joined_column_unwraps() {
        let m = mapping();
        let alias = TableAlias::fresh();
        let entity = entity_expression(&StandardDialect::ansi(), m.entity("Order").unwrap(), alias);
        let test = Expr::column(alias, "Test", ValueType::Int, SqlType::Integer);
        let joined = Expr::OuterJoined { test, value: entity }.into_ref();
        let id = bind_member(&m, &joined, "Id", ValueType::Int).unwrap();
        assert!(id.as_column().is_some());
    }
}
