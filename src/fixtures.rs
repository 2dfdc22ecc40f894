//! Shared mapping and expression helpers for unit tests.

use crate::expr::{ColumnDeclaration, Expr, ExprRef, TableAlias, TableExpr};
use crate::mapping::{BasicMapping, EntityMapping, MemberMapping, RelationshipMapping};
use crate::model::{SqlType, ValueType};

/// `Customer 1 - * Order`, keyed by integer ids.
pub fn mapping() -> BasicMapping {
    BasicMapping::new()
        .with_entity(
            EntityMapping::new("Customer", "customers")
                .with_member(MemberMapping::new("Id", "id", ValueType::Int).key())
                .with_member(MemberMapping::new("Name", "name", ValueType::String))
                .with_member(MemberMapping::new("City", "city", ValueType::String))
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
                .with_member(MemberMapping::new("Id", "id", ValueType::Int).key().generated())
                .with_member(MemberMapping::new("CustomerId", "customer_id", ValueType::Int))
                .with_member(MemberMapping::new("Zone", "zone", ValueType::Int))
                .with_member(MemberMapping::new("Total", "total", ValueType::Float))
                .with_relationship(RelationshipMapping {
                    name: "Customer".into(),
                    related_entity: "Customer".into(),
                    key_members: vec!["CustomerId".into()],
                    related_key_members: vec!["Id".into()],
                    singleton: true,
                }),
        )
}

pub fn param(name: &str, entity: &str) -> ExprRef {
    Expr::parameter(name, ValueType::Entity(entity.into()))
}

/// `name.member` where `name` is a lambda parameter of entity type.
pub fn member(name: &str, entity: &str, member: &str, ty: ValueType) -> ExprRef {
    Expr::member(param(name, entity), member, ty)
}

pub fn table(alias: TableAlias, name: &str) -> ExprRef {
    Expr::Table(TableExpr { alias, entity: name.into(), name: name.into() }).into_ref()
}

pub fn int_column(alias: TableAlias, name: &str) -> ExprRef {
    Expr::column(alias, name, ValueType::Int, SqlType::Integer)
}

/// Declaration re-exposing `alias.name` under the same name.
pub fn passthrough(alias: TableAlias, name: &str) -> ColumnDeclaration {
    ColumnDeclaration::new(name, int_column(alias, name), SqlType::Integer)
}
