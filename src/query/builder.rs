use crate::expr::{AggregateKind, Expr, ExprRef, OrderDirection, Reduction, SetOperationKind};
use crate::query::{Lambda, Query, QueryRef};

/// Fluent construction of [`Query`] trees.
///
/// ```
/// use plansmith::query::{QueryBuilder, Lambda};
/// use plansmith::expr::Expr;
/// use plansmith::model::ValueType;
///
/// let order = Expr::parameter("o", ValueType::Entity("Order".into()));
/// let zone = Expr::member(order, "Zone", ValueType::Int);
/// let query = QueryBuilder::source("Order")
///     .filter(Lambda::new("o", Expr::eq(zone, Expr::int(1))))
///     .count()
///     .build();
/// assert_eq!(query.operator_name(), "Count");
/// ```
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    query: QueryRef,
}

impl QueryBuilder {
    pub fn source(entity: impl Into<String>) -> Self {
        Self::from_query(Query::Source { entity: entity.into() })
    }

    pub fn sequence(expr: ExprRef) -> Self {
        Self::from_query(Query::Sequence(expr))
    }

    pub fn from_query(query: Query) -> Self {
        Self { query: query.into_ref() }
    }

    fn wrap(self, f: impl FnOnce(QueryRef) -> Query) -> Self {
        Self::from_query(f(self.query))
    }

    pub fn filter(self, predicate: Lambda) -> Self {
        self.wrap(|source| Query::Filter { source, predicate })
    }

    pub fn project(self, selector: Lambda) -> Self {
        self.wrap(|source| Query::Project { source, selector })
    }

    pub fn flat_map(self, collection: Lambda, result: Option<Lambda>) -> Self {
        self.wrap(|source| Query::FlatMap { source, collection, result })
    }

    pub fn join(self, inner: QueryBuilder, outer_key: Lambda, inner_key: Lambda, result: Lambda) -> Self {
        self.wrap(|outer| Query::Join { outer, inner: inner.query, outer_key, inner_key, result })
    }

    pub fn group_by(self, key: Lambda) -> Self {
        self.group_by_with(key, None, None)
    }

    pub fn group_by_with(self, key: Lambda, element: Option<Lambda>, result: Option<Lambda>) -> Self {
        self.wrap(|source| Query::GroupBy { source, key, element, result })
    }

    pub fn order_by(self, key: Lambda) -> Self {
        self.wrap(|source| Query::OrderBy { source, key, direction: OrderDirection::Ascending })
    }

    pub fn order_by_desc(self, key: Lambda) -> Self {
        self.wrap(|source| Query::OrderBy { source, key, direction: OrderDirection::Descending })
    }

    pub fn then_by(self, key: Lambda) -> Self {
        self.wrap(|source| Query::ThenBy { source, key, direction: OrderDirection::Ascending })
    }

    pub fn then_by_desc(self, key: Lambda) -> Self {
        self.wrap(|source| Query::ThenBy { source, key, direction: OrderDirection::Descending })
    }

    pub fn distinct(self) -> Self {
        self.wrap(Query::Distinct)
    }

    pub fn reverse(self) -> Self {
        self.wrap(Query::Reverse)
    }

    pub fn skip(self, count: ExprRef) -> Self {
        self.wrap(|source| Query::Skip { source, count })
    }

    pub fn take(self, count: ExprRef) -> Self {
        self.wrap(|source| Query::Take { source, count })
    }

    pub fn default_if_empty(self) -> Self {
        self.wrap(Query::DefaultIfEmpty)
    }

    pub fn element(self, kind: Reduction, predicate: Option<Lambda>) -> Self {
        self.wrap(|source| Query::Element { source, kind, predicate })
    }

    pub fn first(self) -> Self {
        self.element(Reduction::First, None)
    }

    pub fn first_or_default(self) -> Self {
        self.element(Reduction::FirstOrDefault, None)
    }

    pub fn single(self) -> Self {
        self.element(Reduction::Single, None)
    }

    pub fn any(self, predicate: Option<Lambda>) -> Self {
        self.wrap(|source| Query::Any { source, predicate })
    }

    pub fn all(self, predicate: Lambda) -> Self {
        self.wrap(|source| Query::All { source, predicate })
    }

    pub fn contains(self, item: ExprRef) -> Self {
        self.wrap(|source| Query::Contains { source, item })
    }

    pub fn aggregate(self, kind: AggregateKind, argument: Option<Lambda>) -> Self {
        self.wrap(|source| Query::Aggregate { source, kind, argument })
    }

    pub fn count(self) -> Self {
        self.aggregate(AggregateKind::Count, None)
    }

    pub fn sum(self, selector: Lambda) -> Self {
        self.aggregate(AggregateKind::Sum, Some(selector))
    }

    pub fn set_operation(self, kind: SetOperationKind, other: QueryBuilder) -> Self {
        self.wrap(|left| Query::SetOperation { kind, left, right: other.query })
    }

    pub fn union(self, other: QueryBuilder) -> Self {
        self.set_operation(SetOperationKind::Union, other)
    }

    pub fn concat(self, other: QueryBuilder) -> Self {
        self.set_operation(SetOperationKind::Concat, other)
    }

    pub fn build(self) -> QueryRef {
        self.query
    }

    /// The query as a host expression, for nesting inside a lambda body.
    pub fn into_expr(self) -> ExprRef {
        Expr::Query(self.query).into_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::model::ValueType;

    #[test]
    fn builder_nests_outermost_last() {
        let o = Expr::parameter("o", ValueType::Entity("Order".into()));
        let q = QueryBuilder::source("Order")
            .order_by(Lambda::new("o", Expr::member(o, "Id", ValueType::Int)))
            .take(Expr::int(5))
            .build();
        match &*q {
            Query::Take { source, .. } => assert!(matches!(&**source, Query::OrderBy { .. })),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!q.is_terminal());
    }
}
