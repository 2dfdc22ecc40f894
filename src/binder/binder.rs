use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use crate::binder::{bind_member, ColumnProjector, ProjectedColumns};
use crate::dialect::{ProjectionAffinity, QueryLanguage};
use crate::error::{PlanError, PlanResult};
use crate::expr::{
    all_declared_aliases, expect_projection, expect_select, join_conjunction, referenced_aliases, AggregateExpr,
    AggregateKind, AggregateSubqueryExpr, BinaryOp, ColumnDeclaration, ColumnMapper, Expr, ExprRef, InSource,
    JoinExpr, JoinKind, OrderDirection, OrderExpr, PlanPrinter, ProjectionExpr, QueryDuplicator, Reduction,
    SelectExpr, SetOperationExpr, SetOperationKind, StructuralComparer, TableAlias,
};
use crate::mapping::{query_expression, relationship_projection, Mapping};
use crate::model::{Value, ValueType};
use crate::query::{Lambda, Query, QueryRef};

/// Ties the element subquery of a group-by back to the grouped select so
/// aggregates over the group can later be folded into it.
#[derive(Clone)]
struct GroupByInfo {
    alias: TableAlias,
    element: ExprRef,
}

/// Lowers a [`Query`] tree into a plan: a `Projection` for reads, a command
/// node for writes.
pub struct QueryBinder<'a> {
    pub(crate) mapping: &'a dyn Mapping,
    pub(crate) language: &'a dyn QueryLanguage,
    scope: HashMap<String, ExprRef>,
    // The key handle is kept alive in the value so the address stays unique.
    group_by_map: HashMap<*const Expr, (ExprRef, GroupByInfo)>,
    current_group_element: Option<ExprRef>,
    then_bys: Option<Vec<(Lambda, OrderDirection)>>,
    root: QueryRef,
    path: Vec<String>,
}

impl<'a> QueryBinder<'a> {
    pub fn bind(mapping: &'a dyn Mapping, language: &'a dyn QueryLanguage, query: &QueryRef) -> PlanResult<ExprRef> {
        let mut binder = QueryBinder {
            mapping,
            language,
            scope: HashMap::new(),
            group_by_map: HashMap::new(),
            current_group_element: None,
            then_bys: None,
            root: query.clone(),
            path: Vec::new(),
        };
        binder.bind_query(query)
    }

    fn is_root(&self, query: &QueryRef) -> bool {
        Arc::ptr_eq(&self.root, query)
    }

    pub(crate) fn bind_query(&mut self, query: &QueryRef) -> PlanResult<ExprRef> {
        let name = query.operator_name();
        self.path.push(name.clone());
        let result = self.bind_operator(query).map_err(|err| match err {
            PlanError::AtOperator { .. } => err,
            other => other.at_operator(self.path.join(" > ")),
        });
        self.path.pop();
        if result.is_ok() {
            trace!(operator = %name, "bound");
        }
        result
    }

    fn bind_operator(&mut self, query: &QueryRef) -> PlanResult<ExprRef> {
        match &**query {
            Query::Source { entity } => query_expression(self.language, self.mapping.entity_or_err(entity)?),
            Query::Sequence(expr) => self.bind_expr(expr),
            Query::Filter { source, predicate } => self.bind_filter(source, predicate),
            Query::Project { source, selector } => self.bind_project(source, selector),
            Query::FlatMap { source, collection, result } => self.bind_flat_map(source, collection, result.as_ref()),
            Query::Join { outer, inner, outer_key, inner_key, result } => {
                self.bind_join(outer, inner, outer_key, inner_key, result)
            }
            Query::GroupBy { source, key, element, result } => {
                self.bind_group_by(source, key, element.as_ref(), result.as_ref())
            }
            Query::OrderBy { source, key, direction } => self.bind_order_by(source, key, *direction),
            Query::ThenBy { source, key, direction } => {
                self.then_bys.get_or_insert_with(Vec::new).push((key.clone(), *direction));
                self.bind_query(source)
            }
            Query::Distinct(source) => self.bind_distinct(source),
            Query::Reverse(source) => self.bind_wrapped(source, |select| select.with_reverse(true)),
            Query::Skip { source, count } => {
                let count = self.bind_expr(count)?;
                self.bind_wrapped(source, |select| select.with_skip(Some(count)))
            }
            Query::Take { source, count } => {
                let count = self.bind_expr(count)?;
                self.bind_wrapped(source, |select| select.with_take(Some(count)))
            }
            Query::DefaultIfEmpty(_) => Err(PlanError::unsupported(
                "DefaultIfEmpty",
                "only supported as the collection of a FlatMap",
            )),
            Query::Element { source, kind, predicate } => self.bind_element(source, *kind, predicate.as_ref()),
            Query::Any { source, predicate } => self.bind_any_all(query, source, predicate.as_ref(), false),
            Query::All { source, predicate } => self.bind_any_all(query, source, Some(predicate), true),
            Query::Contains { source, item } => self.bind_contains(query, source, item),
            Query::Aggregate { source, kind, argument } => self.bind_aggregate(query, source, *kind, argument.as_ref()),
            Query::SetOperation { kind, left, right } => self.bind_set_operation(*kind, left, right),
            Query::Insert { entity, instance } => self.bind_insert(entity, instance),
            Query::Update { entity, instance, check } => self.bind_update(entity, instance, check.as_ref()),
            Query::Delete { entity, predicate } => self.bind_delete(entity, predicate),
            Query::Batch { commands } => self.bind_batch(commands),
        }
    }

    /// Binds a lambda body host expression against the current scope.
    pub(crate) fn bind_expr(&mut self, expr: &ExprRef) -> PlanResult<ExprRef> {
        match &**expr {
            Expr::Parameter { name, .. } => self.scope.get(name).cloned().ok_or_else(|| {
                PlanError::unsupported(format!("parameter `{name}`"), "not bound by an enclosing lambda")
            }),
            Expr::Member { expr: source, member, ty } => {
                let source = self.bind_expr(source)?;
                bind_member(self.mapping, &source, member, ty.clone())
            }
            Expr::Query(query) => self.bind_query(query),
            Expr::Binary { op: BinaryOp::Power, .. } => {
                Err(PlanError::unsupported("Power", "exponentiation has no store translation"))
            }
            _ => crate::expr::map_children(expr, |child| self.bind_expr(child)),
        }
    }

    pub(crate) fn bind_lambda(&mut self, lambda: &Lambda, args: &[ExprRef]) -> PlanResult<ExprRef> {
        self.with_params(lambda, args, |binder| binder.bind_expr(&lambda.body))
    }

    fn with_params<T>(
        &mut self,
        lambda: &Lambda,
        args: &[ExprRef],
        f: impl FnOnce(&mut Self) -> PlanResult<T>,
    ) -> PlanResult<T> {
        if lambda.params.len() != args.len() {
            return Err(PlanError::unsupported(
                "lambda",
                format!("expected {} parameter(s), found {}", args.len(), lambda.params.len()),
            ));
        }
        let saved: Vec<(String, Option<ExprRef>)> = lambda
            .params
            .iter()
            .zip(args)
            .map(|(name, arg)| (name.clone(), self.scope.insert(name.clone(), arg.clone())))
            .collect();
        let result = f(self);
        for (name, previous) in saved {
            match previous {
                Some(e) => self.scope.insert(name, e),
                None => self.scope.remove(&name),
            };
        }
        result
    }

    fn visit_sequence(&mut self, query: &QueryRef) -> PlanResult<ExprRef> {
        let bound = self.bind_query(query)?;
        self.convert_to_sequence(bound)
    }

    fn convert_to_sequence(&mut self, expr: ExprRef) -> PlanResult<ExprRef> {
        match &*expr {
            Expr::Projection(_) => Ok(expr),
            Expr::Grouping { elements, .. } => self.convert_to_sequence(elements.clone()),
            Expr::OuterJoined { value, .. } => self.convert_to_sequence(value.clone()),
            Expr::Member { expr: source, member, .. } => {
                if let Expr::Entity { entity, .. } = &**source {
                    let mapped = self.mapping.entity_or_err(entity)?;
                    if let Some(rel) = mapped.relationship(member) {
                        return relationship_projection(self.mapping, self.language, source, rel);
                    }
                }
                Err(PlanError::NotASequence(PlanPrinter::print(&expr)))
            }
            _ => Err(PlanError::NotASequence(PlanPrinter::print(&expr))),
        }
    }

    fn project_columns(&self, expr: &ExprRef, new_alias: TableAlias, existing: &[TableAlias]) -> PlanResult<ProjectedColumns> {
        let scope: HashSet<TableAlias> = existing.iter().copied().collect();
        ColumnProjector::project(self.language, expr, &[], new_alias, &scope)
    }

    /// Re-projects a sequence through a new select built by `shape`.
    fn bind_wrapped(&mut self, source: &QueryRef, shape: impl FnOnce(SelectExpr) -> SelectExpr) -> PlanResult<ExprRef> {
        let projection = self.visit_sequence(source)?;
        let p = expect_projection(&projection)?;
        let source_alias = expect_select(&p.select)?.alias;
        let alias = TableAlias::fresh();
        let pc = self.project_columns(&p.projector, alias, &[source_alias])?;
        let select = shape(SelectExpr::new(alias, pc.columns, Some(p.select.clone()), None));
        Ok(Expr::projection(select, pc.projector))
    }

    fn bind_filter(&mut self, source: &QueryRef, predicate: &Lambda) -> PlanResult<ExprRef> {
        if predicate.params.len() != 1 {
            return Err(PlanError::unsupported("Filter", "index parameter is not supported"));
        }
        let projection = self.visit_sequence(source)?;
        let p = expect_projection(&projection)?;
        let filter = self.bind_lambda(predicate, &[p.projector.clone()])?;
        let source_alias = expect_select(&p.select)?.alias;
        let alias = TableAlias::fresh();
        let pc = self.project_columns(&p.projector, alias, &[source_alias])?;
        Ok(Expr::projection(SelectExpr::new(alias, pc.columns, Some(p.select.clone()), Some(filter)), pc.projector))
    }

    fn bind_project(&mut self, source: &QueryRef, selector: &Lambda) -> PlanResult<ExprRef> {
        if selector.params.len() != 1 {
            return Err(PlanError::unsupported("Project", "index parameter is not supported"));
        }
        let projection = self.visit_sequence(source)?;
        let p = expect_projection(&projection)?;
        let result = self.bind_lambda(selector, &[p.projector.clone()])?;
        let source_alias = expect_select(&p.select)?.alias;
        let alias = TableAlias::fresh();
        let pc = self.project_columns(&result, alias, &[source_alias])?;
        Ok(Expr::projection(SelectExpr::new(alias, pc.columns, Some(p.select.clone()), None), pc.projector))
    }

    fn bind_flat_map(&mut self, source: &QueryRef, collection: &Lambda, result: Option<&Lambda>) -> PlanResult<ExprRef> {
        if collection.params.len() != 1 {
            return Err(PlanError::unsupported("FlatMap", "index parameter is not supported"));
        }
        let projection = self.visit_sequence(source)?;
        let p = expect_projection(&projection)?;
        let outer_alias = expect_select(&p.select)?.alias;

        let (inner, default_if_empty) = match &*collection.body {
            Expr::Query(q) => match &**q {
                Query::DefaultIfEmpty(inner) => (Some(inner.clone()), true),
                _ => (Some(q.clone()), false),
            },
            _ => (None, false),
        };
        let bound = self.with_params(collection, &[p.projector.clone()], |binder| match &inner {
            Some(q) => binder.visit_sequence(q),
            None => {
                let e = binder.bind_expr(&collection.body)?;
                binder.convert_to_sequence(e)
            }
        })?;
        let cp = expect_projection(&bound)?;
        let inner_select = expect_select(&cp.select)?;
        let correlated = !referenced_aliases(&cp.select).is_subset(&all_declared_aliases(&cp.select));
        let is_table = matches!(inner_select.from.as_deref(), Some(Expr::Table(_))) && !correlated;
        let kind = if default_if_empty {
            JoinKind::OuterApply
        } else if is_table {
            JoinKind::Cross
        } else {
            JoinKind::CrossApply
        };
        let inner_projection = if kind == JoinKind::OuterApply {
            self.language.add_outer_join_test(cp)
        } else {
            bound.clone()
        };
        let cp = expect_projection(&inner_projection)?;
        let inner_alias = expect_select(&cp.select)?.alias;
        let join = Expr::Join(JoinExpr { kind, left: p.select.clone(), right: cp.select.clone(), condition: None }).into_ref();
        let result_expr = match result {
            Some(r) => self.bind_lambda(r, &[p.projector.clone(), cp.projector.clone()])?,
            None => cp.projector.clone(),
        };
        let alias = TableAlias::fresh();
        let pc = self.project_columns(&result_expr, alias, &[outer_alias, inner_alias])?;
        Ok(Expr::projection(SelectExpr::new(alias, pc.columns, Some(join), None), pc.projector))
    }

    fn bind_join(
        &mut self,
        outer: &QueryRef,
        inner: &QueryRef,
        outer_key: &Lambda,
        inner_key: &Lambda,
        result: &Lambda,
    ) -> PlanResult<ExprRef> {
        let outer_projection = self.visit_sequence(outer)?;
        let inner_projection = self.visit_sequence(inner)?;
        let op = expect_projection(&outer_projection)?;
        let ip = expect_projection(&inner_projection)?;
        let outer_key_expr = self.bind_lambda(outer_key, &[op.projector.clone()])?;
        let inner_key_expr = self.bind_lambda(inner_key, &[ip.projector.clone()])?;
        let result_expr = self.bind_lambda(result, &[op.projector.clone(), ip.projector.clone()])?;
        let join = Expr::Join(JoinExpr {
            kind: JoinKind::Inner,
            left: op.select.clone(),
            right: ip.select.clone(),
            condition: Some(Expr::eq(outer_key_expr, inner_key_expr)),
        })
        .into_ref();
        let alias = TableAlias::fresh();
        let aliases = [expect_select(&op.select)?.alias, expect_select(&ip.select)?.alias];
        let pc = self.project_columns(&result_expr, alias, &aliases)?;
        Ok(Expr::projection(SelectExpr::new(alias, pc.columns, Some(join), None), pc.projector))
    }

    fn bind_group_by(
        &mut self,
        source: &QueryRef,
        key: &Lambda,
        element: Option<&Lambda>,
        result: Option<&Lambda>,
    ) -> PlanResult<ExprRef> {
        let projection = self.visit_sequence(source)?;
        let p = expect_projection(&projection)?.clone();
        let source_alias = expect_select(&p.select)?.alias;

        let key_expr = self.bind_lambda(key, &[p.projector.clone()])?;
        let element_expr = match element {
            Some(e) => self.bind_lambda(e, &[p.projector.clone()])?,
            None => p.projector.clone(),
        };
        let key_pc = self.project_columns(&key_expr, source_alias, &[source_alias])?;
        let group_exprs: Vec<ExprRef> = key_pc.columns.iter().map(|c| c.expr.clone()).collect();

        // The per-group element subquery reads a duplicate of the source,
        // correlated to the outer group through the key.
        let basis = QueryDuplicator::duplicate(&projection)?;
        let b = expect_projection(&basis)?.clone();
        let basis_alias = expect_select(&b.select)?.alias;
        let basis_key = self.bind_lambda(key, &[b.projector.clone()])?;
        let basis_key_pc = self.project_columns(&basis_key, basis_alias, &[basis_alias])?;
        let basis_group_exprs: Vec<ExprRef> = basis_key_pc.columns.iter().map(|c| c.expr.clone()).collect();
        let correlation = predicate_with_nulls_equal(&basis_group_exprs, &group_exprs);
        let basis_element = match element {
            Some(e) => self.bind_lambda(e, &[b.projector.clone()])?,
            None => b.projector.clone(),
        };
        let element_alias = TableAlias::fresh();
        let element_pc = self.project_columns(&basis_element, element_alias, &[basis_alias])?;
        let element_subquery = Expr::projection(
            SelectExpr::new(element_alias, element_pc.columns, Some(b.select.clone()), correlation),
            element_pc.projector,
        );

        let alias = TableAlias::fresh();
        let info = GroupByInfo { alias, element: element_expr };
        self.group_by_map
            .insert(Arc::as_ptr(&element_subquery), (element_subquery.clone(), info.clone()));

        let result_expr = match result {
            Some(r) => {
                let saved = self.current_group_element.replace(element_subquery.clone());
                let bound = self.bind_lambda(r, &[key_pc.projector.clone(), element_subquery.clone()]);
                self.current_group_element = saved;
                bound?
            }
            None => Expr::Grouping { key: key_pc.projector.clone(), elements: element_subquery.clone() }.into_ref(),
        };
        let pc = self.project_columns(&result_expr, alias, &[source_alias])?;
        if let Expr::Grouping { elements, .. } = &*pc.projector {
            self.group_by_map.insert(Arc::as_ptr(elements), (elements.clone(), info));
        }
        let select = SelectExpr::new(alias, pc.columns, Some(p.select.clone()), None).with_group_by(group_exprs);
        Ok(Expr::projection(select, pc.projector))
    }

    fn bind_order_by(&mut self, source: &QueryRef, key: &Lambda, direction: OrderDirection) -> PlanResult<ExprRef> {
        let then_bys = self.then_bys.take();
        let projection = self.visit_sequence(source)?;
        let p = expect_projection(&projection)?;
        let source_alias = expect_select(&p.select)?.alias;

        let mut orderings = Vec::new();
        self.push_orderings(&mut orderings, key, direction, &p.projector)?;
        for (lambda, dir) in then_bys.iter().flatten().rev() {
            self.push_orderings(&mut orderings, lambda, *dir, &p.projector)?;
        }
        let alias = TableAlias::fresh();
        let pc = self.project_columns(&p.projector, alias, &[source_alias])?;
        let select = SelectExpr::new(alias, pc.columns, Some(p.select.clone()), None).with_order_by(orderings);
        Ok(Expr::projection(select, pc.projector))
    }

    fn push_orderings(
        &mut self,
        orderings: &mut Vec<OrderExpr>,
        key: &Lambda,
        direction: OrderDirection,
        projector: &ExprRef,
    ) -> PlanResult<()> {
        let bound = self.bind_lambda(key, &[projector.clone()])?;
        let record = match &*bound {
            Expr::Entity { expr, .. } => expr.clone(),
            _ => bound.clone(),
        };
        match &*record {
            Expr::New { members, .. } => {
                orderings.extend(members.iter().map(|(_, e)| OrderExpr::new(direction, e.clone())));
            }
            _ => orderings.push(OrderExpr::new(direction, bound)),
        }
        Ok(())
    }

    fn bind_distinct(&mut self, source: &QueryRef) -> PlanResult<ExprRef> {
        let projection = self.visit_sequence(source)?;
        let p = expect_projection(&projection)?;
        let source_alias = expect_select(&p.select)?.alias;
        let alias = TableAlias::fresh();
        let scope = HashSet::from([source_alias]);
        let pc = ColumnProjector::project_with(self.language, ProjectionAffinity::Server, &p.projector, &[], alias, &scope)?;
        let select = SelectExpr::new(alias, pc.columns, Some(p.select.clone()), None).with_distinct(true);
        Ok(Expr::projection(select, pc.projector))
    }

    fn bind_element(&mut self, source: &QueryRef, kind: Reduction, predicate: Option<&Lambda>) -> PlanResult<ExprRef> {
        let projection = self.visit_sequence(source)?;
        let p = expect_projection(&projection)?;
        let filter = predicate.map(|pr| self.bind_lambda(pr, &[p.projector.clone()])).transpose()?;
        let take = (kind.is_first() || kind.is_last()).then(|| Expr::int(1));

        let (select, projector) = if take.is_some() || filter.is_some() {
            let source_alias = expect_select(&p.select)?.alias;
            let alias = TableAlias::fresh();
            let pc = self.project_columns(&p.projector, alias, &[source_alias])?;
            let select = SelectExpr::new(alias, pc.columns, Some(p.select.clone()), filter)
                .with_take(take)
                .with_reverse(kind.is_last());
            (select.into_ref(), pc.projector)
        } else {
            (p.select.clone(), p.projector.clone())
        };
        Ok(Expr::Projection(ProjectionExpr { select, projector, reduction: Some(kind), is_singleton: true }).into_ref())
    }

    fn literal_collection(source: &QueryRef) -> Option<Vec<Value>> {
        match &**source {
            Query::Sequence(e) => match &**e {
                Expr::Constant { value: Value::List(items), .. } | Expr::Captured { value: Value::List(items), .. } => {
                    Some(items.clone())
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// A one-row, one-column select with no `FROM`.
    fn singleton_sequence(&self, expr: ExprRef, reduction: Reduction) -> ExprRef {
        let alias = TableAlias::fresh();
        let ty = expr.value_type();
        let sql_type = self.language.column_type(&ty);
        let select = SelectExpr::new(alias, vec![ColumnDeclaration::new("value", expr, sql_type)], None, None);
        Expr::Projection(ProjectionExpr {
            select: select.into_ref(),
            projector: Expr::column(alias, "value", ty, sql_type),
            reduction: Some(reduction),
            is_singleton: true,
        })
        .into_ref()
    }

    fn bind_any_all(
        &mut self,
        query: &QueryRef,
        source: &QueryRef,
        predicate: Option<&Lambda>,
        is_all: bool,
    ) -> PlanResult<ExprRef> {
        if let Some(values) = Self::literal_collection(source) {
            let Some(predicate) = predicate else {
                return Ok(Expr::constant(Value::Bool(!values.is_empty())));
            };
            let mut combined: Option<ExprRef> = None;
            for value in values {
                let test = self.bind_lambda(predicate, &[Expr::constant(value)])?;
                combined = Some(match combined {
                    None => test,
                    Some(acc) if is_all => Expr::and(acc, test),
                    Some(acc) => Expr::or(acc, test),
                });
            }
            return Ok(combined.unwrap_or_else(|| Expr::constant(Value::Bool(is_all))));
        }

        let filter = predicate.map(|p| {
            if is_all {
                Lambda { params: p.params.clone(), body: Expr::not(p.body.clone()) }
            } else {
                p.clone()
            }
        });
        let projection = match &filter {
            Some(f) => self.bind_filter(source, f)?,
            None => self.visit_sequence(source)?,
        };
        let p = expect_projection(&projection)?;
        let exists = Expr::Exists { select: p.select.clone() }.into_ref();
        let result = if is_all { Expr::not(exists) } else { exists };
        if !self.is_root(query) {
            return Ok(result);
        }
        if self.language.allows_subquery_in_select_without_from() {
            return Ok(self.singleton_sequence(result, Reduction::SingleOrDefault));
        }
        // No FROM-less selects: count the matching rows instead.
        let sql_type = self.language.column_type(&ValueType::Int);
        let count = Expr::Aggregate(AggregateExpr { kind: AggregateKind::Count, argument: None, distinct: false, ty: ValueType::Int }).into_ref();
        let columns = vec![ColumnDeclaration::new("value", count, sql_type)];
        let source_select = expect_select(&p.select)?;
        // Grouping, paging and DISTINCT shape the rows being counted, so they
        // stay in a derived table below the count.
        let select = if source_select.has_group_by() || source_select.has_paging() || source_select.distinct {
            SelectExpr::new(TableAlias::fresh(), columns, Some(p.select.clone()), None)
        } else {
            source_select.clone().with_columns(columns).with_order_by(Vec::new()).with_reverse(false)
        };
        let value = Expr::column(select.alias, "value", ValueType::Int, sql_type);
        let projector = if is_all {
            Expr::eq(value, Expr::int(0))
        } else {
            Expr::binary(BinaryOp::GreaterThan, value, Expr::int(0))
        };
        Ok(Expr::Projection(ProjectionExpr {
            select: select.into_ref(),
            projector,
            reduction: Some(Reduction::Single),
            is_singleton: true,
        })
        .into_ref())
    }

    fn bind_contains(&mut self, query: &QueryRef, source: &QueryRef, item: &ExprRef) -> PlanResult<ExprRef> {
        if let Some(values) = Self::literal_collection(source) {
            let item = self.bind_expr(item)?;
            if values.is_empty() {
                return Ok(Expr::constant(Value::Bool(false)));
            }
            let values = values.into_iter().map(Expr::constant).collect();
            return Ok(Expr::In { expr: item, source: InSource::Values(values) }.into_ref());
        }
        if self.is_root(query) && !self.language.allows_subquery_in_select_without_from() {
            let ty = item.value_type();
            let element = Expr::parameter("item$", ty);
            let any = Query::Any { source: source.clone(), predicate: Some(Lambda::new("item$", Expr::eq(element, item.clone()))) }
                .into_ref();
            self.root = any.clone();
            return self.bind_query(&any);
        }
        let projection = self.visit_sequence(source)?;
        let p = expect_projection(&projection)?;
        let item = self.bind_expr(item)?;
        let result = Expr::In { expr: item, source: InSource::Select(p.select.clone()) }.into_ref();
        if self.is_root(query) {
            return Ok(self.singleton_sequence(result, Reduction::SingleOrDefault));
        }
        Ok(result)
    }

    fn bind_aggregate(
        &mut self,
        query: &QueryRef,
        source: &QueryRef,
        kind: AggregateKind,
        argument: Option<&Lambda>,
    ) -> PlanResult<ExprRef> {
        let mut source = source.clone();
        let mut argument = argument.cloned();
        let mut distinct = false;
        let mut argument_was_predicate = false;

        if !kind.takes_predicate() && argument.is_none() {
            if let Query::Distinct(inner) = &*source {
                source = inner.clone();
                distinct = true;
            }
        }
        if kind.takes_predicate() {
            if let Some(predicate) = argument.take() {
                source = Query::Filter { source, predicate }.into_ref();
                argument_was_predicate = true;
            }
        }

        let projection = self.visit_sequence(&source)?;
        let p = expect_projection(&projection)?;
        let argument_expr = match &argument {
            Some(a) => Some(self.bind_lambda(a, &[p.projector.clone()])?),
            None if !kind.takes_predicate() => Some(p.projector.clone()),
            None => None,
        };
        let ty = aggregate_type(kind, argument_expr.as_ref());
        let sql_type = self.language.column_type(&ty);
        let aggregate = Expr::Aggregate(AggregateExpr { kind, argument: argument_expr, distinct, ty: ty.clone() }).into_ref();
        let alias = TableAlias::fresh();
        let select = SelectExpr::new(alias, vec![ColumnDeclaration::new("agg", aggregate, sql_type)], Some(p.select.clone()), None);

        if self.is_root(query) {
            return Ok(Expr::Projection(ProjectionExpr {
                select: select.into_ref(),
                projector: Expr::column(alias, "agg", ty, sql_type),
                reduction: Some(Reduction::Single),
                is_singleton: true,
            })
            .into_ref());
        }

        let subquery = Expr::Scalar { select: select.into_ref(), ty: ty.clone() }.into_ref();
        if argument_was_predicate {
            return Ok(subquery);
        }
        let Some((_, info)) = self.group_by_map.get(&Arc::as_ptr(&projection)).cloned() else {
            return Ok(subquery);
        };
        // Rebind the argument against the element as seen from the grouped
        // select so the aggregate is legal as one of its columns.
        let argument_expr = match &argument {
            Some(a) => Some(self.bind_lambda(a, &[info.element.clone()])?),
            None if !kind.takes_predicate() => Some(info.element.clone()),
            None => None,
        };
        let aggregate = Expr::Aggregate(AggregateExpr { kind, argument: argument_expr, distinct, ty: ty.clone() }).into_ref();
        if self.current_group_element.as_ref().is_some_and(|e| Arc::ptr_eq(e, &projection)) {
            return Ok(aggregate);
        }
        Ok(Expr::AggregateSubquery(AggregateSubqueryExpr {
            group_by_alias: info.alias,
            aggregate_in_group_select: aggregate,
            subquery,
            ty,
        })
        .into_ref())
    }

    fn bind_set_operation(&mut self, kind: SetOperationKind, left: &QueryRef, right: &QueryRef) -> PlanResult<ExprRef> {
        let left_projection = self.visit_sequence(left)?;
        let right_projection = self.visit_sequence(right)?;
        let lp = expect_projection(&left_projection)?;
        let rp = expect_projection(&right_projection)?;
        let left_source = expect_select(&lp.select)?.alias;
        let right_source = expect_select(&rp.select)?.alias;

        match kind {
            SetOperationKind::Union | SetOperationKind::Concat => {
                let (la, ra) = (TableAlias::fresh(), TableAlias::fresh());
                let lpc = self.project_columns(&lp.projector, la, &[left_source])?;
                let rpc = self.project_columns(&rp.projector, ra, &[right_source])?;
                let same_columns = lpc.columns.len() == rpc.columns.len()
                    && lpc.columns.iter().zip(&rpc.columns).all(|(l, r)| l.name == r.name);
                let mut comparer = StructuralComparer::default();
                comparer.assume(la, ra);
                if !same_columns || !comparer.compare(&lpc.projector, &rpc.projector) {
                    return Err(PlanError::unsupported(format!("{kind:?}"), "operands project different shapes"));
                }
                let set_alias = TableAlias::fresh();
                let set = Expr::SetOperation(SetOperationExpr {
                    kind,
                    alias: set_alias,
                    left: SelectExpr::new(la, lpc.columns, Some(lp.select.clone()), None).into_ref(),
                    right: SelectExpr::new(ra, rpc.columns, Some(rp.select.clone()), None).into_ref(),
                })
                .into_ref();
                let projector = ColumnMapper::map(&lpc.projector, set_alias, &HashSet::from([la]))?;
                let alias = TableAlias::fresh();
                let pc = self.project_columns(&projector, alias, &[set_alias])?;
                Ok(Expr::projection(SelectExpr::new(alias, pc.columns, Some(set), None), pc.projector))
            }
            SetOperationKind::Intersect | SetOperationKind::Except => {
                let condition = Expr::eq(lp.projector.clone(), rp.projector.clone());
                let matching = SelectExpr::new(TableAlias::fresh(), vec![], Some(rp.select.clone()), Some(condition));
                let exists = Expr::Exists { select: matching.into_ref() }.into_ref();
                let test = if kind == SetOperationKind::Except { Expr::not(exists) } else { exists };
                let alias = TableAlias::fresh();
                let scope = HashSet::from([left_source]);
                let pc = ColumnProjector::project_with(self.language, ProjectionAffinity::Server, &lp.projector, &[], alias, &scope)?;
                let select = SelectExpr::new(alias, pc.columns, Some(lp.select.clone()), Some(test)).with_distinct(true);
                Ok(Expr::projection(select, pc.projector))
            }
        }
    }
}

/// `a1 = b1 AND ...`, where two nulls also compare equal.
fn predicate_with_nulls_equal(left: &[ExprRef], right: &[ExprRef]) -> Option<ExprRef> {
    join_conjunction(left.iter().zip(right).map(|(a, b)| {
        Expr::or(
            Expr::eq(a.clone(), b.clone()),
            Expr::and(Expr::IsNull(a.clone()).into_ref(), Expr::IsNull(b.clone()).into_ref()),
        )
    }))
}

fn aggregate_type(kind: AggregateKind, argument: Option<&ExprRef>) -> ValueType {
    match kind {
        AggregateKind::Count => ValueType::Int,
        AggregateKind::LongCount => ValueType::Long,
        AggregateKind::Average => match argument.map(|a| a.value_type()) {
            Some(ValueType::Decimal) => ValueType::Decimal,
            _ => ValueType::Float,
        },
        AggregateKind::Sum | AggregateKind::Min | AggregateKind::Max => {
            argument.map(|a| a.value_type()).unwrap_or(ValueType::Unknown)
        }
    }
}
