use std::sync::Arc;

use tracing::{debug, debug_span, trace};

use crate::binder::QueryBinder;
use crate::dialect::{QueryLanguage, SqlEmitter, SqlFormatter, DEFAULT_DIALECT};
use crate::error::{PlanError, PlanResult};
use crate::expr::{children, contains_projection, expect_projection, validate_aliases, walk, Expr, ExprRef, PlanPrinter, ProjectionExpr};
use crate::mapping::Mapping;
use crate::passes::{run_pass, PassContext, PassKind};
use crate::query::QueryRef;
use crate::translator::{ClientJoinKeys, NestedQuery, QueryParameter, ResultMaterializer};

/// Everything a store adapter needs to run a query and shape its rows.
#[derive(Debug, Clone)]
pub struct TranslatedQuery {
    pub text: String,
    pub parameters: Vec<QueryParameter>,
    pub materializer: ResultMaterializer,
    /// The plan the text was emitted from.
    pub plan: ExprRef,
}

/// Binds a query, runs the dialect's pass pipeline and emits text.
pub struct Translator<'a> {
    mapping: &'a dyn Mapping,
    language: &'a dyn QueryLanguage,
    emitter: &'a dyn SqlEmitter,
}

impl<'a> Translator<'a> {
    pub fn new(mapping: &'a dyn Mapping, language: &'a dyn QueryLanguage) -> Self {
        Translator { mapping, language, emitter: &SqlFormatter }
    }

    pub fn with_emitter(mut self, emitter: &'a dyn SqlEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Bound and rewritten plan, before any text is produced.
    pub fn compile(&self, query: &QueryRef) -> PlanResult<ExprRef> {
        let span = debug_span!("compile", dialect = self.language.name());
        let _guard = span.enter();

        let mut plan = QueryBinder::bind(self.mapping, self.language, query)?;
        trace!(plan = %PlanPrinter::print(&plan), "bound");

        let ctx = PassContext { mapping: self.mapping, language: self.language };
        // Set when something changed since the last cleanup ran.
        let mut dirty = true;
        for &kind in self.language.passes() {
            if kind == PassKind::Cleanup && !dirty {
                debug!(pass = kind.name(), "skipped, nothing changed");
                continue;
            }
            let next = run_pass(kind, ctx, &plan)?;
            let changed = !Arc::ptr_eq(&next, &plan);
            dirty = kind != PassKind::Cleanup && (dirty || changed);
            plan = next;
            if self.language.validate_aliases() {
                validate_aliases(&plan).map_err(|err| err.in_pass(kind.name()))?;
            }
            trace!(pass = kind.name(), plan = %PlanPrinter::print(&plan));
        }

        check_server_side(&plan)?;
        Ok(plan)
    }

    pub fn translate(&self, query: &QueryRef) -> PlanResult<TranslatedQuery> {
        let plan = self.compile(query)?;
        let emitted = self.emitter.emit(self.language, &plan)?;
        let materializer = match &*plan {
            Expr::Projection(p) => self.materializer(p)?,
            _ => ResultMaterializer::default(),
        };
        debug!(parameters = emitted.parameters.len(), nested = materializer.nested.len(), "translated");
        Ok(TranslatedQuery {
            text: emitted.text,
            parameters: emitted.parameters.into_iter().map(QueryParameter::from).collect(),
            materializer,
            plan,
        })
    }

    fn materializer(&self, projection: &ProjectionExpr) -> PlanResult<ResultMaterializer> {
        let mut nested = Vec::new();
        self.collect_nested(&projection.projector, &mut nested)?;
        Ok(ResultMaterializer { projector: Some(projection.projector.clone()), reduction: projection.reduction, nested })
    }

    fn collect_nested(&self, expr: &ExprRef, out: &mut Vec<NestedQuery>) -> PlanResult<()> {
        match &**expr {
            Expr::Projection(p) => out.push(self.nested(expr, p, None)?),
            Expr::ClientJoin(join) => {
                let p = expect_projection(&join.projection)?;
                let keys = ClientJoinKeys { outer: join.outer_key.clone(), inner: join.inner_key.clone() };
                out.push(self.nested(&join.projection, p, Some(keys))?);
            }
            _ => {
                for child in children(expr) {
                    self.collect_nested(child, out)?;
                }
            }
        }
        Ok(())
    }

    fn nested(&self, expr: &ExprRef, p: &ProjectionExpr, join: Option<ClientJoinKeys>) -> PlanResult<NestedQuery> {
        let emitted = self.emitter.emit(self.language, expr)?;
        Ok(NestedQuery {
            text: emitted.text,
            parameters: emitted.parameters.into_iter().map(QueryParameter::from).collect(),
            outer_columns: emitted.outer_columns,
            join,
            materializer: self.materializer(p)?,
        })
    }
}

/// Translates with the process-wide default dialect and SQL formatter.
pub fn translate(mapping: &dyn Mapping, query: &QueryRef) -> PlanResult<TranslatedQuery> {
    Translator::new(mapping, &*DEFAULT_DIALECT).translate(query)
}

/// Projections must not survive where the store evaluates expressions.
pub(crate) fn check_server_side(plan: &ExprRef) -> PlanResult<()> {
    let mut offending = false;
    walk(plan, &mut |e| {
        if let Expr::Select(s) = &**e {
            offending |= s.columns.iter().any(|c| contains_projection(&c.expr))
                || s.filter.as_ref().is_some_and(contains_projection)
                || s.group_by.iter().any(contains_projection)
                || s.order_by.iter().any(|o| contains_projection(&o.expr));
        }
    });
    if offending {
        return Err(PlanError::unsupported(
            "Projection",
            "a nested query is used where the store must evaluate it",
        ));
    }
    Ok(())
}
