use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dialect::QueryLanguage;
use crate::error::PlanResult;
use crate::expr::ExprRef;
use crate::mapping::Mapping;

pub mod aggregate_rewriter;
pub use aggregate_rewriter::*;
pub mod unused_columns;
pub use unused_columns::*;
pub mod redundant_columns;
pub use redundant_columns::*;
pub mod redundant_subqueries;
pub use redundant_subqueries::*;
pub mod relationship_binder;
pub use relationship_binder::*;
pub mod comparison_rewriter;
pub use comparison_rewriter::*;
pub mod singleton_projection;
pub use singleton_projection::*;
pub mod client_joined_projection;
pub use client_joined_projection::*;
pub mod order_by_rewriter;
pub use order_by_rewriter::*;
pub mod cross_apply_rewriter;
pub use cross_apply_rewriter::*;
pub mod cross_join_rewriter;
pub use cross_join_rewriter::*;
pub mod cross_join_isolator;
pub use cross_join_isolator::*;
pub mod skip_to_row_number;
pub use skip_to_row_number::*;
pub mod skip_to_nested_order_by;
pub use skip_to_nested_order_by::*;
pub mod parameterizer;
pub use parameterizer::*;

/// One step of the rewrite pipeline. Dialect configurations list these in
/// the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    AggregateRewriter,
    /// Unused columns, redundant columns, then redundant subqueries.
    Cleanup,
    RelationshipBinder,
    ComparisonRewriter,
    SingletonProjection,
    ClientJoinedProjection,
    OrderByRewriter,
    CrossApplyRewriter,
    CrossJoinRewriter,
    CrossJoinIsolator,
    SkipToRowNumber,
    SkipToNestedOrderBy,
    Parameterizer,
}

impl PassKind {
    pub fn name(&self) -> &'static str {
        match self {
            PassKind::AggregateRewriter => "aggregate_rewriter",
            PassKind::Cleanup => "cleanup",
            PassKind::RelationshipBinder => "relationship_binder",
            PassKind::ComparisonRewriter => "comparison_rewriter",
            PassKind::SingletonProjection => "singleton_projection",
            PassKind::ClientJoinedProjection => "client_joined_projection",
            PassKind::OrderByRewriter => "order_by_rewriter",
            PassKind::CrossApplyRewriter => "cross_apply_rewriter",
            PassKind::CrossJoinRewriter => "cross_join_rewriter",
            PassKind::CrossJoinIsolator => "cross_join_isolator",
            PassKind::SkipToRowNumber => "skip_to_row_number",
            PassKind::SkipToNestedOrderBy => "skip_to_nested_order_by",
            PassKind::Parameterizer => "parameterizer",
        }
    }
}

/// What a pass may consult besides the plan itself.
#[derive(Clone, Copy)]
pub struct PassContext<'a> {
    pub mapping: &'a dyn Mapping,
    pub language: &'a dyn QueryLanguage,
}

/// Runs the three pruning passes in their fixed order.
pub fn cleanup(plan: &ExprRef) -> PlanResult<ExprRef> {
    let plan = UnusedColumnRemover::rewrite(plan)?;
    let plan = RedundantColumnRemover::rewrite(&plan)?;
    RedundantSubqueryRemover::rewrite(&plan)
}

pub fn run_pass(kind: PassKind, ctx: PassContext<'_>, plan: &ExprRef) -> PlanResult<ExprRef> {
    let result = match kind {
        PassKind::AggregateRewriter => AggregateRewriter::rewrite(ctx.language, plan),
        PassKind::Cleanup => cleanup(plan),
        PassKind::RelationshipBinder => RelationshipBinder::rewrite(ctx, plan),
        PassKind::ComparisonRewriter => ComparisonRewriter::rewrite(ctx.mapping, plan),
        PassKind::SingletonProjection => SingletonProjectionRewriter::rewrite(ctx, plan),
        PassKind::ClientJoinedProjection => ClientJoinedProjectionRewriter::rewrite(ctx, plan),
        PassKind::OrderByRewriter => OrderByRewriter::rewrite(ctx.language, plan),
        PassKind::CrossApplyRewriter => CrossApplyRewriter::rewrite(ctx.language, plan),
        PassKind::CrossJoinRewriter => CrossJoinRewriter::rewrite(plan),
        PassKind::CrossJoinIsolator => CrossJoinIsolator::rewrite(plan),
        PassKind::SkipToRowNumber => SkipToRowNumberRewriter::rewrite(ctx.language, plan),
        PassKind::SkipToNestedOrderBy => SkipToNestedOrderByRewriter::rewrite(ctx.language, plan),
        PassKind::Parameterizer => Parameterizer::rewrite(ctx.language, plan),
    };
    match result {
        Ok(rewritten) => {
            debug!(pass = kind.name(), changed = !std::sync::Arc::ptr_eq(plan, &rewritten), "pass complete");
            Ok(rewritten)
        }
        Err(err) => Err(err.in_pass(kind.name())),
    }
}
