use std::collections::BTreeSet;

use crate::binder::bind_member;
use crate::error::{PlanError, PlanResult};
use crate::expr::{join_conjunction, map_children, BinaryOp, Expr, ExprRef};
use crate::mapping::Mapping;

/// Turns equality between entities or constructed records into
/// member-wise column equality.
pub struct ComparisonRewriter;

impl ComparisonRewriter {
    pub fn rewrite(mapping: &dyn Mapping, plan: &ExprRef) -> PlanResult<ExprRef> {
        let rebuilt = map_children(plan, |c| Self::rewrite(mapping, c))?;
        match &*rebuilt {
            Expr::Binary { op: op @ (BinaryOp::Equal | BinaryOp::NotEqual), left, right, .. } => {
                match Self::compare(mapping, left, right, *op == BinaryOp::NotEqual)? {
                    Some(expanded) => Self::rewrite(mapping, &expanded),
                    None => Ok(rebuilt),
                }
            }
            _ => Ok(rebuilt),
        }
    }

    fn compare(mapping: &dyn Mapping, left: &ExprRef, right: &ExprRef, negate: bool) -> PlanResult<Option<ExprRef>> {
        if left.is_null_constant() || right.is_null_constant() {
            return Ok(None);
        }
        for side in [left, right] {
            if let Expr::Entity { entity, .. } = &**side {
                let keys: Vec<String> = mapping.entity_or_err(entity)?.primary_key().map(|m| m.name.clone()).collect();
                if keys.is_empty() {
                    return Err(PlanError::unsupported(format!("comparison of {entity}"), "entity declares no primary key"));
                }
                return Self::member_wise(mapping, left, right, &keys, negate).map(Some);
            }
        }
        match (defined_members(left), defined_members(right)) {
            (None, None) => Ok(None),
            (Some(l), Some(r)) => {
                let (ls, rs): (BTreeSet<&String>, BTreeSet<&String>) = (l.iter().collect(), r.iter().collect());
                if ls != rs {
                    return Err(PlanError::InvalidComparison { left: l, right: r });
                }
                Self::member_wise(mapping, left, right, &l, negate).map(Some)
            }
            (Some(members), None) | (None, Some(members)) => Self::member_wise(mapping, left, right, &members, negate).map(Some),
        }
    }

    fn member_wise(
        mapping: &dyn Mapping,
        left: &ExprRef,
        right: &ExprRef,
        members: &[String],
        negate: bool,
    ) -> PlanResult<ExprRef> {
        let mut equalities = Vec::with_capacity(members.len());
        for m in members {
            let l = bind_member(mapping, left, m, crate::model::ValueType::Unknown)?;
            let r = bind_member(mapping, right, m, crate::model::ValueType::Unknown)?;
            equalities.push(Expr::eq(l, r));
        }
        let predicate = join_conjunction(equalities).unwrap_or_else(|| Expr::constant(true.into()));
        Ok(if negate { Expr::not(predicate) } else { predicate })
    }
}

fn defined_members(expr: &ExprRef) -> Option<Vec<String>> {
    match &**expr {
        Expr::New { members, .. } => Some(members.iter().map(|(name, _)| name.clone()).collect()),
        _ => None,
    }
}
