use crate::error::{PlanError, PlanResult};
use crate::expr::{children, Expr};
use crate::mapping::{EntityMapping, QueryPolicy};

/// What the compiler needs to know about how host types map to tables.
pub trait Mapping {
    fn entity(&self, name: &str) -> Option<&EntityMapping>;

    fn policy(&self) -> &QueryPolicy;

    fn entity_or_err(&self, name: &str) -> PlanResult<&EntityMapping> {
        self.entity(name).ok_or_else(|| PlanError::UnknownEntity(name.to_string()))
    }

    fn is_relationship(&self, entity: &str, member: &str) -> bool {
        self.entity(entity).is_some_and(|e| e.relationship(member).is_some())
    }

    /// Whether `expr` only reads host values, so a partial evaluator may fold
    /// it before binding.
    fn can_be_evaluated_locally(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Constant { .. } | Expr::Captured { .. } => true,
            Expr::Member { .. } | Expr::Unary { .. } | Expr::Binary { .. } | Expr::Conditional { .. } | Expr::Call { .. } | Expr::New { .. } => {
                children(expr).into_iter().all(|c| self.can_be_evaluated_locally(c))
            }
            _ => false,
        }
    }
}
