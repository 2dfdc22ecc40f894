use std::collections::HashMap;

use crate::expr::{children, Expr, InSource, TableAlias};

/// Alpha-equivalence of two plan trees: equal up to a consistent renaming of
/// the aliases each tree declares.
pub fn alpha_equivalent(a: &Expr, b: &Expr) -> bool {
    StructuralComparer::default().compare(a, b)
}

#[derive(Default)]
pub struct StructuralComparer {
    aliases: HashMap<TableAlias, TableAlias>,
}

impl StructuralComparer {
    pub fn compare(&mut self, a: &Expr, b: &Expr) -> bool {
        if std::ptr::eq(a, b) {
            return true;
        }
        if !self.shallow_eq(a, b) {
            return false;
        }
        let (ca, cb) = (children(a), children(b));
        ca.len() == cb.len() && ca.iter().zip(cb.iter()).all(|(x, y)| self.compare(x, y))
    }

    /// Treats `a` and `b` as the same alias, as if both had already been
    /// declared at matching positions.
    pub fn assume(&mut self, a: TableAlias, b: TableAlias) {
        self.aliases.insert(a, b);
    }

    fn declare(&mut self, a: TableAlias, b: TableAlias) -> bool {
        match self.aliases.get(&a) {
            Some(mapped) => *mapped == b,
            None => {
                self.aliases.insert(a, b);
                true
            }
        }
    }

    fn same_alias(&self, a: TableAlias, b: TableAlias) -> bool {
        self.aliases.get(&a).copied().unwrap_or(a) == b
    }

    fn shallow_eq(&mut self, a: &Expr, b: &Expr) -> bool {
        match (a, b) {
            (Expr::Constant { value: va, ty: ta }, Expr::Constant { value: vb, ty: tb }) => va == vb && ta == tb,
            (Expr::Parameter { name: na, ty: ta }, Expr::Parameter { name: nb, ty: tb }) => na == nb && ta == tb,
            (Expr::Captured { name: na, value: va, .. }, Expr::Captured { name: nb, value: vb, .. }) => na == nb && va == vb,
            (Expr::Member { member: ma, .. }, Expr::Member { member: mb, .. }) => ma == mb,
            (Expr::Unary { op: oa, .. }, Expr::Unary { op: ob, .. }) => oa == ob,
            (Expr::Binary { op: oa, .. }, Expr::Binary { op: ob, .. }) => oa == ob,
            (Expr::Conditional { .. }, Expr::Conditional { .. }) => true,
            (Expr::Call { function: fa, .. }, Expr::Call { function: fb, .. }) => fa == fb,
            (Expr::New { type_name: ta, members: ma }, Expr::New { type_name: tb, members: mb }) => {
                ta == tb && ma.len() == mb.len() && ma.iter().zip(mb).all(|((x, _), (y, _))| x == y)
            }
            (Expr::Grouping { .. }, Expr::Grouping { .. }) => true,
            (Expr::Query(qa), Expr::Query(qb)) => qa == qb,
            (Expr::Table(ta), Expr::Table(tb)) => ta.name == tb.name && ta.entity == tb.entity && self.declare(ta.alias, tb.alias),
            (Expr::SetOperation(sa), Expr::SetOperation(sb)) => sa.kind == sb.kind && self.declare(sa.alias, sb.alias),
            (Expr::Column(ca), Expr::Column(cb)) => ca.name == cb.name && self.same_alias(ca.alias, cb.alias),
            (Expr::Select(sa), Expr::Select(sb)) => {
                sa.distinct == sb.distinct
                    && sa.reverse == sb.reverse
                    && sa.from.is_some() == sb.from.is_some()
                    && sa.filter.is_some() == sb.filter.is_some()
                    && sa.skip.is_some() == sb.skip.is_some()
                    && sa.take.is_some() == sb.take.is_some()
                    && sa.group_by.len() == sb.group_by.len()
                    && sa.columns.len() == sb.columns.len()
                    && sa.columns.iter().zip(&sb.columns).all(|(x, y)| x.name == y.name)
                    && sa.order_by.len() == sb.order_by.len()
                    && sa.order_by.iter().zip(&sb.order_by).all(|(x, y)| x.direction == y.direction)
                    && self.declare(sa.alias, sb.alias)
            }
            (Expr::Join(ja), Expr::Join(jb)) => ja.kind == jb.kind && ja.condition.is_some() == jb.condition.is_some(),
            (Expr::Aggregate(aa), Expr::Aggregate(ab)) => {
                aa.kind == ab.kind && aa.distinct == ab.distinct && aa.argument.is_some() == ab.argument.is_some()
            }
            (Expr::AggregateSubquery(aa), Expr::AggregateSubquery(ab)) => self.same_alias(aa.group_by_alias, ab.group_by_alias),
            (Expr::Scalar { .. }, Expr::Scalar { .. }) | (Expr::Exists { .. }, Expr::Exists { .. }) => true,
            (Expr::In { source: sa, .. }, Expr::In { source: sb, .. }) => match (sa, sb) {
                (InSource::Select(_), InSource::Select(_)) => true,
                (InSource::Values(va), InSource::Values(vb)) => va.len() == vb.len(),
                _ => false,
            },
            (Expr::IsNull(_), Expr::IsNull(_)) | (Expr::Between { .. }, Expr::Between { .. }) => true,
            (Expr::RowNumber { order_by: oa }, Expr::RowNumber { order_by: ob }) => {
                oa.len() == ob.len() && oa.iter().zip(ob).all(|(x, y)| x.direction == y.direction)
            }
            (Expr::OuterJoined { .. }, Expr::OuterJoined { .. }) => true,
            (Expr::NamedValue(na), Expr::NamedValue(nb)) => na.name == nb.name && na.ty == nb.ty,
            (Expr::Entity { entity: ea, .. }, Expr::Entity { entity: eb, .. }) => ea == eb,
            (Expr::Projection(pa), Expr::Projection(pb)) => pa.reduction == pb.reduction && pa.is_singleton == pb.is_singleton,
            (Expr::ClientJoin(ca), Expr::ClientJoin(cb)) => ca.outer_key.len() == cb.outer_key.len(),
            (Expr::Insert(ia), Expr::Insert(ib)) => ia.assignments.len() == ib.assignments.len(),
            (Expr::Update(ua), Expr::Update(ub)) => {
                ua.assignments.len() == ub.assignments.len() && ua.filter.is_some() == ub.filter.is_some()
            }
            (Expr::Delete(da), Expr::Delete(db)) => da.filter.is_some() == db.filter.is_some(),
            (Expr::Batch(ba), Expr::Batch(bb)) => ba.commands.len() == bb.commands.len(),
            _ => false,
        }
    }
}
