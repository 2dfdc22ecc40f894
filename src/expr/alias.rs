use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

static NEXT_ALIAS: AtomicU32 = AtomicU32::new(0);

/// Opaque identity of one select, table or set operation inside a plan.
///
/// Two aliases are equal only when one was copied from the other; every call
/// to [`TableAlias::fresh`] mints a distinct handle. Printing goes through
/// [`crate::expr::PlanPrinter`], which renames aliases in order of appearance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TableAlias(u32);

impl TableAlias {
    pub fn fresh() -> Self {
        TableAlias(NEXT_ALIAS.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for TableAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A{}", self.0)
    }
}
