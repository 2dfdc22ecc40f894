use serde::{Deserialize, Serialize};

use crate::error::{PlanError, PlanResult};

/// Final coercion applied by the result materializer to the rows a root
/// projection returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reduction {
    First,
    FirstOrDefault,
    Last,
    LastOrDefault,
    Single,
    SingleOrDefault,
}

impl Reduction {
    pub fn is_first(&self) -> bool {
        matches!(self, Reduction::First | Reduction::FirstOrDefault)
    }

    pub fn is_last(&self) -> bool {
        matches!(self, Reduction::Last | Reduction::LastOrDefault)
    }

    pub fn or_default(&self) -> bool {
        matches!(self, Reduction::FirstOrDefault | Reduction::LastOrDefault | Reduction::SingleOrDefault)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Reduction::First => "First",
            Reduction::FirstOrDefault => "FirstOrDefault",
            Reduction::Last => "Last",
            Reduction::LastOrDefault => "LastOrDefault",
            Reduction::Single => "Single",
            Reduction::SingleOrDefault => "SingleOrDefault",
        }
    }

    /// Reduces materialized rows to one value. `Ok(None)` is the default
    /// value of the `OrDefault` forms.
    pub fn reduce<T>(&self, rows: impl IntoIterator<Item = T>) -> PlanResult<Option<T>> {
        let mut rows = rows.into_iter();
        let reduced = match self {
            Reduction::First | Reduction::FirstOrDefault => rows.next(),
            Reduction::Last | Reduction::LastOrDefault => rows.last(),
            Reduction::Single | Reduction::SingleOrDefault => {
                let first = rows.next();
                if first.is_some() && rows.next().is_some() {
                    return Err(PlanError::MoreThanOneElement);
                }
                first
            }
        };
        match reduced {
            None if !self.or_default() => Err(PlanError::EmptySequence),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_takes_head() {
        assert_eq!(Reduction::First.reduce(vec![1, 2, 3]).unwrap(), Some(1));
        assert!(matches!(Reduction::First.reduce(Vec::<i32>::new()), Err(PlanError::EmptySequence)));
        assert_eq!(Reduction::FirstOrDefault.reduce(Vec::<i32>::new()).unwrap(), None);
    }

    #[test]
    fn last_takes_tail() {
        assert_eq!(Reduction::Last.reduce(vec![1, 2, 3]).unwrap(), Some(3));
    }

    #[test]
    fn single_rejects_many() {
        assert!(matches!(Reduction::Single.reduce(vec![1, 2]), Err(PlanError::MoreThanOneElement)));
        assert!(matches!(Reduction::SingleOrDefault.reduce(vec![1, 2]), Err(PlanError::MoreThanOneElement)));
        assert_eq!(Reduction::SingleOrDefault.reduce(Vec::<i32>::new()).unwrap(), None);
        assert_eq!(Reduction::Single.reduce(vec![7]).unwrap(), Some(7));
    }
}
