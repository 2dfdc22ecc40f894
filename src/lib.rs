pub mod error;
pub use error::{PlanError, PlanResult};

pub mod model;
pub mod expr;
pub mod query;
pub mod mapping;
pub mod dialect;
pub mod binder;
pub mod passes;

pub mod translator;
pub use translator::{translate, TranslatedQuery, Translator};

#[cfg(test)]
pub(crate) mod fixtures;
