pub mod query;
pub use query::*;

pub mod builder;
pub use builder::*;
