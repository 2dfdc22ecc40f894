pub mod column_projector;
pub use column_projector::*;

pub mod member;
pub use member::*;

pub mod binder;
pub use binder::*;

pub mod commands;
pub use commands::*;
