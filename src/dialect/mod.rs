pub mod language;
pub use language::*;

pub mod config;
pub use config::*;

pub mod formatter;
pub use formatter::*;
