pub mod value_type;
pub use value_type::*;

pub mod sql_type;
pub use sql_type::*;

pub mod value;
pub use value::*;
