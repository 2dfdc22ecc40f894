pub mod alias;
pub use alias::*;

pub mod ops;
pub use ops::*;

pub mod reduction;
pub use reduction::*;

pub mod nodes;
pub use nodes::*;

pub mod select;
pub use select::*;

pub mod expr;
pub use expr::*;

pub mod children;
pub use children::*;

pub mod gatherers;
pub use gatherers::*;

pub mod comparer;
pub use comparer::*;

pub mod printer;
pub use printer::*;

pub mod duplicator;
pub use duplicator::*;
