pub mod entity;
pub use entity::*;

pub mod policy;
pub use policy::*;

pub mod mapping;
pub use mapping::*;

pub mod basic;
pub use basic::*;

pub mod mapper;
pub use mapper::*;
