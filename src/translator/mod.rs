pub mod translator;
pub use translator::*;

pub mod materializer;
pub use materializer::*;

#[cfg(test)]
mod _tests;
