//! Command implementations

mod build;
mod index;

pub use build::execute as build;
pub use index::execute as index;
