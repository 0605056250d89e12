//! APK archive emission and indexing

pub mod emit;
pub mod index;
pub mod sign;

pub use emit::{emit_package, EmitSpec};
pub use index::{generate_index, write_json_index, IndexEntry, IndexOptions};
