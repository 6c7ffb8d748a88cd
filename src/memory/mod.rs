//! Asynchronous memory subsystem: typed operations and the background
//! writer that delivers them to the memory store.

pub mod ops;
pub mod writer;

pub use ops::{MemoryOpKind, MemoryOperation};
pub use writer::MemoryWriter;
