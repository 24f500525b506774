//! Storage abstraction for persisted index artifacts.
//!
//! Trained indexes and descriptor matrices are written through the
//! [`Storage`] trait so that the same code path serves on-disk files and
//! in-memory storage (used heavily in tests).

pub mod file;
pub mod memory;
pub mod structured;
pub mod traits;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use structured::{StructReader, StructWriter};
pub use traits::{Storage, StorageInput, StorageOutput};
