//! Storage abstraction traits and common types.

use std::io::{Read, Seek, Write};

/// A trait for storage backends that can store and retrieve named files.
///
/// This provides a pluggable interface for different storage
/// implementations like the file system or memory.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open a file for reading.
    fn open_input(&self, name: &str) -> crate::error::Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing file.
    fn create_output(&self, name: &str) -> crate::error::Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file.
    fn delete_file(&self, name: &str) -> crate::error::Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> crate::error::Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> crate::error::Result<u64>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> crate::error::Result<u64>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Seek + Send + std::fmt::Debug {
    /// Flush buffered data and make it visible to subsequent readers.
    fn finish(&mut self) -> crate::error::Result<()>;
}

// Trait-object forwarding so `Box<dyn StorageInput>` / `Box<dyn
// StorageOutput>` can be used wherever the traits are expected.
impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> crate::error::Result<u64> {
        self.as_ref().size()
    }
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn finish(&mut self) -> crate::error::Result<()> {
        self.as_mut().finish()
    }
}
