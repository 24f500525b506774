//! Serialized descriptor-matrix format.
//!
//! A descriptor set is persisted as a fixed header (magic, version, row
//! and column counts) followed by row-major little-endian f32 data. This
//! is the interchange format between the extraction pipeline and the
//! engine; the engine reads and writes it but never interprets pixels.

use crate::descriptor::{Descriptor, DescriptorSet};
use crate::error::{Result, RetrovaError};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::traits::Storage;

/// Magic number "RVDM" identifying a descriptor-matrix file.
const MATRIX_MAGIC: u32 = 0x5256_444d;
const MATRIX_VERSION: u32 = 1;

/// Write a descriptor set to `name` in the given storage.
pub fn write_matrix(storage: &dyn Storage, name: &str, set: &DescriptorSet) -> Result<()> {
    let output = storage.create_output(name)?;
    let mut writer = StructWriter::new(output);

    writer.write_u32(MATRIX_MAGIC)?;
    writer.write_u32(MATRIX_VERSION)?;
    writer.write_u32(set.len() as u32)?;
    writer.write_u32(set.dimension().unwrap_or(0) as u32)?;

    for descriptor in set {
        writer.write_f32_slice(&descriptor.data)?;
    }

    writer.close()
}

/// Read a descriptor set from `name` in the given storage.
pub fn read_matrix(storage: &dyn Storage, name: &str) -> Result<DescriptorSet> {
    let input = storage.open_input(name)?;
    let mut reader = StructReader::new(input);

    let magic = reader.read_u32()?;
    if magic != MATRIX_MAGIC {
        return Err(RetrovaError::serialization(format!(
            "not a descriptor matrix file: {name}"
        )));
    }
    let version = reader.read_u32()?;
    if version != MATRIX_VERSION {
        return Err(RetrovaError::serialization(format!(
            "unsupported descriptor matrix version: {version}"
        )));
    }

    let rows = reader.read_u32()? as usize;
    let cols = reader.read_u32()? as usize;

    let mut set = DescriptorSet::new();
    for _ in 0..rows {
        let data = reader.read_f32_vec(cols)?;
        set.push(Descriptor::new(data))?;
    }

    Ok(set)
}
