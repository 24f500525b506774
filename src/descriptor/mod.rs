//! Local descriptor data structures.
//!
//! A [`Descriptor`] is one fixed-dimension feature vector extracted from an
//! image region; a [`DescriptorSet`] is the ordered collection of all
//! descriptors extracted from one image. Extraction itself happens outside
//! this crate; the engine only reads descriptor values.

pub mod distance;
pub mod matrix;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrovaError};

pub use distance::{Normalization, SimilarityMetric};
pub use matrix::{read_matrix, write_matrix};

/// A dense local feature descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// The descriptor components.
    pub data: Vec<f32>,
}

impl Descriptor {
    /// Create a new descriptor from raw components.
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    /// Get the dimensionality of this descriptor.
    pub fn dimension(&self) -> usize {
        self.data.len()
    }

    /// Calculate the L2 norm (magnitude) of this descriptor.
    pub fn norm(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Normalize this descriptor to unit length.
    pub fn normalize(&mut self) {
        let norm = self.norm();
        if norm > 0.0 {
            for value in &mut self.data {
                *value /= norm;
            }
        }
    }

    /// Check if this descriptor contains only finite values.
    pub fn is_valid(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    /// Validate that this descriptor has the expected dimension.
    pub fn validate_dimension(&self, expected: usize) -> Result<()> {
        if self.data.len() != expected {
            return Err(RetrovaError::invalid_params(format!(
                "descriptor dimension mismatch: expected {}, got {}",
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// The ordered set of descriptors extracted from one image.
///
/// All descriptors in a set share one dimension; the invariant is enforced
/// on construction and insertion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptorSet {
    descriptors: Vec<Descriptor>,
}

impl DescriptorSet {
    /// Create a new empty descriptor set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a descriptor set from a list of descriptors.
    pub fn from_descriptors(descriptors: Vec<Descriptor>) -> Result<Self> {
        let mut set = Self::new();
        for descriptor in descriptors {
            set.push(descriptor)?;
        }
        Ok(set)
    }

    /// Create a descriptor set from raw rows of components.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        Self::from_descriptors(rows.into_iter().map(Descriptor::new).collect())
    }

    /// Append a descriptor, enforcing the uniform-dimension invariant.
    pub fn push(&mut self, descriptor: Descriptor) -> Result<()> {
        if !descriptor.is_valid() {
            return Err(RetrovaError::invalid_params(
                "descriptor contains NaN or infinite values",
            ));
        }
        if let Some(first) = self.descriptors.first() {
            descriptor.validate_dimension(first.dimension())?;
        }
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Number of descriptors in the set.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// The shared dimension of all descriptors, or `None` if empty.
    pub fn dimension(&self) -> Option<usize> {
        self.descriptors.first().map(Descriptor::dimension)
    }

    /// Iterate over the descriptors.
    pub fn iter(&self) -> std::slice::Iter<'_, Descriptor> {
        self.descriptors.iter()
    }

    /// Access the descriptors as a slice.
    pub fn as_slice(&self) -> &[Descriptor] {
        &self.descriptors
    }
}

impl<'a> IntoIterator for &'a DescriptorSet {
    type Item = &'a Descriptor;
    type IntoIter = std::slice::Iter<'a, Descriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.iter()
    }
}
