//! Dataset collaborator: the enumerable collection of indexed images.
//!
//! The engine reads a [`Dataset`] only during training. Each image exposes
//! a stable identifier and the descriptor set extracted from it; where the
//! descriptors came from is outside the engine's concern.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::descriptor::DescriptorSet;
use crate::error::{Result, RetrovaError};

/// One image in the dataset: a stable id plus its descriptor set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Stable image identifier, unique within the dataset.
    pub id: u64,
    /// Descriptors extracted from the image.
    pub descriptors: DescriptorSet,
}

impl ImageRecord {
    /// Create a new image record.
    pub fn new(id: u64, descriptors: DescriptorSet) -> Self {
        Self { id, descriptors }
    }
}

/// An enumerable collection of images with stable identifiers.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    images: Vec<ImageRecord>,
    by_id: AHashMap<u64, usize>,
}

impl Dataset {
    /// Create a new empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image to the dataset.
    ///
    /// Fails if the id is already present or the descriptor dimension
    /// disagrees with previously added images.
    pub fn add_image(&mut self, image: ImageRecord) -> Result<()> {
        if self.by_id.contains_key(&image.id) {
            return Err(RetrovaError::invalid_params(format!(
                "duplicate image id: {}",
                image.id
            )));
        }
        if let (Some(expected), Some(actual)) = (self.dimension(), image.descriptors.dimension())
            && expected != actual
        {
            return Err(RetrovaError::invalid_params(format!(
                "image {} has descriptor dimension {actual}, dataset uses {expected}",
                image.id
            )));
        }

        self.by_id.insert(image.id, self.images.len());
        self.images.push(image);
        Ok(())
    }

    /// Number of images in the dataset.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Check if the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// The descriptor dimension shared by all images, or `None` if no
    /// image with descriptors has been added yet.
    pub fn dimension(&self) -> Option<usize> {
        self.images.iter().find_map(|img| img.descriptors.dimension())
    }

    /// Look up an image by id.
    pub fn image(&self, id: u64) -> Option<&ImageRecord> {
        self.by_id.get(&id).map(|&idx| &self.images[idx])
    }

    /// Iterate over the images in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, ImageRecord> {
        self.images.iter()
    }

    /// Access the images as a slice.
    pub fn images(&self) -> &[ImageRecord] {
        &self.images
    }

    /// Total number of descriptors across all images.
    pub fn total_descriptors(&self) -> usize {
        self.images.iter().map(|img| img.descriptors.len()).sum()
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a ImageRecord;
    type IntoIter = std::slice::Iter<'a, ImageRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.images.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorSet;

    fn set(rows: Vec<Vec<f32>>) -> DescriptorSet {
        DescriptorSet::from_rows(rows).unwrap()
    }

    #[test]
    fn test_add_and_lookup() {
        let mut dataset = Dataset::new();
        dataset
            .add_image(ImageRecord::new(7, set(vec![vec![1.0, 0.0]])))
            .unwrap();
        dataset
            .add_image(ImageRecord::new(3, set(vec![vec![0.0, 1.0], vec![1.0, 1.0]])))
            .unwrap();

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.dimension(), Some(2));
        assert_eq!(dataset.total_descriptors(), 3);
        assert_eq!(dataset.image(3).unwrap().descriptors.len(), 2);
        assert!(dataset.image(99).is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut dataset = Dataset::new();
        dataset
            .add_image(ImageRecord::new(1, set(vec![vec![1.0]])))
            .unwrap();
        assert!(
            dataset
                .add_image(ImageRecord::new(1, set(vec![vec![2.0]])))
                .is_err()
        );
        assert_eq!(dataset.len(), 1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut dataset = Dataset::new();
        dataset
            .add_image(ImageRecord::new(1, set(vec![vec![1.0, 2.0]])))
            .unwrap();
        assert!(
            dataset
                .add_image(ImageRecord::new(2, set(vec![vec![1.0, 2.0, 3.0]])))
                .is_err()
        );
    }

    #[test]
    fn test_image_without_descriptors_allowed() {
        let mut dataset = Dataset::new();
        dataset
            .add_image(ImageRecord::new(1, DescriptorSet::new()))
            .unwrap();
        dataset
            .add_image(ImageRecord::new(2, set(vec![vec![1.0, 2.0]])))
            .unwrap();
        assert_eq!(dataset.dimension(), Some(2));
    }
}
