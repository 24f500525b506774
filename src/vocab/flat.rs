//! Flat visual vocabulary: one k-means partition of descriptor space.

use tracing::info;

use crate::descriptor::Descriptor;
use crate::error::{Result, RetrovaError};
use crate::storage::structured::{StructReader, StructWriter};
use crate::vocab::kmeans::{self, KMeansConfig};

/// A flat vocabulary of `V` visual words, each represented by a centroid.
///
/// Quantization is an exact linear scan over the centroids.
#[derive(Debug, Clone)]
pub struct FlatVocabulary {
    centroids: Vec<Vec<f32>>,
    dimension: usize,
}

impl FlatVocabulary {
    /// Cluster `samples` into `vocabulary_size` visual words.
    pub fn train(
        samples: &[&[f32]],
        vocabulary_size: usize,
        config: &KMeansConfig,
    ) -> Result<Self> {
        if vocabulary_size == 0 {
            return Err(RetrovaError::invalid_params(
                "vocabulary_size must be > 0",
            ));
        }

        info!(
            vocabulary_size,
            samples = samples.len(),
            "training flat vocabulary"
        );

        let result = kmeans::run(samples, vocabulary_size, config)?;
        let dimension = result.centroids[0].len();

        Ok(FlatVocabulary {
            centroids: result.centroids,
            dimension,
        })
    }

    /// Construct a vocabulary from previously trained centroids.
    pub fn from_centroids(centroids: Vec<Vec<f32>>) -> Result<Self> {
        let dimension = centroids
            .first()
            .map(|c| c.len())
            .ok_or_else(|| RetrovaError::invalid_params("empty vocabulary"))?;
        if centroids.iter().any(|c| c.len() != dimension) {
            return Err(RetrovaError::invalid_params(
                "vocabulary centroids must share one dimension",
            ));
        }
        Ok(FlatVocabulary {
            centroids,
            dimension,
        })
    }

    /// Number of visual words.
    pub fn size(&self) -> usize {
        self.centroids.len()
    }

    /// Descriptor dimension this vocabulary was trained on.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Centroid of a visual word.
    pub fn centroid(&self, word: u32) -> &[f32] {
        &self.centroids[word as usize]
    }

    /// Map a descriptor to its nearest visual word, ties broken by the
    /// lowest index.
    pub fn quantize(&self, descriptor: &Descriptor) -> u32 {
        kmeans::nearest_centroid(&descriptor.data, &self.centroids) as u32
    }

    /// Write the centroid table through a structured writer.
    pub(crate) fn encode<W: crate::storage::traits::StorageOutput>(
        &self,
        writer: &mut StructWriter<W>,
    ) -> Result<()> {
        writer.write_u32(self.centroids.len() as u32)?;
        writer.write_u32(self.dimension as u32)?;
        for centroid in &self.centroids {
            writer.write_f32_slice(centroid)?;
        }
        Ok(())
    }

    /// Read a centroid table written by [`encode`](Self::encode).
    pub(crate) fn decode<R: crate::storage::traits::StorageInput>(
        reader: &mut StructReader<R>,
    ) -> Result<Self> {
        let count = reader.read_u32()? as usize;
        let dimension = reader.read_u32()? as usize;
        let mut centroids = Vec::with_capacity(count);
        for _ in 0..count {
            centroids.push(reader.read_f32_vec(dimension)?);
        }
        Self::from_centroids(centroids)
    }
}
