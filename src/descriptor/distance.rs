//! Similarity metrics and vector normalization schemes.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrovaError};

/// Similarity metrics for comparing document vectors.
///
/// The metric is fixed for the lifetime of one search call, so dispatch is
/// a match on this enum rather than a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SimilarityMetric {
    /// Dot product similarity (higher is more similar).
    #[default]
    DotProduct,
    /// Manhattan (L1) distance.
    L1,
    /// Euclidean (L2) distance.
    L2,
}

impl SimilarityMetric {
    /// Calculate the distance between two equal-length vectors.
    ///
    /// For `DotProduct` the negated dot product is returned so that lower
    /// is always closer.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        if a.len() != b.len() {
            return Err(RetrovaError::invalid_params(
                "vector dimensions must match for distance calculation",
            ));
        }

        let result = match self {
            SimilarityMetric::DotProduct => {
                -a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f32>()
            }
            SimilarityMetric::L1 => a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum(),
            SimilarityMetric::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f32>()
                .sqrt(),
        };

        Ok(result)
    }

    /// Calculate similarity between two vectors (higher is more similar).
    ///
    /// Distances are mapped through `exp(-d)` so that every metric ranks
    /// in descending order.
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        let distance = self.distance(a, b)?;
        Ok(self.distance_to_similarity(distance))
    }

    /// Convert a distance value produced by this metric into a similarity.
    pub fn distance_to_similarity(&self, distance: f32) -> f32 {
        match self {
            SimilarityMetric::DotProduct => -distance,
            SimilarityMetric::L1 | SimilarityMetric::L2 => (-distance).exp(),
        }
    }

    /// Get the name of this metric.
    pub fn name(&self) -> &'static str {
        match self {
            SimilarityMetric::DotProduct => "dot_product",
            SimilarityMetric::L1 => "l1",
            SimilarityMetric::L2 => "l2",
        }
    }

    /// Parse a metric from a string.
    pub fn parse_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dot_product" | "dot" => Ok(SimilarityMetric::DotProduct),
            "l1" | "manhattan" => Ok(SimilarityMetric::L1),
            "l2" | "euclidean" => Ok(SimilarityMetric::L2),
            _ => Err(RetrovaError::invalid_params(format!(
                "unknown similarity metric: {s}"
            ))),
        }
    }
}

/// Normalization applied to document vectors before comparison.
///
/// Normalizing makes whole-vector comparisons scale-invariant across
/// images with different descriptor counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Normalization {
    /// No normalization; raw tf-idf weights are compared.
    None,
    /// Divide by the L1 norm of the weighted vector.
    L1,
    /// Divide by the L2 norm of the weighted vector.
    #[default]
    L2,
}

impl Normalization {
    /// Get the name of this normalization scheme.
    pub fn name(&self) -> &'static str {
        match self {
            Normalization::None => "none",
            Normalization::L1 => "l1",
            Normalization::L2 => "l2",
        }
    }
}

/// Squared Euclidean distance between two equal-length slices.
///
/// Used on raw descriptors during clustering and quantization, where the
/// square root is not needed for ranking.
pub(crate) fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_product() {
        let metric = SimilarityMetric::DotProduct;
        let sim = metric.similarity(&[1.0, 2.0], &[3.0, 4.0]).unwrap();
        assert!((sim - 11.0).abs() < 1e-6);
    }

    #[test]
    fn test_l1_and_l2() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];

        assert!((SimilarityMetric::L1.distance(&a, &b).unwrap() - 7.0).abs() < 1e-6);
        assert!((SimilarityMetric::L2.distance(&a, &b).unwrap() - 5.0).abs() < 1e-6);

        // Identical vectors map to the maximal similarity of 1.0.
        assert!((SimilarityMetric::L2.similarity(&b, &b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch() {
        assert!(SimilarityMetric::L2.distance(&[1.0], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_parse_str() {
        assert_eq!(
            SimilarityMetric::parse_str("euclidean").unwrap(),
            SimilarityMetric::L2
        );
        assert_eq!(
            SimilarityMetric::parse_str("dot").unwrap(),
            SimilarityMetric::DotProduct
        );
        assert!(SimilarityMetric::parse_str("cosine-ish").is_err());
    }

    #[test]
    fn test_squared_euclidean() {
        assert_eq!(squared_euclidean(&[1.0, 1.0], &[4.0, 5.0]), 25.0);
    }
}
