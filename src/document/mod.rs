//! Per-image document model: term frequencies, TF-IDF weighting and
//! normalization.
//!
//! A document vector holds the raw tf×idf weight per visual word together
//! with the L1/L2 norms of the weighted vector. Normalization is applied
//! at scoring time by dividing through the stored norm, so one trained
//! index serves any `Normalization` choice in the search params.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::descriptor::distance::{Normalization, SimilarityMetric};

/// L1 and L2 norms of a weighted document vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Norms {
    /// Sum of absolute weights.
    pub l1: f32,
    /// Euclidean magnitude.
    pub l2: f32,
}

impl Norms {
    /// Compute norms over a weight slice.
    pub fn of(weights: impl Iterator<Item = f32>) -> Self {
        let mut l1 = 0.0f32;
        let mut sq = 0.0f32;
        for w in weights {
            l1 += w.abs();
            sq += w * w;
        }
        Norms { l1, l2: sq.sqrt() }
    }

    /// The divisor a vector is scaled by under `normalization`.
    ///
    /// Zero norms (empty documents) return 0; callers treat a zero
    /// divisor as "score 0" rather than dividing.
    pub fn divisor(&self, normalization: Normalization) -> f32 {
        match normalization {
            Normalization::None => 1.0,
            Normalization::L1 => self.l1,
            Normalization::L2 => self.l2,
        }
    }

    /// L1 norm of the vector after applying `normalization`.
    pub fn l1_under(&self, normalization: Normalization) -> f32 {
        let d = self.divisor(normalization);
        if d == 0.0 { 0.0 } else { self.l1 / d }
    }

    /// Squared L2 norm of the vector after applying `normalization`.
    pub fn l2_squared_under(&self, normalization: Normalization) -> f32 {
        let d = self.divisor(normalization);
        if d == 0.0 {
            0.0
        } else {
            let scaled = self.l2 / d;
            scaled * scaled
        }
    }
}

/// A sparse TF-IDF document vector: raw weights per visual word, sorted
/// by word id, plus the norms of the weight vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentVector {
    entries: Vec<(u32, f32)>,
    norms: Norms,
}

impl DocumentVector {
    /// Build a document vector from raw term frequencies and an IDF
    /// lookup. Words whose IDF is zero are excluded from scoring.
    pub fn from_term_frequencies<F>(frequencies: &AHashMap<u32, u32>, idf: F) -> Self
    where
        F: Fn(u32) -> f32,
    {
        let mut entries: Vec<(u32, f32)> = frequencies
            .iter()
            .filter_map(|(&word, &tf)| {
                let weight = tf as f32 * idf(word);
                (weight > 0.0).then_some((word, weight))
            })
            .collect();
        entries.sort_unstable_by_key(|&(word, _)| word);

        let norms = Norms::of(entries.iter().map(|&(_, w)| w));
        DocumentVector { entries, norms }
    }

    /// The nonzero entries, sorted by ascending word id.
    pub fn entries(&self) -> &[(u32, f32)] {
        &self.entries
    }

    /// Norms of the raw weighted vector.
    pub fn norms(&self) -> Norms {
        self.norms
    }

    /// Whether the vector has no nonzero entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Materialize the dense form of length `size`, scaled by the
    /// divisor for `normalization`.
    pub fn to_dense(&self, size: usize, normalization: Normalization) -> Vec<f32> {
        let mut dense = vec![0.0f32; size];
        let divisor = self.norms.divisor(normalization);
        if divisor == 0.0 {
            return dense;
        }
        for &(word, weight) in &self.entries {
            if (word as usize) < size {
                dense[word as usize] = weight / divisor;
            }
        }
        dense
    }
}

/// Accumulate raw term frequencies from a stream of visual words.
pub fn accumulate_terms(words: impl Iterator<Item = u32>) -> AHashMap<u32, u32> {
    let mut frequencies = AHashMap::new();
    for word in words {
        *frequencies.entry(word).or_insert(0u32) += 1;
    }
    frequencies
}

/// Inverse document frequency of a word: ln(N / Nw).
///
/// Words no indexed image contains (Nw = 0) get weight 0 and thereby
/// drop out of scoring.
pub fn idf(total_images: usize, images_with_word: usize) -> f32 {
    if images_with_word == 0 || total_images == 0 {
        0.0
    } else {
        (total_images as f32 / images_with_word as f32).ln()
    }
}

/// Per-candidate accumulator for sparse scoring.
///
/// Both sums are over the words shared between query and document, with
/// both sides already normalized: the dot product and the histogram
/// intersection are enough to reconstruct every supported metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreAccumulator {
    /// Σ q·d over shared words.
    pub dot: f32,
    /// Σ min(q, d) over shared words.
    pub min_sum: f32,
}

impl ScoreAccumulator {
    /// Fold one shared word's normalized weights into the accumulator.
    pub fn add(&mut self, query_weight: f32, doc_weight: f32) {
        self.dot += query_weight * doc_weight;
        self.min_sum += query_weight.min(doc_weight);
    }
}

/// Turn an accumulator into the final similarity for `metric`.
///
/// `query` and `doc` are the norms of the *raw* weighted vectors; the
/// normalized L1/L2 magnitudes needed by the distance reconstructions
/// are derived from them.
pub fn finalize_score(
    metric: SimilarityMetric,
    accumulator: ScoreAccumulator,
    query: Norms,
    doc: Norms,
    normalization: Normalization,
) -> f32 {
    match metric {
        SimilarityMetric::DotProduct => accumulator.dot,
        SimilarityMetric::L1 => {
            let dist = query.l1_under(normalization) + doc.l1_under(normalization)
                - 2.0 * accumulator.min_sum;
            metric.distance_to_similarity(dist.max(0.0))
        }
        SimilarityMetric::L2 => {
            let dist_sq = query.l2_squared_under(normalization)
                + doc.l2_squared_under(normalization)
                - 2.0 * accumulator.dot;
            metric.distance_to_similarity(dist_sq.max(0.0).sqrt())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn freqs(pairs: &[(u32, u32)]) -> AHashMap<u32, u32> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_accumulate_terms() {
        let frequencies = accumulate_terms([2u32, 0, 2, 2, 5].into_iter());
        assert_eq!(frequencies.get(&2), Some(&3));
        assert_eq!(frequencies.get(&0), Some(&1));
        assert_eq!(frequencies.get(&5), Some(&1));
        assert_eq!(frequencies.get(&1), None);
    }

    #[test]
    fn test_idf() {
        assert!((idf(3, 2) - (1.5f32).ln()).abs() < 1e-6);
        assert!((idf(3, 1) - (3.0f32).ln()).abs() < 1e-6);
        // A word every image contains carries no information.
        assert_eq!(idf(3, 3), 0.0);
        assert_eq!(idf(3, 0), 0.0);
    }

    #[test]
    fn test_document_vector_sorted_and_weighted() {
        let vector = DocumentVector::from_term_frequencies(&freqs(&[(5, 2), (1, 3)]), |word| {
            if word == 5 { 2.0 } else { 1.0 }
        });

        assert_eq!(vector.entries(), &[(1, 3.0), (5, 4.0)]);
        assert!((vector.norms().l1 - 7.0).abs() < 1e-6);
        assert!((vector.norms().l2 - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_idf_words_excluded() {
        let vector =
            DocumentVector::from_term_frequencies(&freqs(&[(0, 4), (1, 1)]), |word| {
                if word == 0 { 0.0 } else { 1.0 }
            });
        assert_eq!(vector.entries(), &[(1, 1.0)]);
    }

    #[test]
    fn test_empty_document_has_zero_norms() {
        let vector = DocumentVector::from_term_frequencies(&AHashMap::new(), |_| 1.0);
        assert!(vector.is_empty());
        assert_eq!(vector.norms().divisor(Normalization::L2), 0.0);
        assert_eq!(vector.to_dense(4, Normalization::L2), vec![0.0; 4]);
    }

    #[test]
    fn test_to_dense_normalizes() {
        let vector =
            DocumentVector::from_term_frequencies(&freqs(&[(0, 3), (1, 4)]), |_| 1.0);
        let dense = vector.to_dense(2, Normalization::L2);
        assert!((dense[0] - 0.6).abs() < 1e-6);
        assert!((dense[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_finalize_score_matches_dense_arithmetic() {
        // q = (0.6, 0.8), d = (1.0, 0.0) after L2 normalization.
        let q = Norms { l1: 1.4, l2: 1.0 };
        let d = Norms { l1: 1.0, l2: 1.0 };
        let mut acc = ScoreAccumulator::default();
        acc.add(0.6, 1.0);

        let dot = finalize_score(
            SimilarityMetric::DotProduct,
            acc,
            q,
            d,
            Normalization::None,
        );
        assert!((dot - 0.6).abs() < 1e-6);

        let l2 = finalize_score(SimilarityMetric::L2, acc, q, d, Normalization::None);
        // ||q - d||₂ = sqrt(0.4² + 0.8²)
        let expected = (-((0.4f32 * 0.4 + 0.8 * 0.8).sqrt())).exp();
        assert!((l2 - expected).abs() < 1e-6);

        let l1 = finalize_score(SimilarityMetric::L1, acc, q, d, Normalization::None);
        // |0.6 - 1.0| + |0.8 - 0.0| = 1.2 = 1.4 + 1.0 - 2·0.6
        assert!((l1 - (-1.2f32).exp()).abs() < 1e-6);
    }
}
