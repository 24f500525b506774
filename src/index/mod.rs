//! Search backends and the shared training/search contract.
//!
//! Three index types implement [`SearchIndex`]: the dense
//! [`BagOfWordsIndex`](bag_of_words::BagOfWordsIndex), the sparse
//! [`InvertedIndexSearch`](inverted::InvertedIndexSearch) and the
//! hierarchical [`VocabTreeIndex`](vocab_tree::VocabTreeIndex). They trade
//! memory, accuracy and scaling differently but honor one contract, so the
//! caller can hold a `Box<dyn SearchIndex>` chosen at runtime.

pub mod bag_of_words;
pub mod inverted;
pub mod posting;
pub mod vocab_tree;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::descriptor::DescriptorSet;
use crate::descriptor::distance::{Normalization, SimilarityMetric};
use crate::error::{Result, RetrovaError};
use crate::vocab::kmeans::KMeansConfig;

pub use bag_of_words::BagOfWordsIndex;
pub use inverted::InvertedIndexSearch;
pub use posting::{Posting, PostingList};
pub use vocab_tree::VocabTreeIndex;

/// Vocabulary shape: flat clustering or a hierarchical tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VocabularyParams {
    /// One flat k-means partition into `vocabulary_size` words.
    Flat {
        /// Number of visual words (`V`).
        vocabulary_size: usize,
    },
    /// Recursive k-means with `branching_factor` children per node down
    /// to `max_depth`.
    Tree {
        /// Children per internal node (`B`).
        branching_factor: usize,
        /// Depth of the leaves; the root sits at depth 0.
        max_depth: usize,
    },
}

/// Immutable training configuration, validated before any clustering
/// work begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainParams {
    /// Vocabulary shape and size.
    pub vocabulary: VocabularyParams,
    /// k-means iteration cap.
    pub max_iterations: usize,
    /// k-means convergence threshold on mean centroid movement.
    pub convergence_threshold: f32,
    /// Tree nodes with fewer samples become leaves regardless of depth.
    pub min_cluster_size: usize,
    /// Fixed clustering seed for reproducible indexes.
    pub seed: Option<u64>,
    /// Run data-parallel phases on the worker pool.
    pub parallel: bool,
}

impl TrainParams {
    /// Params for a flat vocabulary of `vocabulary_size` words.
    pub fn flat(vocabulary_size: usize) -> Self {
        TrainParams {
            vocabulary: VocabularyParams::Flat { vocabulary_size },
            ..Default::default()
        }
    }

    /// Params for a vocabulary tree with the given shape.
    pub fn tree(branching_factor: usize, max_depth: usize) -> Self {
        TrainParams {
            vocabulary: VocabularyParams::Tree {
                branching_factor,
                max_depth,
            },
            ..Default::default()
        }
    }

    /// Set a fixed clustering seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validate ranges; called by every backend before training.
    pub fn validate(&self) -> Result<()> {
        match self.vocabulary {
            VocabularyParams::Flat { vocabulary_size } => {
                if vocabulary_size == 0 {
                    return Err(RetrovaError::invalid_params(
                        "vocabulary_size must be > 0",
                    ));
                }
            }
            VocabularyParams::Tree {
                branching_factor,
                max_depth,
            } => {
                if branching_factor < 2 {
                    return Err(RetrovaError::invalid_params(
                        "branching_factor must be >= 2",
                    ));
                }
                if max_depth == 0 {
                    return Err(RetrovaError::invalid_params("max_depth must be >= 1"));
                }
            }
        }
        if self.max_iterations == 0 {
            return Err(RetrovaError::invalid_params("max_iterations must be > 0"));
        }
        if self.convergence_threshold.is_nan() || self.convergence_threshold < 0.0 {
            return Err(RetrovaError::invalid_params(
                "convergence_threshold must be >= 0",
            ));
        }
        Ok(())
    }

    /// The flat vocabulary size, or an error for tree-shaped params.
    pub(crate) fn expect_flat(&self) -> Result<usize> {
        match self.vocabulary {
            VocabularyParams::Flat { vocabulary_size } => Ok(vocabulary_size),
            VocabularyParams::Tree { .. } => Err(RetrovaError::invalid_params(
                "this backend requires VocabularyParams::Flat",
            )),
        }
    }

    /// The tree shape, or an error for flat params.
    pub(crate) fn expect_tree(&self) -> Result<(usize, usize)> {
        match self.vocabulary {
            VocabularyParams::Tree {
                branching_factor,
                max_depth,
            } => Ok((branching_factor, max_depth)),
            VocabularyParams::Flat { .. } => Err(RetrovaError::invalid_params(
                "this backend requires VocabularyParams::Tree",
            )),
        }
    }

    /// The k-means configuration shared by both clustering strategies.
    pub(crate) fn kmeans_config(&self) -> KMeansConfig {
        KMeansConfig {
            max_iterations: self.max_iterations,
            convergence_threshold: self.convergence_threshold,
            seed: self.seed,
            parallel: self.parallel,
        }
    }
}

impl Default for TrainParams {
    fn default() -> Self {
        TrainParams {
            vocabulary: VocabularyParams::Flat {
                vocabulary_size: 512,
            },
            max_iterations: 100,
            convergence_threshold: 1e-6,
            min_cluster_size: 2,
            seed: None,
            parallel: true,
        }
    }
}

/// Immutable search configuration, validated at call time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    /// Number of results to return (`K`).
    pub result_count: usize,
    /// Similarity metric used for ranking.
    pub metric: SimilarityMetric,
    /// Vector normalization applied before comparison.
    pub normalization: Normalization,
    /// Include images sharing no visual word with the query at score 0.
    pub full_ranking: bool,
}

impl SearchParams {
    /// Params returning the top `result_count` matches.
    pub fn top(result_count: usize) -> Self {
        SearchParams {
            result_count,
            ..Default::default()
        }
    }

    /// Select the similarity metric.
    pub fn with_metric(mut self, metric: SimilarityMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Validate ranges; called by every backend before scoring.
    pub fn validate(&self) -> Result<()> {
        if self.result_count == 0 {
            return Err(RetrovaError::invalid_params("result_count must be > 0"));
        }
        Ok(())
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            result_count: 10,
            metric: SimilarityMetric::default(),
            normalization: Normalization::default(),
            full_ranking: false,
        }
    }
}

/// One ranked match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Match {
    /// Identifier of the matched dataset image.
    pub image_id: u64,
    /// Similarity score (higher is more similar).
    pub score: f32,
}

/// Ranked search results: descending score, ties broken by ascending
/// image id for determinism.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchResults {
    matches: Vec<Match>,
}

impl MatchResults {
    /// An empty result set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rank raw matches and keep the top `result_count`.
    pub(crate) fn ranked(mut matches: Vec<Match>, result_count: usize) -> Self {
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.image_id.cmp(&b.image_id))
        });
        matches.truncate(result_count);
        MatchResults { matches }
    }

    /// The ranked matches.
    pub fn matches(&self) -> &[Match] {
        &self.matches
    }

    /// The best match, if any.
    pub fn top(&self) -> Option<&Match> {
        self.matches.first()
    }

    /// Number of matches.
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    /// Check if there are no matches.
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Iterate over the ranked matches.
    pub fn iter(&self) -> std::slice::Iter<'_, Match> {
        self.matches.iter()
    }
}

impl<'a> IntoIterator for &'a MatchResults {
    type Item = &'a Match;
    type IntoIter = std::slice::Iter<'a, Match>;

    fn into_iter(self) -> Self::IntoIter {
        self.matches.iter()
    }
}

/// The contract every search backend satisfies.
///
/// An index moves from untrained to trained exactly once; a trained index
/// is immutable and safe to search from many threads concurrently.
pub trait SearchIndex: Send + Sync {
    /// Build the vocabulary and index from a dataset.
    ///
    /// Callable exactly once per instance; retraining requires a new
    /// instance. A failed call leaves the index untrained.
    fn train(&mut self, dataset: &Dataset, params: &TrainParams) -> Result<()>;

    /// Rank dataset images by similarity to the query descriptors.
    fn search(&self, query: &DescriptorSet, params: &SearchParams) -> Result<MatchResults>;

    /// Whether `train` has completed on this instance.
    fn is_trained(&self) -> bool;

    /// Search many queries on the worker pool.
    fn search_batch(
        &self,
        queries: &[DescriptorSet],
        params: &SearchParams,
    ) -> Result<Vec<MatchResults>> {
        queries
            .par_iter()
            .map(|query| self.search(query, params))
            .collect()
    }
}

/// Sparse accumulator scoring shared by the inverted index and the
/// vocabulary tree: walk the posting list of every query-nonzero word,
/// fold normalized weights into per-image accumulators, then finalize
/// with the selected metric. Images sharing no scoring word are omitted
/// unless `full_ranking` asks for them at score 0.
pub(crate) fn rank_sparse_candidates(
    postings: &[crate::index::posting::PostingList],
    query_vector: &crate::document::DocumentVector,
    norms: &ahash::AHashMap<u64, crate::document::Norms>,
    params: &SearchParams,
) -> Vec<Match> {
    use crate::document::{ScoreAccumulator, finalize_score};

    let query_norms = query_vector.norms();
    let query_divisor = query_norms.divisor(params.normalization);

    let mut accumulators: ahash::AHashMap<u64, ScoreAccumulator> = ahash::AHashMap::new();
    if query_divisor > 0.0 {
        for &(word, query_weight) in query_vector.entries() {
            let qv = query_weight / query_divisor;
            for posting in &postings[word as usize] {
                if posting.weight <= 0.0 {
                    continue;
                }
                let doc_divisor = norms[&posting.image_id].divisor(params.normalization);
                if doc_divisor <= 0.0 {
                    continue;
                }
                accumulators
                    .entry(posting.image_id)
                    .or_default()
                    .add(qv, posting.weight / doc_divisor);
            }
        }
    }

    let mut matches: Vec<Match> = accumulators
        .iter()
        .map(|(&image_id, &acc)| Match {
            image_id,
            score: finalize_score(
                params.metric,
                acc,
                query_norms,
                norms[&image_id],
                params.normalization,
            ),
        })
        .collect();

    if params.full_ranking {
        for &image_id in norms.keys() {
            if !accumulators.contains_key(&image_id) {
                matches.push(Match {
                    image_id,
                    score: 0.0,
                });
            }
        }
    }

    matches
}

/// Borrow every descriptor in the dataset as a clustering sample.
pub(crate) fn collect_samples(dataset: &Dataset) -> Vec<&[f32]> {
    let mut samples = Vec::with_capacity(dataset.total_descriptors());
    for image in dataset {
        for descriptor in &image.descriptors {
            samples.push(descriptor.data.as_slice());
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_params_validation() {
        assert!(TrainParams::flat(512).validate().is_ok());
        assert!(TrainParams::flat(0).validate().is_err());
    }

    #[test]
    fn test_tree_params_validation() {
        assert!(TrainParams::tree(2, 3).validate().is_ok());
        assert!(TrainParams::tree(1, 3).validate().is_err());
        assert!(TrainParams::tree(2, 0).validate().is_err());

        let mut params = TrainParams::flat(16);
        params.max_iterations = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_search_params_validation() {
        assert!(SearchParams::top(5).validate().is_ok());
        assert!(SearchParams::top(0).validate().is_err());
    }

    #[test]
    fn test_params_shape_mismatch() {
        assert!(TrainParams::flat(8).expect_tree().is_err());
        assert!(TrainParams::tree(2, 2).expect_flat().is_err());
        assert_eq!(TrainParams::flat(8).expect_flat().unwrap(), 8);
        assert_eq!(TrainParams::tree(3, 4).expect_tree().unwrap(), (3, 4));
    }

    #[test]
    fn test_match_results_ordering() {
        let results = MatchResults::ranked(
            vec![
                Match { image_id: 4, score: 0.5 },
                Match { image_id: 2, score: 0.9 },
                Match { image_id: 3, score: 0.5 },
                Match { image_id: 1, score: 0.1 },
            ],
            3,
        );

        let ids: Vec<u64> = results.iter().map(|m| m.image_id).collect();
        // Descending score; the 0.5 tie resolves to ascending id.
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(results.top().unwrap().image_id, 2);
    }

    #[test]
    fn test_params_serde_round_trip() {
        let params = TrainParams::tree(10, 6).with_seed(3);
        let json = serde_json::to_string(&params).unwrap();
        let back: TrainParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.vocabulary, params.vocabulary);
        assert_eq!(back.seed, params.seed);
    }
}
