//! Dense bag-of-words search backend.
//!
//! Every image is a dense tf-idf histogram over the flat vocabulary and
//! candidates are scored with an O(V) dense comparison. That is only
//! acceptable for small vocabularies; the inverted index exists for
//! everything else. The two backends differ in storage representation
//! only; both train the same flat k-means vocabulary.

use rayon::prelude::*;
use tracing::{debug, info};

use crate::dataset::Dataset;
use crate::descriptor::DescriptorSet;
use crate::descriptor::distance::SimilarityMetric;
use crate::document::{DocumentVector, Norms, accumulate_terms, idf};
use crate::error::{Result, RetrovaError};
use crate::index::{
    Match, MatchResults, SearchIndex, SearchParams, TrainParams, collect_samples,
};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::traits::Storage;
use crate::vocab::flat::FlatVocabulary;

/// Magic number "RVBW" identifying a persisted bag-of-words index.
const BOW_MAGIC: u32 = 0x5256_4257;
const BOW_VERSION: u32 = 1;

/// One image's dense raw tf-idf histogram.
#[derive(Debug, Clone)]
struct DenseDocument {
    image_id: u64,
    /// Raw tf × idf weight per visual word, length V.
    weights: Vec<f32>,
    norms: Norms,
}

#[derive(Debug)]
struct TrainedState {
    vocabulary: FlatVocabulary,
    idf: Vec<f32>,
    documents: Vec<DenseDocument>,
}

/// Bag-of-words search over dense histograms.
#[derive(Debug, Default)]
pub struct BagOfWordsIndex {
    state: Option<TrainedState>,
}

impl BagOfWordsIndex {
    /// Create a new untrained index.
    pub fn new() -> Self {
        Self::default()
    }

    /// The trained vocabulary.
    pub fn vocabulary(&self) -> Result<&FlatVocabulary> {
        self.state
            .as_ref()
            .map(|s| &s.vocabulary)
            .ok_or(RetrovaError::IndexNotTrained)
    }

    /// Number of visual words in the trained vocabulary.
    pub fn num_clusters(&self) -> Result<usize> {
        self.vocabulary().map(FlatVocabulary::size)
    }

    /// Number of indexed images.
    pub fn image_count(&self) -> Result<usize> {
        self.state
            .as_ref()
            .map(|s| s.documents.len())
            .ok_or(RetrovaError::IndexNotTrained)
    }

    /// Persist the trained index under `name`.
    pub fn save(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        let state = self.state.as_ref().ok_or(RetrovaError::IndexNotTrained)?;

        let output = storage.create_output(name)?;
        let mut writer = StructWriter::new(output);

        writer.write_u32(BOW_MAGIC)?;
        writer.write_u32(BOW_VERSION)?;
        state.vocabulary.encode(&mut writer)?;

        for &weight in &state.idf {
            writer.write_f32(weight)?;
        }

        writer.write_varint(state.documents.len() as u64)?;
        for document in &state.documents {
            writer.write_u64(document.image_id)?;
            writer.write_f32(document.norms.l1)?;
            writer.write_f32(document.norms.l2)?;
            writer.write_f32_slice(&document.weights)?;
        }

        writer.close()
    }

    /// Load a trained index persisted by [`save`](Self::save).
    pub fn load(storage: &dyn Storage, name: &str) -> Result<Self> {
        let input = storage.open_input(name)?;
        let mut reader = StructReader::new(input);

        let magic = reader.read_u32()?;
        if magic != BOW_MAGIC {
            return Err(RetrovaError::serialization(format!(
                "not a bag-of-words index file: {name}"
            )));
        }
        let version = reader.read_u32()?;
        if version != BOW_VERSION {
            return Err(RetrovaError::serialization(format!(
                "unsupported bag-of-words index version: {version}"
            )));
        }

        let vocabulary = FlatVocabulary::decode(&mut reader)?;

        let mut idf = Vec::with_capacity(vocabulary.size());
        for _ in 0..vocabulary.size() {
            idf.push(reader.read_f32()?);
        }

        let document_count = reader.read_varint()? as usize;
        let mut documents = Vec::with_capacity(document_count);
        for _ in 0..document_count {
            let image_id = reader.read_u64()?;
            let l1 = reader.read_f32()?;
            let l2 = reader.read_f32()?;
            let weights = reader.read_f32_vec(vocabulary.size())?;
            documents.push(DenseDocument {
                image_id,
                weights,
                norms: Norms { l1, l2 },
            });
        }

        Ok(BagOfWordsIndex {
            state: Some(TrainedState {
                vocabulary,
                idf,
                documents,
            }),
        })
    }
}

/// Dense metric kernel: compares the normalized query against one raw
/// document row scaled by its divisor, without materializing the scaled
/// row.
fn dense_score(
    metric: SimilarityMetric,
    query: &[f32],
    doc: &[f32],
    doc_divisor: f32,
) -> f32 {
    match metric {
        SimilarityMetric::DotProduct => query
            .iter()
            .zip(doc.iter())
            .map(|(q, d)| q * (d / doc_divisor))
            .sum(),
        SimilarityMetric::L1 => {
            let dist: f32 = query
                .iter()
                .zip(doc.iter())
                .map(|(q, d)| (q - d / doc_divisor).abs())
                .sum();
            metric.distance_to_similarity(dist)
        }
        SimilarityMetric::L2 => {
            let dist_sq: f32 = query
                .iter()
                .zip(doc.iter())
                .map(|(q, d)| {
                    let diff = q - d / doc_divisor;
                    diff * diff
                })
                .sum();
            metric.distance_to_similarity(dist_sq.sqrt())
        }
    }
}

impl SearchIndex for BagOfWordsIndex {
    fn train(&mut self, dataset: &Dataset, params: &TrainParams) -> Result<()> {
        params.validate()?;
        let vocabulary_size = params.expect_flat()?;
        if self.state.is_some() {
            return Err(RetrovaError::invalid_operation(
                "index is already trained; retraining requires a new instance",
            ));
        }

        let samples = collect_samples(dataset);
        let vocabulary =
            FlatVocabulary::train(&samples, vocabulary_size, &params.kmeans_config())?;
        drop(samples);

        // First pass: term frequencies per image.
        let frequencies: Vec<(u64, ahash::AHashMap<u32, u32>)> = if params.parallel {
            dataset
                .images()
                .par_iter()
                .map(|image| {
                    let freqs = accumulate_terms(
                        image.descriptors.iter().map(|d| vocabulary.quantize(d)),
                    );
                    (image.id, freqs)
                })
                .collect()
        } else {
            dataset
                .images()
                .iter()
                .map(|image| {
                    let freqs = accumulate_terms(
                        image.descriptors.iter().map(|d| vocabulary.quantize(d)),
                    );
                    (image.id, freqs)
                })
                .collect()
        };

        // Sequential reduction: IDF table.
        let mut doc_frequency = vec![0usize; vocabulary.size()];
        for (_, freqs) in &frequencies {
            for &word in freqs.keys() {
                doc_frequency[word as usize] += 1;
            }
        }
        let idf_table: Vec<f32> = doc_frequency
            .iter()
            .map(|&nw| idf(dataset.len(), nw))
            .collect();

        // Second pass: dense histogram table.
        let documents: Vec<DenseDocument> = frequencies
            .iter()
            .map(|(image_id, freqs)| {
                let vector =
                    DocumentVector::from_term_frequencies(freqs, |w| idf_table[w as usize]);
                let mut weights = vec![0.0f32; vocabulary.size()];
                for &(word, weight) in vector.entries() {
                    weights[word as usize] = weight;
                }
                DenseDocument {
                    image_id: *image_id,
                    weights,
                    norms: vector.norms(),
                }
            })
            .collect();

        info!(
            images = dataset.len(),
            vocabulary_size,
            "bag-of-words index trained"
        );

        self.state = Some(TrainedState {
            vocabulary,
            idf: idf_table,
            documents,
        });
        Ok(())
    }

    fn search(&self, query: &DescriptorSet, params: &SearchParams) -> Result<MatchResults> {
        params.validate()?;
        let state = self.state.as_ref().ok_or(RetrovaError::IndexNotTrained)?;

        if query.is_empty() {
            return Ok(MatchResults::empty());
        }
        if let Some(dim) = query.dimension()
            && dim != state.vocabulary.dimension()
        {
            return Err(RetrovaError::invalid_params(format!(
                "query dimension {dim} does not match index dimension {}",
                state.vocabulary.dimension()
            )));
        }

        let freqs =
            accumulate_terms(query.iter().map(|d| state.vocabulary.quantize(d)));
        let query_vector =
            DocumentVector::from_term_frequencies(&freqs, |w| state.idf[w as usize]);
        let query_dense = query_vector.to_dense(state.vocabulary.size(), params.normalization);

        let mut matches = Vec::new();
        let mut candidates = 0usize;
        for document in &state.documents {
            let shares_word = query_vector
                .entries()
                .iter()
                .any(|&(word, _)| document.weights[word as usize] > 0.0);
            let doc_divisor = document.norms.divisor(params.normalization);

            if shares_word && doc_divisor > 0.0 {
                candidates += 1;
                matches.push(Match {
                    image_id: document.image_id,
                    score: dense_score(
                        params.metric,
                        &query_dense,
                        &document.weights,
                        doc_divisor,
                    ),
                });
            } else if params.full_ranking {
                matches.push(Match {
                    image_id: document.image_id,
                    score: 0.0,
                });
            }
        }

        debug!(candidates, images = state.documents.len(), "bag-of-words search");

        Ok(MatchResults::ranked(matches, params.result_count))
    }

    fn is_trained(&self) -> bool {
        self.state.is_some()
    }
}
