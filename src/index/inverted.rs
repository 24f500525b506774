//! Sparse inverted-index search backend.
//!
//! Scoring walks only the posting lists of the query's visual words, so
//! search cost is proportional to the postings touched rather than to the
//! dataset or vocabulary size. This is the workhorse backend for flat
//! vocabularies too large to scan densely.

use ahash::AHashMap;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::dataset::Dataset;
use crate::descriptor::DescriptorSet;
use crate::document::{DocumentVector, Norms, accumulate_terms, idf};
use crate::error::{Result, RetrovaError};
use crate::index::posting::PostingList;
use crate::index::{MatchResults, SearchIndex, SearchParams, TrainParams, collect_samples};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::traits::Storage;
use crate::vocab::flat::FlatVocabulary;

/// Magic number "RVII" identifying a persisted inverted index.
const INVERTED_MAGIC: u32 = 0x5256_4949;
const INVERTED_VERSION: u32 = 1;

#[derive(Debug)]
struct TrainedState {
    vocabulary: FlatVocabulary,
    /// One posting list per visual word.
    postings: Vec<PostingList>,
    /// IDF per visual word, frozen at the end of training.
    idf: Vec<f32>,
    /// Norms of each image's raw tf-idf vector.
    norms: AHashMap<u64, Norms>,
    image_count: usize,
}

/// Inverted-index search over a flat visual vocabulary.
#[derive(Debug, Default)]
pub struct InvertedIndexSearch {
    state: Option<TrainedState>,
}

impl InvertedIndexSearch {
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

    /// IDF weight of a visual word.
    pub fn idf(&self, word: u32) -> Result<f32> {
        let state = self.state.as_ref().ok_or(RetrovaError::IndexNotTrained)?;
        state
            .idf
            .get(word as usize)
            .copied()
            .ok_or_else(|| RetrovaError::invalid_params(format!("no such visual word: {word}")))
    }

    /// Posting list of a visual word.
    pub fn postings(&self, word: u32) -> Result<&PostingList> {
        let state = self.state.as_ref().ok_or(RetrovaError::IndexNotTrained)?;
        state.postings.get(word as usize).ok_or_else(|| {
            RetrovaError::invalid_params(format!("no such visual word: {word}"))
        })
    }

    /// Number of indexed images.
    pub fn image_count(&self) -> Result<usize> {
        self.state
            .as_ref()
            .map(|s| s.image_count)
            .ok_or(RetrovaError::IndexNotTrained)
    }

    /// Persist the trained index under `name`.
    pub fn save(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        let state = self.state.as_ref().ok_or(RetrovaError::IndexNotTrained)?;

        let output = storage.create_output(name)?;
        let mut writer = StructWriter::new(output);

        writer.write_u32(INVERTED_MAGIC)?;
        writer.write_u32(INVERTED_VERSION)?;
        state.vocabulary.encode(&mut writer)?;

        for &weight in &state.idf {
            writer.write_f32(weight)?;
        }

        writer.write_varint(state.image_count as u64)?;

        let mut ids: Vec<u64> = state.norms.keys().copied().collect();
        ids.sort_unstable();
        writer.write_varint(ids.len() as u64)?;
        for id in ids {
            let norms = state.norms[&id];
            writer.write_u64(id)?;
            writer.write_f32(norms.l1)?;
            writer.write_f32(norms.l2)?;
        }

        for list in &state.postings {
            list.encode(&mut writer)?;
        }

        writer.close()
    }

    /// Load a trained index persisted by [`save`](Self::save).
    pub fn load(storage: &dyn Storage, name: &str) -> Result<Self> {
        let input = storage.open_input(name)?;
        let mut reader = StructReader::new(input);

        let magic = reader.read_u32()?;
        if magic != INVERTED_MAGIC {
            return Err(RetrovaError::serialization(format!(
                "not an inverted index file: {name}"
            )));
        }
        let version = reader.read_u32()?;
        if version != INVERTED_VERSION {
            return Err(RetrovaError::serialization(format!(
                "unsupported inverted index version: {version}"
            )));
        }

        let vocabulary = FlatVocabulary::decode(&mut reader)?;

        let mut idf = Vec::with_capacity(vocabulary.size());
        for _ in 0..vocabulary.size() {
            idf.push(reader.read_f32()?);
        }

        let image_count = reader.read_varint()? as usize;

        let norm_count = reader.read_varint()? as usize;
        let mut norms = AHashMap::with_capacity(norm_count);
        for _ in 0..norm_count {
            let id = reader.read_u64()?;
            let l1 = reader.read_f32()?;
            let l2 = reader.read_f32()?;
            norms.insert(id, Norms { l1, l2 });
        }

        let mut postings = Vec::with_capacity(vocabulary.size());
        for _ in 0..vocabulary.size() {
            postings.push(PostingList::decode(&mut reader)?);
        }

        Ok(InvertedIndexSearch {
            state: Some(TrainedState {
                vocabulary,
                postings,
                idf,
                norms,
                image_count,
            }),
        })
    }
}

impl SearchIndex for InvertedIndexSearch {
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

        // First pass: quantize every image into raw term frequencies.
        let frequencies: Vec<(u64, AHashMap<u32, u32>)> = if params.parallel {
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

        // Sequential reduction: document frequency per word, then IDF.
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

        // Second pass: tf-idf weights and postings.
        let mut postings = vec![PostingList::new(); vocabulary.size()];
        let mut norms = AHashMap::with_capacity(frequencies.len());
        for (image_id, freqs) in &frequencies {
            let vector =
                DocumentVector::from_term_frequencies(freqs, |w| idf_table[w as usize]);
            norms.insert(*image_id, vector.norms());

            for (&word, &tf) in freqs {
                let weight = tf as f32 * idf_table[word as usize];
                postings[word as usize].add(*image_id, tf, weight);
            }
        }

        info!(
            images = dataset.len(),
            vocabulary_size,
            "inverted index trained"
        );

        self.state = Some(TrainedState {
            vocabulary,
            postings,
            idf: idf_table,
            norms,
            image_count: dataset.len(),
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

        let matches = crate::index::rank_sparse_candidates(
            &state.postings,
            &query_vector,
            &state.norms,
            params,
        );

        debug!(
            candidates = matches.len(),
            query_words = query_vector.entries().len(),
            "inverted index search"
        );

        Ok(MatchResults::ranked(matches, params.result_count))
    }

    fn is_trained(&self) -> bool {
        self.state.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ImageRecord;
    use crate::descriptor::distance::SimilarityMetric;
    use crate::storage::memory::MemoryStorage;

    /// Four well-separated 2-D word centers.
    const WORDS: [[f32; 2]; 4] = [[0.0, 0.0], [10.0, 0.0], [0.0, 10.0], [10.0, 10.0]];

    fn descriptors(words: &[usize]) -> DescriptorSet {
        DescriptorSet::from_rows(words.iter().map(|&w| WORDS[w].to_vec()).collect()).unwrap()
    }

    /// Three images over words {0,1}, {1,2}, {2,3}.
    fn three_image_dataset() -> Dataset {
        let mut dataset = Dataset::new();
        dataset
            .add_image(ImageRecord::new(1, descriptors(&[0, 1])))
            .unwrap();
        dataset
            .add_image(ImageRecord::new(2, descriptors(&[1, 2])))
            .unwrap();
        dataset
            .add_image(ImageRecord::new(3, descriptors(&[2, 3])))
            .unwrap();
        dataset
    }

    fn trained(dataset: &Dataset) -> InvertedIndexSearch {
        let mut index = InvertedIndexSearch::new();
        index
            .train(dataset, &TrainParams::flat(4).with_seed(21))
            .unwrap();
        index
    }

    #[test]
    fn test_search_before_train_fails() {
        let index = InvertedIndexSearch::new();
        match index.search(&descriptors(&[0]), &SearchParams::top(3)) {
            Err(RetrovaError::IndexNotTrained) => {}
            other => panic!("expected IndexNotTrained, got {other:?}"),
        }
    }

    #[test]
    fn test_train_twice_fails_and_keeps_state() {
        let dataset = three_image_dataset();
        let mut index = trained(&dataset);
        assert!(index.train(&dataset, &TrainParams::flat(4)).is_err());
        assert!(index.is_trained());
    }

    #[test]
    fn test_invalid_params_fail_fast() {
        let dataset = three_image_dataset();
        let mut index = InvertedIndexSearch::new();
        assert!(index.train(&dataset, &TrainParams::flat(0)).is_err());
        assert!(!index.is_trained());

        // Tree-shaped params on a flat backend.
        assert!(index.train(&dataset, &TrainParams::tree(2, 2)).is_err());
        assert!(!index.is_trained());
    }

    #[test]
    fn test_empty_query_returns_empty() {
        let dataset = three_image_dataset();
        let index = trained(&dataset);
        let results = index
            .search(&DescriptorSet::new(), &SearchParams::top(3))
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_idf_weighting_scenario() {
        let dataset = three_image_dataset();
        let index = trained(&dataset);

        // Word 1's region is shared by two images, word 0's by one.
        let vocab = index.vocabulary().unwrap();
        let word1 = vocab.quantize(&crate::descriptor::Descriptor::new(WORDS[1].to_vec()));
        let word0 = vocab.quantize(&crate::descriptor::Descriptor::new(WORDS[0].to_vec()));
        assert!((index.idf(word1).unwrap() - (1.5f32).ln()).abs() < 1e-5);
        assert!((index.idf(word0).unwrap() - (3.0f32).ln()).abs() < 1e-5);

        // Querying word 1 must return exactly images 1 and 2; image 3
        // shares nothing and is omitted. Image 2 ranks higher because a
        // larger share of its normalized vector sits on word 1 (image 1
        // spends norm on the rarer word 0).
        let results = index
            .search(&descriptors(&[1]), &SearchParams::top(10))
            .unwrap();
        let ids: Vec<u64> = results.iter().map(|m| m.image_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(results.matches()[0].score > results.matches()[1].score);
    }

    #[test]
    fn test_self_query_ranks_first() {
        let dataset = three_image_dataset();
        let index = trained(&dataset);

        for image in &dataset {
            let results = index
                .search(&image.descriptors, &SearchParams::top(3))
                .unwrap();
            assert_eq!(results.top().unwrap().image_id, image.id);
        }
    }

    #[test]
    fn test_results_sorted_and_idempotent() {
        let dataset = three_image_dataset();
        let index = trained(&dataset);
        let params = SearchParams::top(10);

        let first = index.search(&descriptors(&[1, 2]), &params).unwrap();
        for window in first.matches().windows(2) {
            assert!(window[0].score >= window[1].score);
            if (window[0].score - window[1].score).abs() < f32::EPSILON {
                assert!(window[0].image_id < window[1].image_id);
            }
        }

        let second = index.search(&descriptors(&[1, 2]), &params).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_full_ranking_includes_untouched_images() {
        let dataset = three_image_dataset();
        let index = trained(&dataset);

        let params = SearchParams {
            full_ranking: true,
            ..SearchParams::top(10)
        };
        let results = index.search(&descriptors(&[1]), &params).unwrap();
        assert_eq!(results.len(), 3);
        let last = results.matches().last().unwrap();
        assert_eq!(last.image_id, 3);
        assert_eq!(last.score, 0.0);
    }

    #[test]
    fn test_metric_variants_rank_self_first() {
        let dataset = three_image_dataset();
        let index = trained(&dataset);

        for metric in [
            SimilarityMetric::DotProduct,
            SimilarityMetric::L1,
            SimilarityMetric::L2,
        ] {
            let params = SearchParams::top(3).with_metric(metric);
            let results = index.search(&descriptors(&[0, 1]), &params).unwrap();
            assert_eq!(results.top().unwrap().image_id, 1, "metric {metric:?}");
        }
    }

    #[test]
    fn test_zero_descriptor_image_scores_zero() {
        let mut dataset = three_image_dataset();
        dataset
            .add_image(ImageRecord::new(9, DescriptorSet::new()))
            .unwrap();
        let index = trained(&dataset);

        let params = SearchParams {
            full_ranking: true,
            ..SearchParams::top(10)
        };
        let results = index.search(&descriptors(&[0, 1]), &params).unwrap();
        let empty = results.iter().find(|m| m.image_id == 9).unwrap();
        assert_eq!(empty.score, 0.0);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dataset = three_image_dataset();
        let index = trained(&dataset);
        let storage = MemoryStorage::new();

        index.save(&storage, "index.rvii").unwrap();
        let loaded = InvertedIndexSearch::load(&storage, "index.rvii").unwrap();

        assert!(loaded.is_trained());
        assert_eq!(loaded.image_count().unwrap(), 3);

        let params = SearchParams::top(10);
        let query = descriptors(&[1, 2]);
        assert_eq!(
            loaded.search(&query, &params).unwrap(),
            index.search(&query, &params).unwrap()
        );
    }

    #[test]
    fn test_exactly_vocabulary_size_descriptors() {
        // One image whose four descriptors each become their own word.
        let mut dataset = Dataset::new();
        dataset
            .add_image(ImageRecord::new(1, descriptors(&[0, 1, 2, 3])))
            .unwrap();

        let mut index = InvertedIndexSearch::new();
        index
            .train(&dataset, &TrainParams::flat(4).with_seed(3))
            .unwrap();

        let vocab = index.vocabulary().unwrap();
        let mut words: Vec<u32> = (0..4)
            .map(|w| vocab.quantize(&crate::descriptor::Descriptor::new(WORDS[w].to_vec())))
            .collect();
        words.sort_unstable();
        words.dedup();
        assert_eq!(words.len(), 4);
    }
}
