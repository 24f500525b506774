//! Hierarchical vocabulary-tree search backend.
//!
//! Every node on a descriptor's root-to-leaf path accumulates term
//! frequency, so a query that misses at the leaves can still agree with
//! an image at a coarser level (soft coarse-to-fine matching). Scoring is
//! the same sparse accumulation as the inverted index, run over per-node
//! inverted files instead of per-word posting lists.

use ahash::AHashMap;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::dataset::Dataset;
use crate::descriptor::DescriptorSet;
use crate::document::{DocumentVector, Norms, idf};
use crate::error::{Result, RetrovaError};
use crate::index::posting::PostingList;
use crate::index::{
    MatchResults, SearchIndex, SearchParams, TrainParams, collect_samples,
    rank_sparse_candidates,
};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::traits::Storage;
use crate::vocab::tree::VocabularyTree;

/// Magic number "RVVT" identifying a persisted vocabulary-tree index.
const TREE_MAGIC: u32 = 0x5256_5654;
const TREE_VERSION: u32 = 1;

#[derive(Debug)]
struct TrainedState {
    tree: VocabularyTree,
    /// One inverted file per arena node, indexed by node id.
    inverted_files: Vec<PostingList>,
    /// IDF per node, frozen at the end of training.
    idf: Vec<f32>,
    /// Norms of each image's raw tf-idf vector over nodes.
    norms: AHashMap<u64, Norms>,
    image_count: usize,
}

/// Vocabulary-tree search with per-node inverted files.
#[derive(Debug, Default)]
pub struct VocabTreeIndex {
    state: Option<TrainedState>,
}

impl VocabTreeIndex {
    /// Create a new untrained index.
    pub fn new() -> Self {
        Self::default()
    }

    /// The trained vocabulary tree.
    pub fn tree(&self) -> Result<&VocabularyTree> {
        self.state
            .as_ref()
            .map(|s| &s.tree)
            .ok_or(RetrovaError::IndexNotTrained)
    }

    /// IDF weight of a tree node.
    pub fn idf(&self, node: u32) -> Result<f32> {
        let state = self.state.as_ref().ok_or(RetrovaError::IndexNotTrained)?;
        state
            .idf
            .get(node as usize)
            .copied()
            .ok_or_else(|| RetrovaError::invalid_params(format!("no such tree node: {node}")))
    }

    /// Inverted file of a tree node.
    pub fn inverted_file(&self, node: u32) -> Result<&PostingList> {
        let state = self.state.as_ref().ok_or(RetrovaError::IndexNotTrained)?;
        state
            .inverted_files
            .get(node as usize)
            .ok_or_else(|| RetrovaError::invalid_params(format!("no such tree node: {node}")))
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

        writer.write_u32(TREE_MAGIC)?;
        writer.write_u32(TREE_VERSION)?;
        state.tree.encode(&mut writer)?;

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

        for file in &state.inverted_files {
            file.encode(&mut writer)?;
        }

        writer.close()
    }

    /// Load a trained index persisted by [`save`](Self::save).
    pub fn load(storage: &dyn Storage, name: &str) -> Result<Self> {
        let input = storage.open_input(name)?;
        let mut reader = StructReader::new(input);

        let magic = reader.read_u32()?;
        if magic != TREE_MAGIC {
            return Err(RetrovaError::serialization(format!(
                "not a vocabulary tree index file: {name}"
            )));
        }
        let version = reader.read_u32()?;
        if version != TREE_VERSION {
            return Err(RetrovaError::serialization(format!(
                "unsupported vocabulary tree index version: {version}"
            )));
        }

        let tree = VocabularyTree::decode(&mut reader)?;

        let mut idf = Vec::with_capacity(tree.node_count());
        for _ in 0..tree.node_count() {
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

        let mut inverted_files = Vec::with_capacity(tree.node_count());
        for _ in 0..tree.node_count() {
            inverted_files.push(PostingList::decode(&mut reader)?);
        }

        Ok(VocabTreeIndex {
            state: Some(TrainedState {
                tree,
                inverted_files,
                idf,
                norms,
                image_count,
            }),
        })
    }

    /// Accumulate per-node term frequencies for one descriptor set: every
    /// node on a descriptor's path counts, not only the leaf.
    fn node_frequencies(tree: &VocabularyTree, descriptors: &DescriptorSet) -> AHashMap<u32, u32> {
        let mut frequencies = AHashMap::new();
        for descriptor in descriptors {
            for node in tree.quantize_path(descriptor) {
                *frequencies.entry(node).or_insert(0u32) += 1;
            }
        }
        frequencies
    }
}

impl SearchIndex for VocabTreeIndex {
    fn train(&mut self, dataset: &Dataset, params: &TrainParams) -> Result<()> {
        params.validate()?;
        let (branching_factor, max_depth) = params.expect_tree()?;
        if self.state.is_some() {
            return Err(RetrovaError::invalid_operation(
                "index is already trained; retraining requires a new instance",
            ));
        }

        let samples = collect_samples(dataset);
        let tree = VocabularyTree::train(
            &samples,
            branching_factor,
            max_depth,
            params.min_cluster_size,
            &params.kmeans_config(),
        )?;
        drop(samples);

        // First pass: push every image's descriptors down the tree and
        // accumulate term frequencies along the paths.
        let frequencies: Vec<(u64, AHashMap<u32, u32>)> = if params.parallel {
            dataset
                .images()
                .par_iter()
                .map(|image| (image.id, Self::node_frequencies(&tree, &image.descriptors)))
                .collect()
        } else {
            dataset
                .images()
                .iter()
                .map(|image| (image.id, Self::node_frequencies(&tree, &image.descriptors)))
                .collect()
        };

        // Sequential reduction: how many images pass through each node.
        let mut node_counts = vec![0usize; tree.node_count()];
        for (_, freqs) in &frequencies {
            for &node in freqs.keys() {
                node_counts[node as usize] += 1;
            }
        }
        let idf_table: Vec<f32> = node_counts
            .iter()
            .map(|&n| idf(dataset.len(), n))
            .collect();

        // Second pass: weights, norms and per-node inverted files.
        let mut inverted_files = vec![PostingList::new(); tree.node_count()];
        let mut norms = AHashMap::with_capacity(frequencies.len());
        for (image_id, freqs) in &frequencies {
            let vector =
                DocumentVector::from_term_frequencies(freqs, |n| idf_table[n as usize]);
            norms.insert(*image_id, vector.norms());

            for (&node, &tf) in freqs {
                let weight = tf as f32 * idf_table[node as usize];
                inverted_files[node as usize].add(*image_id, tf, weight);
            }
        }

        info!(
            images = dataset.len(),
            nodes = tree.node_count(),
            leaves = tree.leaf_count(),
            "vocabulary tree index trained"
        );

        self.state = Some(TrainedState {
            tree,
            inverted_files,
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
            && dim != state.tree.dimension()
        {
            return Err(RetrovaError::invalid_params(format!(
                "query dimension {dim} does not match index dimension {}",
                state.tree.dimension()
            )));
        }

        let freqs = Self::node_frequencies(&state.tree, query);
        let query_vector =
            DocumentVector::from_term_frequencies(&freqs, |n| state.idf[n as usize]);

        let matches = rank_sparse_candidates(
            &state.inverted_files,
            &query_vector,
            &state.norms,
            params,
        );

        debug!(
            candidates = matches.len(),
            query_nodes = query_vector.entries().len(),
            "vocabulary tree search"
        );

        Ok(MatchResults::ranked(matches, params.result_count))
    }

    fn is_trained(&self) -> bool {
        self.state.is_some()
    }
}
