//! Hierarchical visual vocabulary: a tree of k-means centroids.
//!
//! Each level partitions its parent's samples with branching factor `B`,
//! so quantization costs O(depth × B) comparisons instead of a linear
//! scan over every leaf. The descent is greedy with no backtracking; the
//! approximation is the price of scaling to large vocabularies.

use std::collections::VecDeque;

use rayon::prelude::*;
use tracing::info;

use crate::descriptor::Descriptor;
use crate::descriptor::distance::squared_euclidean;
use crate::error::{Result, RetrovaError};
use crate::storage::structured::{StructReader, StructWriter};
use crate::vocab::kmeans::{self, KMeansConfig};

/// One node in the vocabulary tree arena.
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Cluster centroid this node represents.
    pub centroid: Vec<f32>,
    /// Arena ids of the children; empty for leaves.
    pub children: Vec<u32>,
    /// Distance from the root (root is 0).
    pub depth: u32,
}

impl TreeNode {
    /// Whether this node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Intermediate owned tree produced by the recursive build, flattened
/// into the arena afterwards.
struct BuiltNode {
    centroid: Vec<f32>,
    children: Vec<BuiltNode>,
}

/// A hierarchical vocabulary stored as an arena of nodes.
///
/// Node 0 is the root; children hold arena ids, so the structure is a
/// strict ownership tree with no cycles and serializes directly.
#[derive(Debug, Clone)]
pub struct VocabularyTree {
    nodes: Vec<TreeNode>,
    branching_factor: usize,
    max_depth: usize,
    dimension: usize,
}

impl VocabularyTree {
    /// Build a tree by recursive k-means over `samples`.
    ///
    /// A node becomes a leaf when it reaches `max_depth`, or when its
    /// sample count falls below `min_cluster_size` or the branching
    /// factor (degenerate clusters stop branching early rather than
    /// producing empty or duplicate children).
    pub fn train(
        samples: &[&[f32]],
        branching_factor: usize,
        max_depth: usize,
        min_cluster_size: usize,
        config: &KMeansConfig,
    ) -> Result<Self> {
        if branching_factor < 2 {
            return Err(RetrovaError::invalid_params(
                "branching_factor must be >= 2",
            ));
        }
        if max_depth == 0 {
            return Err(RetrovaError::invalid_params("max_depth must be >= 1"));
        }
        if samples.len() < branching_factor {
            return Err(RetrovaError::InsufficientSamples {
                needed: branching_factor,
                available: samples.len(),
            });
        }

        let dimension = samples[0].len();

        info!(
            branching_factor,
            max_depth,
            samples = samples.len(),
            "training vocabulary tree"
        );

        let root_centroid = mean_of(samples, dimension);
        let root = build_node(
            samples,
            root_centroid,
            0,
            branching_factor,
            max_depth,
            min_cluster_size,
            config,
        )?;

        let nodes = flatten(root);
        info!(nodes = nodes.len(), "vocabulary tree built");

        Ok(VocabularyTree {
            nodes,
            branching_factor,
            max_depth,
            dimension,
        })
    }

    /// Total number of nodes in the arena.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaf nodes.
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// Access a node by arena id.
    pub fn node(&self, id: u32) -> &TreeNode {
        &self.nodes[id as usize]
    }

    /// Iterate over the arena ids of all leaves.
    pub fn leaves(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_leaf())
            .map(|(id, _)| id as u32)
    }

    /// The branching factor the tree was built with.
    pub fn branching_factor(&self) -> usize {
        self.branching_factor
    }

    /// The maximum depth the tree was built with.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Descriptor dimension the tree was trained on.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Greedy root-to-leaf descent for a descriptor.
    ///
    /// Returns the arena ids of every node on the path, root first, leaf
    /// last. Each step picks the nearest child centroid by Euclidean
    /// distance, ties to the first child.
    pub fn quantize_path(&self, descriptor: &Descriptor) -> Vec<u32> {
        let mut path = Vec::with_capacity(self.max_depth + 1);
        let mut current = 0u32;
        path.push(current);

        loop {
            let node = &self.nodes[current as usize];
            if node.children.is_empty() {
                return path;
            }

            let mut best = node.children[0];
            let mut best_dist = f32::INFINITY;
            for &child in &node.children {
                let dist =
                    squared_euclidean(&descriptor.data, &self.nodes[child as usize].centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best = child;
                }
            }

            path.push(best);
            current = best;
        }
    }

    /// The leaf a descriptor quantizes to.
    pub fn quantize_leaf(&self, descriptor: &Descriptor) -> u32 {
        self.quantize_path(descriptor).last().copied().unwrap_or(0)
    }

    /// Write the arena through a structured writer.
    pub(crate) fn encode<W: crate::storage::traits::StorageOutput>(
        &self,
        writer: &mut StructWriter<W>,
    ) -> Result<()> {
        writer.write_u32(self.branching_factor as u32)?;
        writer.write_u32(self.max_depth as u32)?;
        writer.write_u32(self.dimension as u32)?;
        writer.write_varint(self.nodes.len() as u64)?;

        for node in &self.nodes {
            writer.write_u32(node.depth)?;
            writer.write_varint(node.children.len() as u64)?;
            for &child in &node.children {
                writer.write_u32(child)?;
            }
            writer.write_f32_slice(&node.centroid)?;
        }

        Ok(())
    }

    /// Read an arena written by [`encode`](Self::encode).
    pub(crate) fn decode<R: crate::storage::traits::StorageInput>(
        reader: &mut StructReader<R>,
    ) -> Result<Self> {
        let branching_factor = reader.read_u32()? as usize;
        let max_depth = reader.read_u32()? as usize;
        let dimension = reader.read_u32()? as usize;
        let node_count = reader.read_varint()? as usize;

        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let depth = reader.read_u32()?;
            let child_count = reader.read_varint()? as usize;
            let mut children = Vec::with_capacity(child_count);
            for _ in 0..child_count {
                children.push(reader.read_u32()?);
            }
            let centroid = reader.read_f32_vec(dimension)?;
            nodes.push(TreeNode {
                centroid,
                children,
                depth,
            });
        }

        if nodes.is_empty() {
            return Err(RetrovaError::serialization("vocabulary tree has no nodes"));
        }

        Ok(VocabularyTree {
            nodes,
            branching_factor,
            max_depth,
            dimension,
        })
    }
}

fn mean_of(samples: &[&[f32]], dimension: usize) -> Vec<f32> {
    let mut mean = vec![0.0f64; dimension];
    for sample in samples {
        for (acc, &value) in mean.iter_mut().zip(sample.iter()) {
            *acc += f64::from(value);
        }
    }
    mean.iter()
        .map(|&s| (s / samples.len() as f64) as f32)
        .collect()
}

/// Recursively cluster one node's samples into children.
///
/// Sibling subtrees are independent once the partition is fixed, so they
/// build on the worker pool in parallel.
fn build_node(
    samples: &[&[f32]],
    centroid: Vec<f32>,
    depth: usize,
    branching_factor: usize,
    max_depth: usize,
    min_cluster_size: usize,
    config: &KMeansConfig,
) -> Result<BuiltNode> {
    if depth >= max_depth
        || samples.len() < min_cluster_size
        || samples.len() < branching_factor
    {
        return Ok(BuiltNode {
            centroid,
            children: Vec::new(),
        });
    }

    let result = kmeans::run(samples, branching_factor, config)?;

    let mut groups: Vec<Vec<&[f32]>> = vec![Vec::new(); branching_factor];
    for (sample, &cluster) in samples.iter().zip(result.assignments.iter()) {
        groups[cluster].push(sample);
    }

    let children = result
        .centroids
        .into_par_iter()
        .zip(groups.into_par_iter())
        .enumerate()
        .filter(|(_, (_, group))| !group.is_empty())
        .map(|(i, (child_centroid, group))| {
            let child_config = KMeansConfig {
                seed: config.seed.map(|s| s.wrapping_mul(31).wrapping_add(i as u64 + 1)),
                ..config.clone()
            };
            build_node(
                &group,
                child_centroid,
                depth + 1,
                branching_factor,
                max_depth,
                min_cluster_size,
                &child_config,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(BuiltNode { centroid, children })
}

/// Flatten the owned tree into an arena with breadth-first ids.
fn flatten(root: BuiltNode) -> Vec<TreeNode> {
    let mut nodes = vec![TreeNode {
        centroid: root.centroid,
        children: Vec::new(),
        depth: 0,
    }];

    let mut queue: VecDeque<(usize, Vec<BuiltNode>)> = VecDeque::new();
    queue.push_back((0, root.children));

    while let Some((parent_id, children)) = queue.pop_front() {
        let parent_depth = nodes[parent_id].depth;
        for child in children {
            let id = nodes.len();
            nodes.push(TreeNode {
                centroid: child.centroid,
                children: Vec::new(),
                depth: parent_depth + 1,
            });
            nodes[parent_id].children.push(id as u32);
            queue.push_back((id, child.children));
        }
    }

    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 100 synthetic 2-D descriptors in four well-separated clusters.
    fn four_cluster_samples() -> Vec<Vec<f32>> {
        let mut rows = Vec::new();
        for i in 0..100 {
            let (cx, cy) = match i % 4 {
                0 => (0.0, 0.0),
                1 => (20.0, 0.0),
                2 => (0.0, 20.0),
                _ => (20.0, 20.0),
            };
            let jitter = (i / 4) as f32 * 0.02;
            rows.push(vec![cx + jitter, cy - jitter]);
        }
        rows
    }

    fn train(rows: &[Vec<f32>], branching: usize, depth: usize) -> VocabularyTree {
        let samples: Vec<&[f32]> = rows.iter().map(|r| r.as_slice()).collect();
        let config = KMeansConfig {
            seed: Some(5),
            ..Default::default()
        };
        VocabularyTree::train(&samples, branching, depth, 1, &config).unwrap()
    }

    #[test]
    fn test_branching_two_depth_two_has_four_leaves() {
        let rows = four_cluster_samples();
        let tree = train(&rows, 2, 2);

        assert_eq!(tree.leaf_count(), 4);
        // Complete binary tree of depth 2: root + 2 + 4.
        assert_eq!(tree.node_count(), 7);
        for leaf in tree.leaves() {
            assert_eq!(tree.node(leaf).depth, 2);
        }
    }

    #[test]
    fn test_quantize_path_runs_root_to_leaf() {
        let rows = four_cluster_samples();
        let tree = train(&rows, 2, 2);

        let path = tree.quantize_path(&Descriptor::new(vec![0.1, 0.1]));
        assert_eq!(path[0], 0);
        assert_eq!(path.len(), 3);
        assert!(tree.node(*path.last().unwrap()).is_leaf());

        // Consecutive path entries are parent and child.
        for pair in path.windows(2) {
            assert!(tree.node(pair[0]).children.contains(&pair[1]));
        }
    }

    #[test]
    fn test_same_cluster_descriptors_share_a_leaf() {
        let rows = four_cluster_samples();
        let tree = train(&rows, 2, 2);

        let a = tree.quantize_leaf(&Descriptor::new(vec![0.05, 0.05]));
        let b = tree.quantize_leaf(&Descriptor::new(vec![0.3, -0.2]));
        let far = tree.quantize_leaf(&Descriptor::new(vec![20.1, 19.8]));

        assert_eq!(a, b);
        assert_ne!(a, far);
    }

    #[test]
    fn test_degenerate_cluster_stops_branching() {
        // Three distinct samples with branching factor 4: the root cannot
        // split and must become a leaf instead of producing empty children.
        let rows = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0]];
        let samples: Vec<&[f32]> = rows.iter().map(|r| r.as_slice()).collect();
        let config = KMeansConfig {
            seed: Some(1),
            ..Default::default()
        };

        match VocabularyTree::train(&samples, 4, 3, 1, &config) {
            Err(RetrovaError::InsufficientSamples { needed, available }) => {
                assert_eq!(needed, 4);
                assert_eq!(available, 3);
            }
            other => panic!("expected InsufficientSamples, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_shape_params() {
        let rows = four_cluster_samples();
        let samples: Vec<&[f32]> = rows.iter().map(|r| r.as_slice()).collect();
        let config = KMeansConfig::default();

        assert!(VocabularyTree::train(&samples, 1, 2, 1, &config).is_err());
        assert!(VocabularyTree::train(&samples, 2, 0, 1, &config).is_err());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        use crate::storage::memory::MemoryStorage;
        use crate::storage::traits::Storage;

        let rows = four_cluster_samples();
        let tree = train(&rows, 2, 2);
        let storage = MemoryStorage::new();

        {
            let output = storage.create_output("tree.bin").unwrap();
            let mut writer = StructWriter::new(output);
            tree.encode(&mut writer).unwrap();
            writer.close().unwrap();
        }

        let input = storage.open_input("tree.bin").unwrap();
        let mut reader = StructReader::new(input);
        let loaded = VocabularyTree::decode(&mut reader).unwrap();

        assert_eq!(loaded.node_count(), tree.node_count());
        assert_eq!(loaded.leaf_count(), tree.leaf_count());
        assert_eq!(loaded.branching_factor(), tree.branching_factor());

        // Quantization agrees between the original and the reloaded tree.
        let probe = Descriptor::new(vec![20.0, 0.3]);
        assert_eq!(loaded.quantize_path(&probe), tree.quantize_path(&probe));
    }
}
