//! Visual vocabulary construction.
//!
//! Two clustering strategies produce vocabularies: flat k-means for the
//! bag-of-words and inverted-index backends, and hierarchical k-means for
//! the vocabulary tree.

pub mod flat;
pub mod kmeans;
pub mod tree;

pub use flat::FlatVocabulary;
pub use kmeans::{KMeansConfig, KMeansResult};
pub use tree::{TreeNode, VocabularyTree};
