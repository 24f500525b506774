//! # Retrova
//!
//! A visual-word image retrieval library for Rust.
//!
//! Retrova indexes images represented by local descriptor sets (SIFT-style
//! feature vectors) and answers "which dataset images look like this
//! query" with ranked similarity scores.
//!
//! ## Features
//!
//! - Pure Rust implementation
//! - Three interchangeable search backends behind one contract:
//!   dense bag-of-words, sparse inverted index, hierarchical vocabulary tree
//! - Flat and hierarchical k-means vocabulary training (k-means++ seeding)
//! - TF-IDF weighting with configurable normalization and similarity metric
//! - Rayon-parallel training and batch search
//! - Pluggable storage for persisted indexes and descriptor matrices
//!
//! ## Example
//!
//! ```
//! use retrova::dataset::{Dataset, ImageRecord};
//! use retrova::descriptor::DescriptorSet;
//! use retrova::index::{InvertedIndexSearch, SearchIndex, SearchParams, TrainParams};
//!
//! # fn main() -> retrova::error::Result<()> {
//! let mut dataset = Dataset::new();
//! dataset.add_image(ImageRecord::new(
//!     1,
//!     DescriptorSet::from_rows(vec![vec![0.0, 0.0], vec![8.0, 0.0]])?,
//! ))?;
//! dataset.add_image(ImageRecord::new(
//!     2,
//!     DescriptorSet::from_rows(vec![vec![0.0, 8.0], vec![8.0, 8.0]])?,
//! ))?;
//!
//! let mut index = InvertedIndexSearch::new();
//! index.train(&dataset, &TrainParams::flat(4).with_seed(1))?;
//!
//! let query = DescriptorSet::from_rows(vec![vec![0.1, 0.1]])?;
//! let results = index.search(&query, &SearchParams::top(5))?;
//! assert_eq!(results.top().unwrap().image_id, 1);
//! # Ok(())
//! # }
//! ```

pub mod dataset;
pub mod descriptor;
pub mod document;
pub mod error;
pub mod index;
pub mod storage;
pub mod vocab;

pub mod prelude {
    //! Convenience re-exports for typical usage.
    pub use crate::dataset::{Dataset, ImageRecord};
    pub use crate::descriptor::{Descriptor, DescriptorSet, Normalization, SimilarityMetric};
    pub use crate::error::{Result, RetrovaError};
    pub use crate::index::{
        BagOfWordsIndex, InvertedIndexSearch, Match, MatchResults, SearchIndex, SearchParams,
        TrainParams, VocabTreeIndex, VocabularyParams,
    };
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
