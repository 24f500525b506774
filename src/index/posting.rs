//! Posting lists: per visual word, the images containing it.
//!
//! Lists are append-only while an index trains and immutable afterwards;
//! search only reads them. Entries stay ordered by ascending image id so
//! merges and serialization are deterministic.

use crate::error::Result;
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::traits::{StorageInput, StorageOutput};

/// A single posting: one image's term statistics for one visual word.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Posting {
    /// Image identifier.
    pub image_id: u64,
    /// Raw term frequency of the word in the image.
    pub frequency: u32,
    /// tf × idf weight, finalized in the second training pass.
    pub weight: f32,
}

/// The postings of one visual word, ordered by ascending image id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostingList {
    postings: Vec<Posting>,
}

impl PostingList {
    /// Create a new empty posting list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a posting, keeping the list ordered by image id. Adding the
    /// same image again accumulates its frequency.
    pub fn add(&mut self, image_id: u64, frequency: u32, weight: f32) {
        match self
            .postings
            .binary_search_by_key(&image_id, |p| p.image_id)
        {
            Ok(pos) => {
                let existing = &mut self.postings[pos];
                existing.frequency += frequency;
                existing.weight += weight;
            }
            Err(pos) => {
                self.postings.insert(
                    pos,
                    Posting {
                        image_id,
                        frequency,
                        weight,
                    },
                );
            }
        }
    }

    /// Number of images in this list (the word's document frequency).
    pub fn len(&self) -> usize {
        self.postings.len()
    }

    /// Check if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    /// Iterate over the postings in image-id order.
    pub fn iter(&self) -> std::slice::Iter<'_, Posting> {
        self.postings.iter()
    }

    /// Access the postings as a slice.
    pub fn postings(&self) -> &[Posting] {
        &self.postings
    }

    /// Look up the posting for one image.
    pub fn get(&self, image_id: u64) -> Option<&Posting> {
        self.postings
            .binary_search_by_key(&image_id, |p| p.image_id)
            .ok()
            .map(|pos| &self.postings[pos])
    }

    /// Encode the list with delta-compressed image ids.
    pub(crate) fn encode<W: StorageOutput>(&self, writer: &mut StructWriter<W>) -> Result<()> {
        writer.write_varint(self.postings.len() as u64)?;

        let mut prev_id = 0u64;
        for posting in &self.postings {
            writer.write_varint(posting.image_id - prev_id)?;
            prev_id = posting.image_id;
            writer.write_varint(u64::from(posting.frequency))?;
            writer.write_f32(posting.weight)?;
        }

        Ok(())
    }

    /// Decode a list written by [`encode`](Self::encode).
    pub(crate) fn decode<R: StorageInput>(reader: &mut StructReader<R>) -> Result<Self> {
        let count = reader.read_varint()? as usize;

        let mut postings = Vec::with_capacity(count);
        let mut prev_id = 0u64;
        for _ in 0..count {
            let image_id = prev_id + reader.read_varint()?;
            prev_id = image_id;
            let frequency = reader.read_varint()? as u32;
            let weight = reader.read_f32()?;
            postings.push(Posting {
                image_id,
                frequency,
                weight,
            });
        }

        Ok(PostingList { postings })
    }
}

impl<'a> IntoIterator for &'a PostingList {
    type Item = &'a Posting;
    type IntoIter = std::slice::Iter<'a, Posting>;

    fn into_iter(self) -> Self::IntoIter {
        self.postings.iter()
    }
}
