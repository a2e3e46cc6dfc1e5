use std::collections::BTreeMap;

use crate::{
    embedding::{DEFAULT_DIMENSION, Embedder, normalize},
    error::{Error, Result},
};

const STOP_WORDS: &[&str] = &[
    "the", "is", "at", "which", "on", "a", "an", "as", "are", "was", "were",
    "for", "to", "of", "in", "and", "or", "but", "with", "by", "from", "this",
    "that", "be", "have", "has", "had", "it", "its", "their", "they", "them",
];

/// Offline, deterministic embedder hashing character trigrams and whole words
/// into a fixed number of buckets.
///
/// It captures lexical overlap only, but needs no model download, which makes
/// it the embedder of choice for tests and air-gapped machines.
#[derive(Debug, Clone)]
pub struct TrigramEmbedder {
    dimension: usize,
    name: String,
}

impl Default for TrigramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl TrigramEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            name: format!("trigram-{dimension}"),
        }
    }

    fn bucket(&self, token: &str, seed: u64) -> usize {
        let hash = token
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(seed).wrapping_add(b as u64));
        (hash % self.dimension as u64) as usize
    }
}

impl Embedder for TrigramEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.dimension == 0 {
            return Err(Error::EmbeddingFailure(
                "trigram embedder configured with dimension 0".into(),
            ));
        }

        let lower = text.to_lowercase();
        let mut freq: BTreeMap<&str, u32> = BTreeMap::new();
        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(w))
        {
            *freq.entry(word).or_insert(0) += 1;
        }

        let mut embedding = vec![0.0f32; self.dimension];
        for (word, count) in &freq {
            let chars: Vec<char> = word.chars().collect();
            for window in chars.windows(3) {
                let trigram: String = window.iter().collect();
                embedding[self.bucket(&trigram, 37)] += (*count as f32).sqrt();
            }
            embedding[self.bucket(word, 31)] += *count as f32;
        }

        normalize(&mut embedding);
        Ok(embedding)
    }
}
