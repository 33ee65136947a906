//! Approximate response cache keyed by query text.
//!
//! Lookups fall back from an exact `(query, context)` match to the first live
//! entry whose query is similar enough. Similar is not identical, so a hit can
//! return an answer to a slightly different question. That trade is accepted
//! for cost. The similarity function is replaceable, e.g. by embedding cosine.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub type SimilarityFn = fn(&str, &str) -> f64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub ttl_seconds: u64,
    pub similarity_threshold: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl_seconds: 3600,
            similarity_threshold: 0.88,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub query: String,
    pub context: String,
    pub response: String,
    pub model: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub response: String,
    pub model: String,
    pub exact: bool,
}

#[derive(Debug)]
pub struct SemanticCache {
    settings: CacheSettings,
    similarity: SimilarityFn,
    // Insertion order; overwrites move an entry to the back.
    entries: Vec<CacheEntry>,
}

impl SemanticCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            similarity: jaccard_similarity,
            entries: Vec::new(),
        }
    }

    pub fn with_similarity(mut self, similarity: SimilarityFn) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, query: &str, context: &str, now: u64) -> Option<CacheHit> {
        let ttl = self.settings.ttl_seconds;
        self.entries
            .retain(|entry| now.saturating_sub(entry.timestamp) < ttl);

        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.query == query && e.context == context)
        {
            return Some(CacheHit {
                response: entry.response.clone(),
                model: entry.model.clone(),
                exact: true,
            });
        }

        let threshold = self.settings.similarity_threshold;
        self.entries
            .iter()
            .find(|e| (self.similarity)(query, &e.query) >= threshold)
            .map(|entry| CacheHit {
                response: entry.response.clone(),
                model: entry.model.clone(),
                exact: false,
            })
    }

    pub fn put(&mut self, query: &str, context: &str, response: &str, model: &str, now: u64) {
        self.entries
            .retain(|e| !(e.query == query && e.context == context));
        self.entries.push(CacheEntry {
            query: query.to_string(),
            context: context.to_string(),
            response: response.to_string(),
            model: model.to_string(),
            timestamp: now,
        });

        while self.entries.len() > self.settings.max_entries {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(idx, e)| (e.timestamp, *idx))
                .map(|(idx, _)| idx);
            match oldest {
                Some(idx) => {
                    self.entries.remove(idx);
                }
                None => break,
            }
        }
    }
}

fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Word-set Jaccard index in `[0, 1]`. Two empty texts are not similar.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let left = word_set(a);
    let right = word_set(b);
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}
