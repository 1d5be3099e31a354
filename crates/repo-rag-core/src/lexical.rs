//! In-memory BM25 index over chunk text.
//!
//! Scoring follows Okapi BM25 with `k1 = 1.2`, `b = 0.75` and the
//! non-negative idf `ln(1 + (N - df + 0.5) / (df + 0.5))`. Term frequency
//! saturates, long chunks are length-normalized, and rare terms weigh more.
//!
//! Identifiers are split for code search: `parseHttpRequest`,
//! `parse_http_request` and `parse-http-request` all tokenize to
//! `parse`, `http`, `request`.

use std::collections::{HashMap, HashSet};

use crate::models::Chunk;
use crate::store::{ChunkCandidate, SearchFilter};

const K1: f64 = 1.2;
const B: f64 = 0.75;

/// Tokenize text for lexical indexing and queries.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        for part in split_camel_case(word) {
            tokens.push(part.to_lowercase());
        }
    }
    tokens
}

fn split_camel_case(word: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = word.char_indices().collect();
    let mut parts = Vec::new();
    let mut start = 0;
    for i in 1..chars.len() {
        let (pos, cur) = chars[i];
        let prev = chars[i - 1].1;
        let next_is_lower = chars.get(i + 1).map(|(_, c)| c.is_lowercase()).unwrap_or(false);
        let boundary = ((prev.is_lowercase() || prev.is_ascii_digit()) && cur.is_uppercase())
            || (prev.is_uppercase() && cur.is_uppercase() && next_is_lower);
        if boundary {
            parts.push(&word[start..pos]);
            start = pos;
        }
    }
    parts.push(&word[start..]);
    parts
}

struct IndexedDoc {
    repository_id: String,
    language: String,
    length: u32,
    terms: Vec<String>,
}

/// Inverted index with BM25 ranking.
#[derive(Default)]
pub struct Bm25Index {
    docs: HashMap<String, IndexedDoc>,
    postings: HashMap<String, HashMap<String, u32>>,
    total_length: u64,
}

impl Bm25Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Index (or re-index) a chunk.
    pub fn insert(&mut self, chunk: &Chunk) {
        self.remove(&chunk.id);

        let tokens = tokenize(&format!("{} {}", chunk.file_path, chunk.content));
        let mut freqs: HashMap<String, u32> = HashMap::new();
        for t in &tokens {
            *freqs.entry(t.clone()).or_insert(0) += 1;
        }
        for (term, tf) in &freqs {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(chunk.id.clone(), *tf);
        }
        self.total_length += tokens.len() as u64;
        self.docs.insert(
            chunk.id.clone(),
            IndexedDoc {
                repository_id: chunk.repository_id.clone(),
                language: chunk.language.clone(),
                length: tokens.len() as u32,
                terms: freqs.into_keys().collect(),
            },
        );
    }

    pub fn remove(&mut self, chunk_id: &str) {
        let Some(doc) = self.docs.remove(chunk_id) else {
            return;
        };
        self.total_length -= doc.length as u64;
        for term in doc.terms {
            if let Some(p) = self.postings.get_mut(&term) {
                p.remove(chunk_id);
                if p.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
    }

    /// Top-`k` chunks for `query`, best first, ties by chunk id.
    ///
    /// Corpus statistics cover the whole index; `filter` only decides which
    /// chunks may be returned.
    pub fn search(&self, query: &str, k: usize, filter: &SearchFilter) -> Vec<ChunkCandidate> {
        if self.docs.is_empty() || k == 0 {
            return Vec::new();
        }
        let n = self.docs.len() as f64;
        let avgdl = (self.total_length as f64 / n).max(1.0);

        let mut seen = HashSet::new();
        let mut scores: HashMap<&str, f64> = HashMap::new();
        for term in tokenize(query) {
            if !seen.insert(term.clone()) {
                continue;
            }
            let Some(postings) = self.postings.get(&term) else {
                continue;
            };
            let df = postings.len() as f64;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            for (chunk_id, &tf) in postings {
                let Some(doc) = self.docs.get(chunk_id) else {
                    continue;
                };
                if !filter.matches(&doc.repository_id, &doc.language) {
                    continue;
                }
                let tf = tf as f64;
                let norm = K1 * (1.0 - B + B * doc.length as f64 / avgdl);
                *scores.entry(chunk_id.as_str()).or_insert(0.0) += idf * tf * (K1 + 1.0) / (tf + norm);
            }
        }

        let mut ranked: Vec<ChunkCandidate> = scores
            .into_iter()
            .map(|(id, s)| ChunkCandidate::new(id, s))
            .collect();
        ranked.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        ranked.truncate(k);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkInput;

    fn chunk(repo: &str, path: &str, lang: &str, text: &str) -> Chunk {
        Chunk::from_input(
            repo,
            ChunkInput {
                file_path: path.to_string(),
                start_line: 1,
                end_line: 10,
                text: text.to_string(),
                language: lang.to_string(),
                content_hash: None,
            },
        )
    }

    #[test]
    fn tokenize_splits_identifiers() {
        assert_eq!(tokenize("parseHTTPRequest"), vec!["parse", "http", "request"]);
        assert_eq!(tokenize("parse_http_request()"), vec!["parse", "http", "request"]);
        assert_eq!(tokenize("Vec<u8>"), vec!["vec", "u8"]);
        assert!(tokenize("  ;; ").is_empty());
    }

    #[test]
    fn rare_terms_outrank_common_terms() {
        let mut idx = Bm25Index::new();
        let a = chunk("r", "a.rs", "rust", "fn common() { common(); tokenizer }");
        let b = chunk("r", "b.rs", "rust", "fn common() { common(); common(); }");
        let c = chunk("r", "c.rs", "rust", "fn common() {}");
        idx.insert(&a);
        idx.insert(&b);
        idx.insert(&c);
        let hits = idx.search("tokenizer common", 3, &SearchFilter::default());
        assert_eq!(hits[0].chunk_id, a.id);
    }

    #[test]
    fn term_frequency_saturates() {
        let mut idx = Bm25Index::new();
        let once = chunk("r", "a.rs", "rust", "cache");
        let many = chunk("r", "b.rs", "rust", &"cache ".repeat(50));
        idx.insert(&once);
        idx.insert(&many);
        let hits = idx.search("cache", 2, &SearchFilter::default());
        assert_eq!(hits.len(), 2);
        let ratio = hits[0].raw_score / hits[1].raw_score;
        assert!(ratio < 3.0, "tf contribution should saturate, ratio {ratio}");
    }

    #[test]
    fn filter_excludes_before_ranking() {
        let mut idx = Bm25Index::new();
        let a = chunk("r1", "a.rs", "rust", "embedding pipeline");
        let b = chunk("r2", "b.py", "python", "embedding pipeline");
        idx.insert(&a);
        idx.insert(&b);
        let hits = idx.search("embedding", 10, &SearchFilter::repository("r2"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, b.id);

        let lang = SearchFilter {
            repository_id: None,
            language: Some("rust".into()),
        };
        let hits = idx.search("embedding", 10, &lang);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, a.id);
    }

    #[test]
    fn reinsert_replaces_terms() {
        let mut idx = Bm25Index::new();
        let mut a = chunk("r", "a.rs", "rust", "alpha");
        idx.insert(&a);
        a.content = "beta".into();
        idx.insert(&a);
        assert_eq!(idx.len(), 1);
        assert!(idx.search("alpha", 5, &SearchFilter::default()).is_empty());
        assert_eq!(idx.search("beta", 5, &SearchFilter::default()).len(), 1);
        idx.remove(&a.id);
        assert!(idx.is_empty());
        assert!(idx.search("beta", 5, &SearchFilter::default()).is_empty());
    }

    #[test]
    fn ties_break_by_chunk_id() {
        let mut idx = Bm25Index::new();
        let a = chunk("r", "x/a.rs", "rust", "same text");
        let b = chunk("r", "x/b.rs", "rust", "same text");
        idx.insert(&a);
        idx.insert(&b);
        let hits = idx.search("same", 2, &SearchFilter::default());
        assert!((hits[0].raw_score - hits[1].raw_score).abs() < 1e-12);
        assert!(hits[0].chunk_id < hits[1].chunk_id);
    }
}
