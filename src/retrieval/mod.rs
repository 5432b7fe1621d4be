//! Lexical retrieval over a task's supporting passage
//!
//! Passages mix prose and markdown tables. Each paragraph and each table
//! becomes one chunk; oversized chunks are split on sentence boundaries.
//! Chunks are ranked with Okapi BM25.

pub mod formulas;

pub use formulas::{FormulaEntry, FormulaStore, InMemoryFormulaStore};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MAX_CHUNK_CHARS: usize = 500;

const K1: f64 = 1.5;
const B: f64 = 0.75;
const EPSILON: f64 = 0.25;

lazy_static! {
    static ref TABLE_RULE: Regex = Regex::new(r"^\|\s*[-:]+").unwrap();
    static ref SENTENCE_END: Regex = Regex::new(r"[.?!]\s+").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: String,
    pub score: f64,
}

/// Top-K chunk ranking for a query over a passage.
pub trait ChunkRetriever: Send + Sync {
    fn top_chunks(&self, query: &str, passage: &str, top_k: usize) -> Vec<ScoredChunk>;
}

#[derive(Debug, Clone)]
pub struct Bm25Retriever {
    max_chunk_chars: usize,
}

impl Bm25Retriever {
    pub fn new() -> Self {
        Self {
            max_chunk_chars: MAX_CHUNK_CHARS,
        }
    }

    pub fn with_max_chunk_chars(max_chunk_chars: usize) -> Self {
        Self { max_chunk_chars }
    }
}

impl Default for Bm25Retriever {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkRetriever for Bm25Retriever {
    fn top_chunks(&self, query: &str, passage: &str, top_k: usize) -> Vec<ScoredChunk> {
        let chunks = chunk_mixed_content(passage, self.max_chunk_chars);
        if chunks.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let index = Bm25Index::new(chunks.iter().map(|c| tokenize(c)).collect());
        let scores = index.scores(&tokenize(query));

        let mut ranked: Vec<ScoredChunk> = chunks
            .into_iter()
            .zip(scores)
            .map(|(chunk, score)| ScoredChunk { chunk, score })
            .collect();
        // Stable: equal scores keep passage order.
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(top_k);
        ranked
    }
}

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase().split_whitespace().map(str::to_string).collect()
}

/// Split a passage into paragraph and table chunks.
pub fn chunk_mixed_content(passage: &str, max_chunk_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut table: Vec<&str> = Vec::new();

    fn flush(lines: &mut Vec<&str>, separator: &str, chunks: &mut Vec<String>) {
        let text = lines.join(separator);
        let text = text.trim();
        if !text.is_empty() {
            chunks.push(text.to_string());
        }
        lines.clear();
    }

    for line in passage.lines() {
        let line = line.trim();

        if line.starts_with('|') {
            if TABLE_RULE.is_match(line) {
                flush(&mut paragraph, " ", &mut chunks);
            }
            table.push(line);
        } else {
            if !table.is_empty() {
                flush(&mut table, "\n", &mut chunks);
            }
            if line.is_empty() {
                flush(&mut paragraph, " ", &mut chunks);
            } else {
                paragraph.push(line);
            }
        }
    }
    flush(&mut paragraph, " ", &mut chunks);
    flush(&mut table, "\n", &mut chunks);

    chunks
        .into_iter()
        .flat_map(|chunk| split_long_chunk(chunk, max_chunk_chars))
        .collect()
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(text) {
        // Keep the punctuation with its sentence.
        sentences.push(&text[start..m.start() + 1]);
        start = m.end();
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

fn split_long_chunk(chunk: String, max_chunk_chars: usize) -> Vec<String> {
    if chunk.chars().count() <= max_chunk_chars {
        return vec![chunk];
    }

    let mut pieces = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut size = 0;

    for sentence in split_sentences(&chunk) {
        let len = sentence.chars().count();
        if size + len > max_chunk_chars && !current.is_empty() {
            pieces.push(current.join(" "));
            current.clear();
            size = 0;
        }
        current.push(sentence);
        size += len + 1;
    }
    if !current.is_empty() {
        pieces.push(current.join(" "));
    }
    pieces
}

/// Okapi BM25 over pre-tokenised documents.
pub(crate) struct Bm25Index {
    doc_freqs: Vec<HashMap<String, usize>>,
    doc_lens: Vec<usize>,
    avgdl: f64,
    idf: HashMap<String, f64>,
}

impl Bm25Index {
    pub(crate) fn new(corpus: Vec<Vec<String>>) -> Self {
        let n = corpus.len();
        let mut doc_freqs = Vec::with_capacity(n);
        let mut doc_lens = Vec::with_capacity(n);
        let mut df: HashMap<String, usize> = HashMap::new();

        for doc in corpus {
            doc_lens.push(doc.len());
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for token in doc {
                *freqs.entry(token).or_insert(0) += 1;
            }
            for token in freqs.keys() {
                *df.entry(token.clone()).or_insert(0) += 1;
            }
            doc_freqs.push(freqs);
        }

        let total_len: usize = doc_lens.iter().sum();
        let avgdl = if n == 0 { 0.0 } else { total_len as f64 / n as f64 };

        let mut idf: HashMap<String, f64> = df
            .into_iter()
            .map(|(token, freq)| {
                let value = (n as f64 - freq as f64 + 0.5).ln() - (freq as f64 + 0.5).ln();
                (token, value)
            })
            .collect();

        if !idf.is_empty() {
            let floor = EPSILON * idf.values().sum::<f64>() / idf.len() as f64;
            for value in idf.values_mut() {
                if *value < 0.0 {
                    *value = floor;
                }
            }
        }

        Self {
            doc_freqs,
            doc_lens,
            avgdl,
            idf,
        }
    }

    pub(crate) fn scores(&self, query: &[String]) -> Vec<f64> {
        self.doc_freqs
            .iter()
            .zip(&self.doc_lens)
            .map(|(freqs, &len)| {
                let norm = if self.avgdl > 0.0 {
                    K1 * (1.0 - B + B * len as f64 / self.avgdl)
                } else {
                    K1
                };
                query
                    .iter()
                    .map(|token| {
                        let f = freqs.get(token).copied().unwrap_or(0) as f64;
                        let idf = self.idf.get(token).copied().unwrap_or(0.0);
                        idf * f * (K1 + 1.0) / (f + norm)
                    })
                    .sum()
            })
            .collect()
    }
}
