//! Session retrieval memory.
//!
//! A small, append-only, capacity-bounded store of condensed history
//! fragments. Each fragment is scored against a query with a locally computed
//! hashed embedding (token hashing into signed, length-weighted buckets,
//! L2-normalized) blended with plain lexical overlap:
//!
//! ```text
//! score = 0.75 · cosine(query, entry) + 0.25 · |Q ∩ E| / |Q|
//! ```
//!
//! No external embedding service is involved.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::truncate_chars;

const COSINE_WEIGHT: f64 = 0.75;
const LEXICAL_WEIGHT: f64 = 0.25;

// ── Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Entries kept before the oldest is evicted.
    pub capacity: usize,
    /// Fragments are truncated to this many characters on insert.
    pub max_entry_chars: usize,
    /// Hits returned per query.
    pub query_limit: usize,
    /// Character budget for the formatted recall block.
    pub query_max_chars: usize,
    /// Hits scoring below this are dropped.
    pub min_score: f64,
    /// Embedding dimensionality.
    pub dims: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            capacity: 120,
            max_entry_chars: 600,
            query_limit: 4,
            query_max_chars: 1_200,
            min_score: 0.12,
            dims: 256,
        }
    }
}

// ── Entries ────────────────────────────────────────────────────────

/// Where a fragment came from.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    EvictedTurn,
    RunningSummary,
    VisionSummary,
}

impl std::fmt::Display for EntrySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntrySource::EvictedTurn => write!(f, "evicted_turn"),
            EntrySource::RunningSummary => write!(f, "running_summary"),
            EntrySource::VisionSummary => write!(f, "vision_summary"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RetrievalEntry {
    pub id: u64,
    pub step: Option<u32>,
    pub source: EntrySource,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A scored query hit.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalHit {
    pub id: u64,
    pub step: Option<u32>,
    pub source: EntrySource,
    pub text: String,
    pub score: f64,
}

impl RetrievalHit {
    /// `- [step N · source · 0.53] text`
    pub fn format_line(&self) -> String {
        let step = self
            .step
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        format!(
            "- [step {step} · {} · {:.2}] {}",
            self.source, self.score, self.text
        )
    }
}

// ── Store ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalMemory {
    #[serde(skip)]
    config: RetrievalConfig,
    entries: VecDeque<RetrievalEntry>,
    next_id: u64,
}

impl Default for RetrievalMemory {
    fn default() -> Self {
        Self::new(RetrievalConfig::default())
    }
}

impl RetrievalMemory {
    pub fn new(config: RetrievalConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Reattach a config after deserializing a snapshot.
    pub fn with_config(mut self, config: RetrievalConfig) -> Self {
        self.config = config;
        while self.entries.len() > self.config.capacity {
            self.entries.pop_front();
        }
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RetrievalEntry> {
        self.entries.iter()
    }

    /// Drop every entry and restart ids.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_id = 1;
    }

    /// Index a fragment. Returns the new id, or `None` when the fragment was
    /// empty or a case-insensitive duplicate of an existing entry.
    pub fn index(&mut self, text: &str, step: Option<u32>, source: EntrySource) -> Option<u64> {
        let normalized = normalize_whitespace(text);
        let text = truncate_chars(&normalized, self.config.max_entry_chars).to_string();
        if text.is_empty() {
            return None;
        }
        let lowered = text.to_lowercase();
        if self.entries.iter().any(|e| e.text.to_lowercase() == lowered) {
            trace!("Retrieval: duplicate fragment rejected");
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(RetrievalEntry {
            id,
            step,
            source,
            text,
            created_at: Utc::now(),
        });
        while self.entries.len() > self.config.capacity {
            self.entries.pop_front();
        }
        Some(id)
    }

    /// Top `limit` entries scoring at or above the floor, best first.
    ///
    /// Ties are broken by newer id first so the ranking is total and repeat
    /// queries return identical output.
    pub fn search(&self, query: &str, limit: usize) -> Vec<RetrievalHit> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || limit == 0 {
            return Vec::new();
        }
        let query_vec = embed_tokens(&query_tokens, self.config.dims);
        let query_set: HashSet<&str> = query_tokens.iter().map(String::as_str).collect();

        let mut hits: Vec<RetrievalHit> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let entry_tokens = tokenize(&entry.text);
                let entry_vec = embed_tokens(&entry_tokens, self.config.dims);
                let cosine = dot(&query_vec, &entry_vec);
                let entry_set: HashSet<&str> = entry_tokens.iter().map(String::as_str).collect();
                let overlap =
                    query_set.intersection(&entry_set).count() as f64 / query_set.len() as f64;
                let score = COSINE_WEIGHT * cosine + LEXICAL_WEIGHT * overlap;
                (score >= self.config.min_score).then(|| RetrievalHit {
                    id: entry.id,
                    step: entry.step,
                    source: entry.source,
                    text: entry.text.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.id.cmp(&a.id))
        });
        hits.truncate(limit);
        hits
    }

    /// Search and format the hits as a bounded recall block.
    pub fn query(&self, query: &str, limit: usize, max_chars: usize) -> String {
        format_hits(&self.search(query, limit), max_chars)
    }
}

/// Render hits one per line, stopping before the character budget overflows.
/// A lone first hit longer than the budget is truncated rather than dropped.
pub fn format_hits(hits: &[RetrievalHit], max_chars: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    for hit in hits {
        let line = hit.format_line();
        let len = line.chars().count();
        let sep = usize::from(!out.is_empty());
        if used + sep + len > max_chars {
            if out.is_empty() {
                out.push_str(truncate_chars(&line, max_chars));
            }
            break;
        }
        if sep == 1 {
            out.push('\n');
        }
        out.push_str(&line);
        used += sep + len;
    }
    out
}

// ── Hashed embedding ───────────────────────────────────────────────

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase alphanumeric tokens.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// 64-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Signed, length-weighted, L2-normalized bucket vector.
fn embed_tokens(tokens: &[String], dims: usize) -> Vec<f64> {
    let dims = dims.max(1);
    let mut vec = vec![0.0; dims];
    for token in tokens {
        let hash = fnv1a(token.as_bytes());
        let bucket = (hash % dims as u64) as usize;
        let sign = if hash >> 63 == 1 { -1.0 } else { 1.0 };
        vec[bucket] += sign * (token.chars().count() as f64).sqrt();
    }
    let norm = vec.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
