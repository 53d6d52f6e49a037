use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

/// BM25 parameters.
const K1: f32 = 1.2;
const B: f32 = 0.75;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "must", "shall",
    "can", "to", "of", "in", "for", "on", "with", "at", "by", "from", "as", "into", "through",
    "during", "before", "after", "above", "below", "between", "under", "again", "further",
    "then", "once", "here", "there", "when", "where", "why", "how", "all", "each", "few", "more",
    "most", "other", "some", "such", "no", "nor", "not", "only", "own", "same", "so", "than",
    "too", "very", "just", "also", "now", "about", "it", "its", "this", "that", "these", "those",
    "i", "me", "my", "we", "our", "you", "your", "he", "him", "his", "she", "her", "they", "them",
    "their", "what", "which", "who", "whom", "and", "or", "if", "but", "s", "t", "don", "ll", "re",
    "ve",
];

/// Analyze text into index terms: lowercase, split on non-alphanumerics,
/// drop single characters and stop words, then stem.
///
/// Ingestion, queries, the local embedder, and cache fingerprints all go
/// through this one function so they agree on what a term is.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 1 && !STOP_WORDS.contains(&w.as_str()))
        .map(|w| stem(&w))
        .collect()
}

/// Light suffix-stripping stemmer for English.
///
/// Conflates plurals and the common verb inflections; it is not a full
/// Porter implementation and never shortens a word below three characters.
pub fn stem(word: &str) -> String {
    if !word.is_ascii() || word.len() <= 3 {
        return word.to_string();
    }

    if let Some(base) = word.strip_suffix("ies") {
        if base.len() >= 2 {
            return format!("{base}y");
        }
    }
    if let Some(base) = word.strip_suffix("sses") {
        return format!("{base}ss");
    }
    for suffix in ["ingly", "edly", "ing", "ed"] {
        if let Some(base) = word.strip_suffix(suffix) {
            if base.len() >= 3 && base.bytes().any(is_vowel) {
                return undouble(base);
            }
        }
    }
    if word.ends_with('s')
        && !word.ends_with("ss")
        && !word.ends_with("us")
        && !word.ends_with("is")
    {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

fn is_vowel(b: u8) -> bool {
    matches!(b, b'a' | b'e' | b'i' | b'o' | b'u' | b'y')
}

/// `runn` -> `run`, but `fall` and `miss` keep their double consonant.
fn undouble(base: &str) -> String {
    let bytes = base.as_bytes();
    let n = bytes.len();
    if n >= 2 && bytes[n - 1] == bytes[n - 2] && !is_vowel(bytes[n - 1]) {
        if !matches!(bytes[n - 1], b'l' | b's' | b'z') {
            return base[..n - 1].to_string();
        }
    }
    base.to_string()
}

/// A BM25 inverted index for keyword-based document retrieval.
///
/// Maintains posting lists mapping each term to the documents containing it
/// and their term frequencies, along with the document length statistics
/// needed for the BM25 scoring formula.
#[derive(Debug, Clone, Default)]
pub struct TextIndex {
    /// term -> (doc_id -> term_frequency)
    postings: HashMap<String, HashMap<Uuid, u32>>,
    /// doc_id -> distinct terms, for removal without scanning every posting list
    doc_terms: HashMap<Uuid, Vec<String>>,
    /// doc_id -> document length (term count after analysis)
    doc_lengths: HashMap<Uuid, u32>,
    total_length: u64,
}

impl TextIndex {
    /// Create a new, empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document to the index, replacing any previous version of `id`.
    pub fn index(&mut self, id: Uuid, text: &str) {
        self.remove(id);

        let tokens = tokenize(text);
        let mut term_freq: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *term_freq.entry(token.clone()).or_insert(0) += 1;
        }

        let mut terms = Vec::with_capacity(term_freq.len());
        for (term, freq) in term_freq {
            self.postings.entry(term.clone()).or_default().insert(id, freq);
            terms.push(term);
        }

        self.doc_terms.insert(id, terms);
        self.doc_lengths.insert(id, tokens.len() as u32);
        self.total_length += tokens.len() as u64;
    }

    /// Remove a document. Returns `false` if it was not indexed.
    pub fn remove(&mut self, id: Uuid) -> bool {
        let Some(terms) = self.doc_terms.remove(&id) else {
            return false;
        };
        for term in terms {
            if let Some(list) = self.postings.get_mut(&term) {
                list.remove(&id);
                if list.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        if let Some(len) = self.doc_lengths.remove(&id) {
            self.total_length = self.total_length.saturating_sub(len as u64);
        }
        true
    }

    /// Search the index, returning up to `top_k` results by descending score.
    ///
    /// Uses the standard BM25 scoring formula:
    /// ```text
    /// score = sum over query terms of:
    ///   IDF(t) * (tf * (k1 + 1)) / (tf + k1 * (1 - b + b * dl / avgdl))
    /// ```
    /// where `IDF(t) = ln((N - df + 0.5) / (df + 0.5) + 1.0)`.
    ///
    /// Empty and all-stopword queries return an empty list.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(Uuid, f32)> {
        self.search_filtered(query, top_k, |_| true)
    }

    /// Like [`search`](Self::search) but only scores documents accepted by
    /// `filter`. Equal scores are ordered by id ascending.
    pub fn search_filtered<F>(&self, query: &str, top_k: usize, filter: F) -> Vec<(Uuid, f32)>
    where
        F: Fn(Uuid) -> bool,
    {
        if self.doc_lengths.is_empty() || top_k == 0 {
            return Vec::new();
        }

        // Repeated query terms count once.
        let query_terms: BTreeSet<String> = tokenize(query).into_iter().collect();
        if query_terms.is_empty() {
            return Vec::new();
        }

        let n = self.doc_lengths.len() as f32;
        let avgdl = (self.total_length as f32 / n).max(1.0);
        let mut scores: HashMap<Uuid, f32> = HashMap::new();

        for term in &query_terms {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let df = list.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (&doc_id, &tf) in list {
                if !filter(doc_id) {
                    continue;
                }
                let tf = tf as f32;
                let dl = self.doc_lengths.get(&doc_id).copied().unwrap_or(0) as f32;
                let term_score = idf * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * dl / avgdl));
                *scores.entry(doc_id).or_insert(0.0) += term_score;
            }
        }

        let mut results: Vec<(Uuid, f32)> = scores.into_iter().collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        results.truncate(top_k);
        results
    }

    /// Distinct analyzed terms of an indexed document.
    pub fn terms(&self, id: Uuid) -> Option<&[String]> {
        self.doc_terms.get(&id).map(Vec::as_slice)
    }

    /// Whether `id` is indexed.
    pub fn contains(&self, id: Uuid) -> bool {
        self.doc_terms.contains_key(&id)
    }

    /// Return the number of documents currently in the index.
    pub fn document_count(&self) -> usize {
        self.doc_lengths.len()
    }

    /// Drop every document.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
