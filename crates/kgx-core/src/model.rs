//! Shared language-model service
//!
//! One recognition/parsing model is shared by every component that needs
//! it. The model lives behind the [`LanguageModel`] trait (`tokenize`,
//! `infer`, `parse`), is initialised once at process start, and is injected
//! rather than re-instantiated.
//!
//! [`LexiconModel`] is the bundled implementation: regex patterns plus a
//! term dictionary drive recognition, and attention/hidden state tensors
//! are synthesized deterministically so downstream scoring and clustering
//! behave reproducibly.

use std::collections::{BTreeMap, HashSet};

use ndarray::Array2;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{KgxError, Result};

// ============================================================================
// Model I/O Types
// ============================================================================

/// A sub-word piece produced by the model tokenizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Piece text (without any continuation marker)
    pub piece: String,

    /// Index of the word this piece belongs to
    pub word_index: usize,

    /// Byte offset of the piece in the native text
    pub start: usize,

    /// Whether this piece continues the previous one
    pub continuation: bool,
}

/// Label assigned to one token by the recognition model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLabel {
    /// Entity-type label; `"O"` marks tokens outside any entity
    pub label: String,

    /// Model confidence for the label
    pub score: f32,
}

impl TokenLabel {
    /// The outside (non-entity) label
    pub fn outside() -> Self {
        Self {
            label: "O".to_string(),
            score: 0.0,
        }
    }

    /// Whether this token is part of an entity
    pub fn is_entity(&self) -> bool {
        self.label != "O"
    }
}

/// Output of one recognition pass over a token window
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    /// One label per input token
    pub labels: Vec<TokenLabel>,

    /// Final self-attention layer, row-normalized, shape (n, n)
    pub attention: Array2<f32>,

    /// Hidden states, shape (n, hidden_dim)
    pub hidden: Array2<f32>,
}

/// Coarse part-of-speech tags from the dependency parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PosTag {
    Noun,
    Verb,
    Adjective,
    Determiner,
    Preposition,
    Punctuation,
    Other,
}

impl PosTag {
    /// Filler tokens are excluded from inter-entity distances
    pub fn is_filler(&self) -> bool {
        matches!(
            self,
            Self::Determiner | Self::Preposition | Self::Punctuation
        )
    }
}

/// A word-level token from the dependency parse
#[derive(Debug, Clone)]
pub struct ParsedToken {
    pub text: String,
    pub start: usize,
    pub pos: PosTag,
}

/// A noun phrase detected by the parser
#[derive(Debug, Clone, PartialEq)]
pub struct NounChunk {
    /// Phrase text
    pub text: String,

    /// Byte offset of the phrase
    pub start: usize,

    /// Byte offset one past the phrase
    pub end: usize,

    /// Phrase length in word tokens
    pub token_len: usize,
}

impl NounChunk {
    /// Whether a byte offset falls inside this chunk
    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.start && offset < self.end
    }
}

/// Output of one dependency parse over a sentence
#[derive(Debug, Clone)]
pub struct ParseOutput {
    /// Word-level tokens with part-of-speech tags
    pub tokens: Vec<ParsedToken>,

    /// Noun phrases, in sentence order
    pub noun_chunks: Vec<NounChunk>,
}

// ============================================================================
// The Service Trait
// ============================================================================

/// The process-wide recognition/parsing model.
///
/// Implementations must be cheap to share (`Arc`) and safe to call from
/// the blocking worker pool; all three operations are CPU-bound.
pub trait LanguageModel: Send + Sync {
    /// Split text into sub-word pieces
    fn tokenize(&self, text: &str) -> Vec<Token>;

    /// Run recognition over a token window
    fn infer(&self, text: &str, tokens: &[Token]) -> Result<InferenceOutput>;

    /// Run a dependency parse over a sentence
    fn parse(&self, text: &str) -> Result<ParseOutput>;

    /// Hidden-state dimensionality
    fn hidden_dim(&self) -> usize;

    /// Whether the model is loaded and usable
    fn is_ready(&self) -> bool;
}

// ============================================================================
// Lexicon-backed Model
// ============================================================================

/// Dictionary entry for term matching
#[derive(Debug, Clone)]
struct DictionaryEntry {
    term: String,
    label: String,
    aliases: Vec<String>,
}

/// A matched entity span in raw text
#[derive(Debug, Clone)]
struct SpanMatch {
    start: usize,
    end: usize,
    label: String,
    score: f32,
}

/// Default hidden-state dimensionality
pub const DEFAULT_HIDDEN_DIM: usize = 32;

/// Maximum piece length before a word is split into sub-word fragments
const MAX_PIECE_LEN: usize = 4;

/// Deterministic lexicon-backed recognition model.
///
/// Regex patterns and a dictionary of known terms drive labeling, in the
/// same construction style as a rule-based NER: `add_pattern` registers a
/// (regex, label, confidence) rule and `add_term` registers a canonical
/// term with aliases.
pub struct LexiconModel {
    patterns: Vec<(Regex, String, f32)>,
    dictionary: BTreeMap<String, DictionaryEntry>,
    hidden_dim: usize,
}

impl LexiconModel {
    /// Create a model with the default general-domain rules
    pub fn new() -> Self {
        let mut model = Self::empty();
        model.init_default_patterns();
        model.init_default_dictionary();
        model
    }

    /// Create a model with no rules; terms are added by the caller
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            dictionary: BTreeMap::new(),
            hidden_dim: DEFAULT_HIDDEN_DIM,
        }
    }

    fn init_default_patterns(&mut self) {
        // Organization suffixes
        self.add_pattern(
            r"[A-Z][A-Za-z]*(?:\s+[A-Z][A-Za-z]*)*\s+(?:Corp|Corporation|Inc|Ltd|LLC|GmbH|Co)\b",
            "Organization",
            0.9,
        );

        // Dates
        self.add_pattern(r"\d{4}[-/]\d{1,2}[-/]\d{1,2}", "Date", 0.95);
        self.add_pattern(r"\d{1,2}[-/]\d{1,2}[-/]\d{4}", "Date", 0.95);

        // Monetary amounts
        self.add_pattern(r"\$\d[\d,]*(?:\.\d+)?(?:\s*(?:million|billion))?", "Money", 0.9);

        // Percentages
        self.add_pattern(r"\d+(?:\.\d+)?\s*%", "Percent", 0.9);
    }

    fn init_default_dictionary(&mut self) {
        self.add_term("Paris", "Location", vec![]);
        self.add_term("London", "Location", vec![]);
        self.add_term("Berlin", "Location", vec![]);
        self.add_term("Tokyo", "Location", vec![]);
        self.add_term("New York", "Location", vec!["NYC"]);
    }

    /// Add a regex pattern rule
    pub fn add_pattern(&mut self, pattern: &str, label: &str, confidence: f32) {
        if let Ok(regex) = Regex::new(pattern) {
            self.patterns.push((regex, label.to_string(), confidence));
        }
    }

    /// Add a dictionary term with aliases
    pub fn add_term(&mut self, term: &str, label: &str, aliases: Vec<&str>) {
        let entry = DictionaryEntry {
            term: term.to_string(),
            label: label.to_string(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
        };

        self.dictionary.insert(term.to_string(), entry);
    }

    /// Find entity spans in raw text via patterns and dictionary
    fn find_spans(&self, text: &str) -> Vec<SpanMatch> {
        let mut spans = Vec::new();

        for (regex, label, confidence) in &self.patterns {
            for mat in regex.find_iter(text) {
                spans.push(SpanMatch {
                    start: mat.start(),
                    end: mat.end(),
                    label: label.clone(),
                    score: *confidence,
                });
            }
        }

        let text_lower = text.to_lowercase();
        for entry in self.dictionary.values() {
            let mut needles: Vec<(&str, f32)> = vec![(entry.term.as_str(), 0.95)];
            for alias in &entry.aliases {
                needles.push((alias.as_str(), 0.9));
            }

            for (needle, score) in needles {
                let needle_lower = needle.to_lowercase();
                for (start, _) in text_lower.match_indices(&needle_lower) {
                    if !is_word_bounded(text, start, start + needle.len()) {
                        continue;
                    }
                    spans.push(SpanMatch {
                        start,
                        end: start + needle.len(),
                        label: entry.label.clone(),
                        score,
                    });
                }
            }
        }

        dedup_spans(spans)
    }

    fn token_weight(&self, label: &TokenLabel, piece: &str) -> f32 {
        let base = if label.is_entity() {
            1.0
        } else if piece.chars().all(|c| !c.is_alphanumeric()) || is_stopword(piece) {
            0.15
        } else {
            0.4
        };

        // Hash-derived jitter keeps repeated runs identical while
        // separating otherwise equal tokens
        let jitter = 0.75 + (fnv1a(piece.as_bytes()) % 1000) as f32 / 2000.0;
        base * jitter
    }
}

impl Default for LexiconModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageModel for LexiconModel {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();

        for (word_index, (start, word)) in split_words(text).into_iter().enumerate() {
            if word.len() <= MAX_PIECE_LEN || !word.chars().all(|c| c.is_alphanumeric()) {
                tokens.push(Token {
                    piece: word.to_string(),
                    word_index,
                    start,
                    continuation: false,
                });
                continue;
            }

            // Fragment long words into fixed-width pieces
            let mut offset = 0;
            let chars: Vec<char> = word.chars().collect();
            let mut first = true;
            for chunk in chars.chunks(MAX_PIECE_LEN) {
                let piece: String = chunk.iter().collect();
                let piece_len = piece.len();
                tokens.push(Token {
                    piece,
                    word_index,
                    start: start + offset,
                    continuation: !first,
                });
                offset += piece_len;
                first = false;
            }
        }

        tokens
    }

    fn infer(&self, text: &str, tokens: &[Token]) -> Result<InferenceOutput> {
        if tokens.is_empty() {
            return Err(KgxError::Model("empty token window".to_string()));
        }

        let spans = self.find_spans(text);

        let labels: Vec<TokenLabel> = tokens
            .iter()
            .map(|token| {
                spans
                    .iter()
                    .find(|span| token.start >= span.start && token.start < span.end)
                    .map(|span| TokenLabel {
                        label: span.label.clone(),
                        score: span.score,
                    })
                    .unwrap_or_else(TokenLabel::outside)
            })
            .collect();

        let n = tokens.len();
        let mut attention = Array2::<f32>::zeros((n, n));
        for i in 0..n {
            let mut row_sum = 0.0;
            for j in 0..n {
                let distance = i.abs_diff(j) as f32;
                let weight = self.token_weight(&labels[j], &tokens[j].piece)
                    / (1.0 + distance).sqrt();
                attention[[i, j]] = weight;
                row_sum += weight;
            }
            if row_sum > 0.0 {
                for j in 0..n {
                    attention[[i, j]] /= row_sum;
                }
            }
        }

        let mut hidden = Array2::<f32>::zeros((n, self.hidden_dim));
        for (i, token) in tokens.iter().enumerate() {
            let row = piece_vector(&token.piece, self.hidden_dim);
            for (j, value) in row.into_iter().enumerate() {
                hidden[[i, j]] = value;
            }
        }

        Ok(InferenceOutput {
            labels,
            attention,
            hidden,
        })
    }

    fn parse(&self, text: &str) -> Result<ParseOutput> {
        let words = split_words(text);
        let spans = self.find_spans(text);

        let tokens: Vec<ParsedToken> = words
            .iter()
            .map(|(start, word)| {
                let inside_entity = spans
                    .iter()
                    .any(|span| *start >= span.start && *start < span.end);
                ParsedToken {
                    text: word.to_string(),
                    start: *start,
                    pos: tag_word(word, inside_entity),
                }
            })
            .collect();

        let noun_chunks = chunk_nouns(&tokens);

        Ok(ParseOutput {
            tokens,
            noun_chunks,
        })
    }

    fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    fn is_ready(&self) -> bool {
        !self.patterns.is_empty() || !self.dictionary.is_empty()
    }
}

// ============================================================================
// Lexical helpers
// ============================================================================

const DETERMINERS: &[&str] = &[
    "the", "a", "an", "this", "that", "these", "those", "its", "their", "his", "her", "our",
];

const PREPOSITIONS: &[&str] = &[
    "of", "in", "on", "at", "by", "for", "with", "to", "from", "into", "over", "under", "between",
    "through", "during", "about", "as",
];

const CONJUNCTIONS: &[&str] = &["and", "or", "but", "nor", "so", "yet"];

const VERB_LEXICON: &[&str] = &[
    "is", "are", "was", "were", "be", "been", "has", "have", "had", "acquired", "acquires",
    "bought", "buys", "founded", "founds", "owns", "owned", "leads", "led", "works", "worked",
    "announced", "announces", "merged", "merges", "hired", "hires", "launched", "launches",
    "created", "creates", "developed", "develops", "sells", "sold", "produces", "produced",
    "joined", "joins", "runs", "ran", "operates", "operated", "manages", "managed", "employs",
    "employed", "located", "headquartered", "partnered", "partners", "invested", "invests",
    "opened", "opens", "closed", "closes", "signed", "signs", "won", "wins", "lost", "loses",
    "grew", "grows", "fell", "falls", "rose", "rises", "said", "says", "made", "makes",
];

fn is_stopword(word: &str) -> bool {
    let lower = word.to_lowercase();
    DETERMINERS.contains(&lower.as_str())
        || PREPOSITIONS.contains(&lower.as_str())
        || CONJUNCTIONS.contains(&lower.as_str())
}

/// Split text into (byte offset, word) items; punctuation is its own word
fn split_words(text: &str) -> Vec<(usize, &str)> {
    let mut words = Vec::new();
    let mut word_start: Option<usize> = None;

    for (idx, ch) in text.char_indices() {
        if ch.is_alphanumeric() || ch == '\'' || ch == '-' {
            if word_start.is_none() {
                word_start = Some(idx);
            }
        } else {
            if let Some(start) = word_start.take() {
                words.push((start, &text[start..idx]));
            }
            if !ch.is_whitespace() {
                words.push((idx, &text[idx..idx + ch.len_utf8()]));
            }
        }
    }
    if let Some(start) = word_start {
        words.push((start, &text[start..]));
    }

    words
}

fn tag_word(word: &str, inside_entity: bool) -> PosTag {
    let lower = word.to_lowercase();

    if word.chars().all(|c| !c.is_alphanumeric()) {
        PosTag::Punctuation
    } else if DETERMINERS.contains(&lower.as_str()) {
        PosTag::Determiner
    } else if PREPOSITIONS.contains(&lower.as_str()) {
        PosTag::Preposition
    } else if inside_entity {
        // Entity words parse as nouns regardless of surface form
        PosTag::Noun
    } else if VERB_LEXICON.contains(&lower.as_str()) {
        PosTag::Verb
    } else if lower.ends_with("ed") || lower.ends_with("ing") {
        PosTag::Verb
    } else if CONJUNCTIONS.contains(&lower.as_str()) {
        PosTag::Other
    } else {
        PosTag::Noun
    }
}

/// Greedy noun-phrase chunking: maximal runs of nouns/adjectives with an
/// optional leading determiner
fn chunk_nouns(tokens: &[ParsedToken]) -> Vec<NounChunk> {
    let mut chunks = Vec::new();
    let mut run: Vec<&ParsedToken> = Vec::new();

    for token in tokens {
        match token.pos {
            PosTag::Noun | PosTag::Adjective => run.push(token),
            PosTag::Determiner if run.is_empty() => run.push(token),
            _ => {
                push_chunk(&mut chunks, &run);
                run.clear();
            }
        }
    }
    push_chunk(&mut chunks, &run);

    chunks
}

fn push_chunk(chunks: &mut Vec<NounChunk>, run: &[&ParsedToken]) {
    // A lone determiner is not a phrase
    let has_noun = run.iter().any(|t| t.pos != PosTag::Determiner);
    if run.is_empty() || !has_noun {
        return;
    }

    let start = run[0].start;
    let last = run[run.len() - 1];
    let end = last.start + last.text.len();
    let mut text = String::new();
    for (i, token) in run.iter().enumerate() {
        if i > 0 {
            text.push(' ');
        }
        text.push_str(&token.text);
    }

    chunks.push(NounChunk {
        text,
        start,
        end,
        token_len: run.len(),
    });
}

/// Drop overlapping spans, keeping the highest-confidence one per region
fn dedup_spans(mut spans: Vec<SpanMatch>) -> Vec<SpanMatch> {
    spans.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
            .then(b.end.cmp(&a.end))
    });

    let mut result: Vec<SpanMatch> = Vec::new();
    let mut covered: HashSet<usize> = HashSet::new();

    for span in spans {
        let overlaps = (span.start..span.end).any(|i| covered.contains(&i));
        if !overlaps {
            for i in span.start..span.end {
                covered.insert(i);
            }
            result.push(span);
        }
    }

    result.sort_by_key(|s| s.start);
    result
}

fn is_word_bounded(text: &str, start: usize, end: usize) -> bool {
    let before_ok = start == 0
        || text[..start]
            .chars()
            .next_back()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
    let after_ok = end >= text.len()
        || text[end..]
            .chars()
            .next()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
    before_ok && after_ok
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Deterministic per-piece vector in [-1, 1]
fn piece_vector(piece: &str, dim: usize) -> Vec<f32> {
    let mut state = fnv1a(piece.as_bytes()) | 1;
    let mut vector = Vec::with_capacity(dim);
    for _ in 0..dim {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let unit = (state >> 11) as f32 / (1u64 << 53) as f32;
        vector.push(unit * 2.0 - 1.0);
    }
    vector
}

// ============================================================================
// Tests
// ============================================================================
