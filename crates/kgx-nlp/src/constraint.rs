//! Fixed entity / fixed predicate constraint extractors
//!
//! When a search is confined, these extractors replace the general
//! recognizer: user-specified entities (and synonym-expanded predicates)
//! are matched with compiled case-insensitive whole-word patterns, and
//! only matched sentences plus their immediate neighbors are retained.
//! Direct matches carry a fixed confidence of 1.0.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::debug;

use kgx_core::{Entity, KgxError, NounPhrase, Result};

use crate::chunker::Sentence;

/// Confidence assigned to direct pattern matches
const FIXED_MATCH_CONFIDENCE: f32 = 1.0;

/// Label assigned to fixed-entity matches
const FIXED_ENTITY_LABEL: &str = "Entity";

// ============================================================================
// Synonym Lexicon
// ============================================================================

/// Lexical synonym lookup used to expand fixed predicates.
///
/// Lookups are case-insensitive; expansion always includes the queried
/// term itself.
#[derive(Debug, Clone, Default)]
pub struct SynonymLexicon {
    synonyms: HashMap<String, Vec<String>>,
}

impl SynonymLexicon {
    /// Empty lexicon; terms expand only to themselves
    pub fn new() -> Self {
        Self::default()
    }

    /// Lexicon preloaded with common relational predicates
    pub fn builtin() -> Self {
        let mut lexicon = Self::new();
        lexicon.insert("acquired", &["bought", "purchased", "took over"]);
        lexicon.insert("founded", &["established", "created", "started"]);
        lexicon.insert("owns", &["holds", "possesses", "controls"]);
        lexicon.insert("works for", &["employed by", "works at"]);
        lexicon.insert("located in", &["based in", "headquartered in", "situated in"]);
        lexicon.insert("merged", &["combined", "joined", "consolidated"]);
        lexicon.insert("leads", &["heads", "manages", "runs", "directs"]);
        lexicon.insert("produces", &["makes", "manufactures", "builds"]);
        lexicon
    }

    /// Register synonyms for a term
    pub fn insert(&mut self, term: &str, synonyms: &[&str]) {
        self.synonyms.insert(
            term.to_lowercase(),
            synonyms.iter().map(|s| s.to_lowercase()).collect(),
        );
    }

    /// Expand a term to itself plus its registered synonyms
    pub fn expand(&self, term: &str) -> Vec<String> {
        let key = term.to_lowercase();
        let mut expanded = vec![key.clone()];
        if let Some(synonyms) = self.synonyms.get(&key) {
            expanded.extend(synonyms.iter().cloned());
        }
        expanded
    }
}

// ============================================================================
// Matches
// ============================================================================

/// A fixed-entity match within one sentence
#[derive(Debug, Clone)]
pub struct ConstraintMatch {
    /// Index of the matched sentence
    pub sentence_index: usize,

    /// Matched text as it appears in the sentence
    pub text: String,

    /// Byte offset of the match in the sentence
    pub start: usize,
}

/// A fixed-predicate match within one sentence
#[derive(Debug, Clone)]
pub struct PredicateMatch {
    /// Index of the matched sentence
    pub sentence_index: usize,

    /// Matched surface form
    pub text: String,

    /// The user-specified predicate the match expands from
    pub canonical: String,
}

// ============================================================================
// Fixed Entity Extractor
// ============================================================================

/// Whole-word matcher over a user-fixed entity list
pub struct FixedEntityExtractor {
    pattern: Regex,
}

impl FixedEntityExtractor {
    /// Compile a case-insensitive whole-word pattern over the entity list
    pub fn new(entities: &[String]) -> Result<Self> {
        if entities.is_empty() {
            return Err(KgxError::Config(
                "fixed-entity search requires at least one entity".to_string(),
            ));
        }

        let pattern = compile_word_pattern(entities.iter().map(String::as_str))?;
        Ok(Self { pattern })
    }

    /// Scan sentences for fixed-entity matches
    pub fn scan(&self, sentences: &[Sentence]) -> Vec<ConstraintMatch> {
        let mut matches = Vec::new();
        for sentence in sentences {
            for mat in self.pattern.find_iter(&sentence.text) {
                matches.push(ConstraintMatch {
                    sentence_index: sentence.index,
                    text: mat.as_str().to_string(),
                    start: mat.start(),
                });
            }
        }
        debug!(matches = matches.len(), "fixed-entity scan");
        matches
    }

    /// Sentence indices to retain: every matched sentence plus its
    /// immediate neighbors
    pub fn retained_sentences(
        &self,
        sentences: &[Sentence],
        matches: &[ConstraintMatch],
    ) -> HashSet<usize> {
        let mut retained = HashSet::new();
        for m in matches {
            if m.sentence_index > 0 {
                retained.insert(m.sentence_index - 1);
            }
            retained.insert(m.sentence_index);
            if m.sentence_index + 1 < sentences.len() {
                retained.insert(m.sentence_index + 1);
            }
        }
        retained
    }

    /// Convert matches into entities with fixed confidence.
    ///
    /// These substitute for recognizer output in confined searches.
    pub fn entities(&self, matches: &[ConstraintMatch]) -> Vec<Vec<Entity>> {
        let mut per_sentence: HashMap<usize, Vec<Entity>> = HashMap::new();

        for m in matches {
            let phrase = NounPhrase {
                text: m.text.clone(),
                start: m.start,
                token_len: m.text.split_whitespace().count(),
            };
            per_sentence.entry(m.sentence_index).or_default().push(Entity::new(
                m.text.clone(),
                FIXED_ENTITY_LABEL,
                FIXED_MATCH_CONFIDENCE,
                m.start,
                phrase,
            ));
        }

        let max_index = per_sentence.keys().copied().max().unwrap_or(0);
        (0..=max_index)
            .map(|i| per_sentence.remove(&i).unwrap_or_default())
            .collect()
    }
}

// ============================================================================
// Fixed Predicate Extractor
// ============================================================================

/// Whole-word matcher over synonym-expanded fixed predicates
pub struct FixedPredicateExtractor {
    pattern: Regex,
    /// Lowercased surface form -> canonical predicate
    canonical: HashMap<String, String>,
}

impl FixedPredicateExtractor {
    /// Expand each predicate through the lexicon and compile one pattern
    pub fn new(predicates: &[String], lexicon: &SynonymLexicon) -> Result<Self> {
        if predicates.is_empty() {
            return Err(KgxError::Config(
                "fixed-predicate search requires at least one predicate".to_string(),
            ));
        }

        let mut canonical = HashMap::new();
        let mut surface_forms = Vec::new();
        for predicate in predicates {
            for form in lexicon.expand(predicate) {
                canonical.insert(form.clone(), predicate.clone());
                surface_forms.push(form);
            }
        }

        let pattern = compile_word_pattern(surface_forms.iter().map(String::as_str))?;
        Ok(Self { pattern, canonical })
    }

    /// Scan sentences for predicate matches
    pub fn scan(&self, sentences: &[Sentence]) -> Vec<PredicateMatch> {
        let mut matches = Vec::new();
        for sentence in sentences {
            for mat in self.pattern.find_iter(&sentence.text) {
                let surface = mat.as_str().to_lowercase();
                let canonical = self
                    .canonical
                    .get(&surface)
                    .cloned()
                    .unwrap_or_else(|| surface.clone());
                matches.push(PredicateMatch {
                    sentence_index: sentence.index,
                    text: mat.as_str().to_string(),
                    canonical,
                });
            }
        }
        matches
    }

    /// First predicate match for a sentence, if any
    pub fn predicate_for<'a>(&self, matches: &'a [PredicateMatch], sentence_index: usize) -> Option<&'a PredicateMatch> {
        matches.iter().find(|m| m.sentence_index == sentence_index)
    }
}

/// Compile an alternation of whole-word, case-insensitive terms.
///
/// Longer terms are tried first so multi-word forms win over their
/// prefixes.
fn compile_word_pattern<'a>(terms: impl Iterator<Item = &'a str>) -> Result<Regex> {
    let mut escaped: Vec<String> = terms
        .filter(|t| !t.trim().is_empty())
        .map(|t| regex::escape(t.trim()))
        .collect();
    escaped.sort_by_key(|t| std::cmp::Reverse(t.len()));

    if escaped.is_empty() {
        return Err(KgxError::Config("no usable constraint terms".to_string()));
    }

    let pattern = format!(r"(?i)\b(?:{})\b", escaped.join("|"));
    Regex::new(&pattern).map_err(|e| KgxError::Config(format!("invalid constraint pattern: {e}")))
}

// ============================================================================
// Tests
// ============================================================================
