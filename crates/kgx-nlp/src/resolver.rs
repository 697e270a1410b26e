//! Predicate resolution seam
//!
//! The downstream predicate-resolution collaborator receives filtered
//! pairs trimmed to context, spans, and labels, and returns completed
//! triples. [`VerbPhraseResolver`] is the bundled heuristic
//! implementation: the main verb between the two spans becomes the
//! predicate.

use std::sync::Arc;

use async_trait::async_trait;

use kgx_core::{LanguageModel, PosTag, Result, TrimmedPair, Triple};

/// Resolves predicates for filtered entity pairs
#[async_trait]
pub trait PredicateResolver: Send + Sync {
    /// Turn trimmed pairs into completed triples
    async fn resolve(&self, pairs: &[TrimmedPair], source: &str) -> Result<Vec<Triple>>;
}

/// Heuristic resolver: the first verb between the spans is the predicate.
///
/// Pairs with no verb between them fall back to a generic relation with
/// a reduced confidence.
pub struct VerbPhraseResolver {
    model: Arc<dyn LanguageModel>,
}

impl VerbPhraseResolver {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    fn resolve_one(&self, pair: &TrimmedPair, source: &str) -> Result<Triple> {
        let parse = self.model.parse(&pair.sentence)?;

        let gap_start = pair.entity1.end().min(pair.entity2.end());
        let gap_end = pair.entity1.start.max(pair.entity2.start);

        let verb = parse
            .tokens
            .iter()
            .filter(|t| t.start >= gap_start && t.start < gap_end)
            .find(|t| t.pos == PosTag::Verb);

        let confidence = pair.entity1.confidence.min(pair.entity2.confidence);
        let (predicate, predicate_type, confidence) = match verb {
            Some(token) => (token.text.to_lowercase(), "action".to_string(), confidence),
            None => ("related_to".to_string(), "generic".to_string(), confidence * 0.5),
        };

        Ok(Triple::new(
            pair.entity1.text.clone(),
            pair.entity1.primary_label(),
            predicate,
            predicate_type,
            pair.entity2.text.clone(),
            pair.entity2.primary_label(),
            pair.sentence.clone(),
            source,
            confidence,
        ))
    }
}

#[async_trait]
impl PredicateResolver for VerbPhraseResolver {
    async fn resolve(&self, pairs: &[TrimmedPair], source: &str) -> Result<Vec<Triple>> {
        pairs
            .iter()
            .map(|pair| self.resolve_one(pair, source))
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
