//! Candidate pair generation
//!
//! Produces (entity, entity) candidate pairs per sentence window, gated
//! by the token distance between the two spans. Filler tokens and tokens
//! belonging to either entity's own noun phrase do not count toward the
//! distance.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use kgx_core::{Entity, EntityPair, LanguageModel, Result};

use crate::chunker::Sentence;

/// Pairs farther apart than this many filtered tokens are discarded
pub const MAX_PAIR_TOKEN_DISTANCE: usize = 30;

/// Generates candidate entity pairs within sentences
pub struct PairGenerator {
    model: Arc<dyn LanguageModel>,
}

impl PairGenerator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Generate deduplicated candidate pairs for a batch.
    ///
    /// `entities[i]` holds the recognized entities of `sentences[i]`.
    /// Accepted pairs carry the previous and next sentence for later
    /// context widening.
    pub fn generate(
        &self,
        sentences: &[Sentence],
        entities: &[Vec<Entity>],
    ) -> Result<Vec<EntityPair>> {
        let mut pairs = Vec::new();
        let mut seen: HashSet<(String, String, String)> = HashSet::new();

        for (idx, sentence) in sentences.iter().enumerate() {
            let sentence_entities = match entities.get(idx) {
                Some(list) if list.len() >= 2 => list,
                _ => continue,
            };

            let parse = self.model.parse(&sentence.text)?;

            let mut ordered: Vec<&Entity> = sentence_entities.iter().collect();
            ordered.sort_by_key(|e| e.start);

            for i in 0..ordered.len() {
                for j in (i + 1)..ordered.len() {
                    let first = ordered[i];
                    let second = ordered[j];

                    let distance = filtered_distance(&parse.tokens, first, second);
                    if distance > MAX_PAIR_TOKEN_DISTANCE {
                        debug!(
                            entity1 = %first.text,
                            entity2 = %second.text,
                            distance,
                            "pair rejected by token distance"
                        );
                        continue;
                    }

                    let pair = EntityPair::new(
                        first.clone(),
                        second.clone(),
                        sentence.text.clone(),
                        sentence.index,
                    )
                    .with_context(
                        idx.checked_sub(1).map(|p| sentences[p].text.clone()),
                        sentences.get(idx + 1).map(|n| n.text.clone()),
                    );

                    if seen.insert(pair.key()) {
                        pairs.push(pair);
                    }
                }
            }
        }

        Ok(pairs)
    }
}

/// Count tokens between two spans, excluding fillers and tokens inside
/// either entity's own noun phrase
fn filtered_distance(
    tokens: &[kgx_core::ParsedToken],
    first: &Entity,
    second: &Entity,
) -> usize {
    let gap_start = first.end().min(second.end());
    let gap_end = first.start.max(second.start);

    let phrase_spans = [
        (
            first.noun_phrase.start,
            first.noun_phrase.start + first.noun_phrase.text.len(),
        ),
        (
            second.noun_phrase.start,
            second.noun_phrase.start + second.noun_phrase.text.len(),
        ),
    ];

    tokens
        .iter()
        .filter(|t| t.start >= gap_start && t.start < gap_end)
        .filter(|t| !t.pos.is_filler())
        .filter(|t| {
            !phrase_spans
                .iter()
                .any(|&(start, end)| t.start >= start && t.start < end)
        })
        .count()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunker;
    use crate::recognizer::EntityRecognizer;
    use kgx_core::LexiconModel;

    fn two_org_model() -> LexiconModel {
        let mut model = LexiconModel::empty();
        model.add_term("Acme Corp", "Organization", vec![]);
        model.add_term("Globex", "Organization", vec![]);
        model
    }

    fn pairs_for(model: LexiconModel, text: &str) -> Vec<EntityPair> {
        let model: Arc<dyn LanguageModel> = Arc::new(model);
        let chunker = Chunker::new(model.clone());
        let recognizer = EntityRecognizer::new(model.clone());
        let generator = PairGenerator::new(model);

        let sentences = chunker.split_sentences(text);
        let entities: Vec<Vec<Entity>> = sentences
            .iter()
            .map(|s| {
                let windows = chunker.windows(s);
                recognizer.recognize(s, &windows).unwrap()
            })
            .collect();

        generator.generate(&sentences, &entities).unwrap()
    }

    #[test]
    fn test_two_entities_one_pair() {
        let pairs = pairs_for(two_org_model(), "Acme Corp acquired Globex in Paris.");

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].entity1.text, "Acme Corp");
        assert_eq!(pairs[0].entity2.text, "Globex");
    }

    #[test]
    fn test_distant_pair_discarded() {
        let middle = "worked ".repeat(MAX_PAIR_TOKEN_DISTANCE + 5);
        let text = format!("Acme Corp {middle}Globex.");

        let pairs = pairs_for(two_org_model(), &text);
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_fillers_do_not_count_toward_distance() {
        // Lots of fillers, one verb: effective distance stays small
        let text = "Acme Corp worked in the of the in the of the Globex.";
        let pairs = pairs_for(two_org_model(), text);

        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn test_pair_carries_neighbor_context() {
        let text = "Earlier news came out. Acme Corp acquired Globex. Markets reacted.";
        let pairs = pairs_for(two_org_model(), text);

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].prev_sentence.as_deref(), Some("Earlier news came out."));
        assert_eq!(pairs[0].next_sentence.as_deref(), Some("Markets reacted."));
    }

    #[test]
    fn test_duplicate_keys_collapse() {
        let model = two_org_model();
        // Same sentence appearing twice produces one pair per distinct key
        let text = "Acme Corp acquired Globex. Acme Corp acquired Globex.";
        let pairs = pairs_for(model, text);

        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn test_three_entities_three_pairs() {
        let mut model = two_org_model();
        model.add_term("Initech", "Organization", vec![]);

        let pairs = pairs_for(model, "Acme Corp acquired Globex and Initech.");
        assert_eq!(pairs.len(), 3);
    }
}
