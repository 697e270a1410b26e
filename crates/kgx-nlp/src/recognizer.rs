//! Entity recognition
//!
//! Runs the recognition model over each token window, merges contiguous
//! sub-word fragments back into whole-word entities, corrects start
//! offsets to the native sentence text, aligns each entity with its
//! enclosing noun phrase, and coalesces entities that share a phrase.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use kgx_core::{Entity, LanguageModel, NounChunk, NounPhrase, Result, Token, TokenLabel};

use crate::chunker::{Sentence, TokenWindow};

/// A whole-word entity span, before noun-phrase alignment
#[derive(Debug, Clone)]
struct WordEntity {
    text: String,
    label: String,
    score: f32,
    start: usize,
}

/// Recognizes typed entities in sentence windows
pub struct EntityRecognizer {
    model: Arc<dyn LanguageModel>,
}

impl EntityRecognizer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Recognize entities in one sentence given its token windows.
    ///
    /// Returned offsets are relative to the sentence text.
    pub fn recognize(&self, sentence: &Sentence, windows: &[TokenWindow]) -> Result<Vec<Entity>> {
        let mut words = Vec::new();
        for window in windows {
            let output = self.model.infer(&sentence.text, &window.tokens)?;
            words.extend(merge_fragments(&window.tokens, &output.labels, &sentence.text));
        }

        if words.is_empty() {
            return Ok(Vec::new());
        }

        let parse = self.model.parse(&sentence.text)?;
        let entities = coalesce_by_phrase(words, &parse.noun_chunks);

        debug!(
            sentence = sentence.index,
            entities = entities.len(),
            "recognized entities"
        );
        Ok(entities)
    }
}

/// Merge contiguous sub-word fragments into whole-word entities.
///
/// A word is an entity when its first fragment carries an entity label;
/// the word's confidence averages the scores of its labeled fragments,
/// and its start offset is taken from the native text.
fn merge_fragments(tokens: &[Token], labels: &[TokenLabel], text: &str) -> Vec<WordEntity> {
    let mut words = Vec::new();
    let mut idx = 0;

    while idx < tokens.len() {
        let word_index = tokens[idx].word_index;
        let mut end_idx = idx + 1;
        while end_idx < tokens.len() && tokens[end_idx].word_index == word_index {
            end_idx += 1;
        }

        if labels[idx].is_entity() {
            let label = labels[idx].label.clone();
            let labeled: Vec<f32> = (idx..end_idx)
                .filter(|&i| labels[i].label == label)
                .map(|i| labels[i].score)
                .collect();
            let score = labeled.iter().sum::<f32>() / labeled.len() as f32;

            let start = tokens[idx].start;
            let last = &tokens[end_idx - 1];
            let end = last.start + last.piece.len();

            words.push(WordEntity {
                text: text[start..end].to_string(),
                label,
                score,
                start,
            });
        }

        idx = end_idx;
    }

    words
}

/// Coalesce word entities that share an identical noun phrase.
///
/// The merged entity carries the phrase text (leading determiner
/// stripped), the averaged confidence, and the union of labels.
fn coalesce_by_phrase(words: Vec<WordEntity>, chunks: &[NounChunk]) -> Vec<Entity> {
    // Group by enclosing chunk span; BTreeMap keeps output in text order
    let mut groups: BTreeMap<(usize, usize), (Vec<WordEntity>, Option<&NounChunk>)> =
        BTreeMap::new();

    for word in words {
        let chunk = chunks.iter().find(|c| c.contains(word.start));
        let key = match chunk {
            Some(c) => (c.start, c.end),
            None => (word.start, word.start + word.text.len()),
        };
        groups.entry(key).or_insert_with(|| (Vec::new(), chunk)).0.push(word);
    }

    groups
        .into_values()
        .map(|(members, chunk)| {
            let confidence =
                members.iter().map(|w| w.score).sum::<f32>() / members.len() as f32;

            let mut labels = std::collections::BTreeSet::new();
            for member in &members {
                labels.insert(member.label.clone());
            }

            let (text, start, phrase) = match chunk {
                Some(c) => {
                    let (text, start) = strip_leading_determiner(c);
                    (
                        text,
                        start,
                        NounPhrase {
                            text: c.text.clone(),
                            start: c.start,
                            token_len: c.token_len,
                        },
                    )
                }
                None => {
                    let first = &members[0];
                    (
                        first.text.clone(),
                        first.start,
                        NounPhrase {
                            text: first.text.clone(),
                            start: first.start,
                            token_len: 1,
                        },
                    )
                }
            };

            Entity {
                text,
                labels,
                confidence,
                start,
                noun_phrase: phrase,
            }
        })
        .collect()
}

/// Entity text omits a leading determiner even though the phrase keeps it
fn strip_leading_determiner(chunk: &NounChunk) -> (String, usize) {
    const DETERMINERS: &[&str] = &["the", "a", "an", "this", "that", "these", "those"];

    if let Some((first, rest)) = chunk.text.split_once(' ') {
        if DETERMINERS.contains(&first.to_lowercase().as_str()) {
            let offset = chunk.text.len() - rest.len();
            return (rest.to_string(), chunk.start + offset);
        }
    }
    (chunk.text.clone(), chunk.start)
}

// ============================================================================
// Tests
// ============================================================================
