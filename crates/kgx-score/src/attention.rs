//! Attention-weighted pair scoring
//!
//! Each entity in a pair receives a relevance score derived from the
//! recognition model's final self-attention layer: the self-weighted mean
//! of attention directed at the entity's own token span, which emphasizes
//! already-high attention values. The two entity scores combine into a
//! pair score that is zero whenever either side is unattended.

use std::sync::Arc;

use tracing::trace;

use kgx_core::{Entity, EntityPair, InferenceOutput, LanguageModel, Result, Token};

/// Combine two entity attention scores into a pair score.
///
/// Parallel harmonic form `ab / (a + b)`: exactly zero when either score
/// is zero, and never above the smaller of the two.
pub fn harmonic_pair_score(a: f32, b: f32) -> f32 {
    if a <= 0.0 || b <= 0.0 {
        return 0.0;
    }
    (a * b) / (a + b)
}

/// Scores entity pairs from model attention
pub struct AttentionScorer {
    model: Arc<dyn LanguageModel>,
}

impl AttentionScorer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Score every pair in place.
    ///
    /// The model runs over each pair's sentence (the narrowest window
    /// containing both entities); identical sentences are re-run rather
    /// than cached so attention always reflects the exact window text.
    pub fn score(&self, pairs: &mut [EntityPair]) -> Result<()> {
        for pair in pairs.iter_mut() {
            let tokens = self.model.tokenize(&pair.sentence);
            let output = self.model.infer(&pair.sentence, &tokens)?;

            let score1 = entity_attention(&output, &tokens, &pair.entity1);
            let score2 = entity_attention(&output, &tokens, &pair.entity2);
            let pair_score = harmonic_pair_score(score1, score2);

            trace!(
                entity1 = %pair.entity1.text,
                entity2 = %pair.entity2.text,
                score1,
                score2,
                pair_score,
                "attention scored"
            );

            pair.signals.record_attention(score1, score2, pair_score);
        }

        Ok(())
    }
}

/// Self-weighted mean of attention directed at the entity's token span.
///
/// For each span token, total incoming attention is averaged over rows;
/// those per-token values are then averaged using themselves as weights:
/// `sum(a_j^2) / sum(a_j)`.
fn entity_attention(output: &InferenceOutput, tokens: &[Token], entity: &Entity) -> f32 {
    let span: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| t.start >= entity.start && t.start < entity.end())
        .map(|(i, _)| i)
        .collect();

    if span.is_empty() {
        return 0.0;
    }

    let n = output.attention.nrows();
    let mut weighted_sum = 0.0f32;
    let mut weight_total = 0.0f32;

    for &j in &span {
        let incoming: f32 = (0..n).map(|i| output.attention[[i, j]]).sum::<f32>() / n as f32;
        weighted_sum += incoming * incoming;
        weight_total += incoming;
    }

    if weight_total <= 0.0 {
        0.0
    } else {
        weighted_sum / weight_total
    }
}

// ============================================================================
// Tests
// ============================================================================
