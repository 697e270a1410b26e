//! Pair filter state machine
//!
//! A batch of candidate pairs moves through fixed stages:
//! Raw -> ScoreFiltered -> (optional) Clustered -> PersistenceFiltered ->
//! ThresholdFiltered -> Final. Duplicate and self pairs are removed before
//! any stage runs.

use std::collections::HashSet;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, warn};

use kgx_core::{ClusterAssignment, EngineConfig, EntityPair, Result, NOISE_LABEL};

use crate::density::{self, cosine_distance_matrix, standardize, DensityParams};

/// Parameters for one filter run
#[derive(Debug, Clone)]
pub struct FilterParams {
    /// Whether the score/cluster/persistence stages run at all
    pub enabled: bool,

    /// Entity-confidence floor
    pub score_threshold: f32,

    /// Pair-attention floor
    pub attention_score_threshold: f32,

    /// Cosine similarity above which two embeddings count as identical
    pub similarity_threshold: f32,

    /// Persistence floor; `PERSISTENCE_DISABLED` leaves every cluster in
    pub cluster_persistence_threshold: f32,

    /// Density clustering parameters
    pub min_cluster_size: usize,
    pub min_samples: usize,
}

impl FilterParams {
    /// Derive filter parameters from the engine configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            enabled: config.enable_filtering,
            score_threshold: config.score_threshold,
            attention_score_threshold: config.attention_score_threshold,
            similarity_threshold: config.similarity_threshold,
            cluster_persistence_threshold: config.cluster.cluster_persistence_threshold,
            min_cluster_size: config.cluster.min_cluster_size,
            min_samples: config.cluster.min_samples,
        }
    }
}

/// Remove self pairs and duplicate `(entity1, entity2, sentence)` keys,
/// keeping first occurrences in order.
///
/// Applying this twice yields the same result as applying it once.
pub fn dedup_pairs(pairs: Vec<EntityPair>) -> Vec<EntityPair> {
    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    pairs
        .into_iter()
        .filter(|pair| !pair.is_self_pair())
        .filter(|pair| seen.insert(pair.key()))
        .collect()
}

/// Runs the filter state machine over batches of pairs
pub struct PairFilter {
    params: FilterParams,
}

impl PairFilter {
    pub fn new(params: FilterParams) -> Self {
        Self { params }
    }

    /// Run the full state machine.
    ///
    /// `seed` keys the noise-sampling RNG; callers derive it from the
    /// batch source so repeated runs stay reproducible.
    pub fn run(&self, pairs: Vec<EntityPair>, seed: u64) -> Result<Vec<EntityPair>> {
        // Raw: drop self pairs and duplicates before anything else
        let pairs = dedup_pairs(pairs);
        if !self.params.enabled {
            return Ok(pairs);
        }

        // ScoreFiltered
        let score_filtered: Vec<EntityPair> = pairs
            .into_iter()
            .filter(|p| self.passes_thresholds(p))
            .collect();

        // Clustered: only when more than one pair survives
        let (selected, assignment) = if score_filtered.len() > 1 {
            self.cluster_and_select(score_filtered, seed)?
        } else {
            (score_filtered, None)
        };

        // PersistenceFiltered
        let persistence_filtered = match &assignment {
            Some(assignment) => filter_by_cluster_persistence(
                &selected,
                assignment,
                self.params.cluster_persistence_threshold,
            ),
            None => selected.clone(),
        };

        // ThresholdFiltered: fall back to the pre-persistence set when the
        // persistence floor removed everything
        let final_input = if persistence_filtered.is_empty() && !selected.is_empty() {
            warn!("persistence filter removed all pairs, falling back");
            selected
        } else {
            persistence_filtered
        };

        let finals: Vec<EntityPair> = final_input
            .into_iter()
            .filter(|p| self.passes_thresholds(p))
            .collect();

        debug!(pairs = finals.len(), "filter state machine complete");
        Ok(finals)
    }

    fn passes_thresholds(&self, pair: &EntityPair) -> bool {
        let entity_score = pair.entity1.confidence.min(pair.entity2.confidence);
        if entity_score < self.params.score_threshold {
            return false;
        }

        // Pairs that never went through attention scoring pass freely
        match pair.signals.pair_attention {
            Some(attention) => attention >= self.params.attention_score_threshold,
            None => true,
        }
    }

    /// Cluster the surviving pairs and keep representatives per cluster.
    ///
    /// Returns the kept pairs along with their (label, persistence) so the
    /// persistence stage can filter without re-clustering.
    #[allow(clippy::type_complexity)]
    fn cluster_and_select(
        &self,
        pairs: Vec<EntityPair>,
        seed: u64,
    ) -> Result<(Vec<EntityPair>, Option<Vec<(i32, f32)>>)> {
        let Some(matrix) = self.combined_embeddings(&pairs) else {
            // No embeddings recorded: clustering cannot run, keep all
            return Ok((pairs, None));
        };

        let mut matrix = matrix;
        standardize(&mut matrix);
        let distance = cosine_distance_matrix(&matrix);

        let assignment = density::cluster(
            &distance,
            &DensityParams {
                min_cluster_size: self.params.min_cluster_size,
                min_samples: self.params.min_samples,
            },
        )?;

        let kept = select_representatives(&pairs, &assignment, seed);

        let mut selected = Vec::with_capacity(kept.len());
        let mut labels = Vec::with_capacity(kept.len());
        for index in kept {
            let label = assignment.labels[index];
            labels.push((label, assignment.persistence_of(label)));
            selected.push(pairs[index].clone());
        }

        Ok((selected, Some(labels)))
    }

    /// Combine each pair's two entity embeddings into one row vector.
    ///
    /// Near-identical embeddings (cosine similarity above the configured
    /// floor) contribute a single copy twice so row widths stay uniform.
    fn combined_embeddings(&self, pairs: &[EntityPair]) -> Option<Array2<f32>> {
        let width = pairs
            .iter()
            .find_map(|p| p.signals.entity1_embedding.as_ref().map(Vec::len))?;

        let mut matrix = Array2::<f32>::zeros((pairs.len(), width * 2));
        for (row, pair) in pairs.iter().enumerate() {
            let v1 = pair.signals.entity1_embedding.as_ref()?;
            let v2 = pair.signals.entity2_embedding.as_ref()?;
            if v1.len() != width || v2.len() != width {
                return None;
            }

            let second = if cosine_similarity(v1, v2) >= self.params.similarity_threshold {
                v1
            } else {
                v2
            };

            for (col, value) in v1.iter().chain(second.iter()).enumerate() {
                matrix[[row, col]] = *value;
            }
        }

        Some(matrix)
    }
}

/// Restrict pairs to clusters whose persistence exceeds the floor.
///
/// `assignment[i]` is the (cluster label, persistence) of `pairs[i]`.
/// A negative threshold is the disabled sentinel: the input comes back
/// unchanged regardless of cluster assignments. When active, noise pairs
/// belong to no cluster and are removed.
pub fn filter_by_cluster_persistence(
    pairs: &[EntityPair],
    assignment: &[(i32, f32)],
    threshold: f32,
) -> Vec<EntityPair> {
    if threshold < 0.0 {
        // PERSISTENCE_DISABLED and any other negative value
        return pairs.to_vec();
    }

    pairs
        .iter()
        .zip(assignment.iter())
        .filter(|(_, &(label, persistence))| label != NOISE_LABEL && persistence > threshold)
        .map(|(pair, _)| pair.clone())
        .collect()
}

/// Persistence-tiered representative selection.
///
/// High-persistence clusters keep a small fraction of members; weaker
/// clusters keep more. Noise pairs are sampled at 50% with the seeded RNG.
/// Returned indices are sorted ascending.
fn select_representatives(
    pairs: &[EntityPair],
    assignment: &ClusterAssignment,
    seed: u64,
) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut kept = Vec::new();

    for cluster_id in assignment.cluster_ids() {
        let mut members: Vec<usize> = (0..pairs.len())
            .filter(|&i| assignment.labels[i] == cluster_id)
            .collect();

        let persistence = assignment.persistence_of(cluster_id);
        let (fraction, cap) = if persistence > 0.2 {
            (0.2, 50)
        } else if persistence > 0.1 {
            (0.3, 100)
        } else {
            (0.5, 100)
        };

        let quota = ((members.len() as f32 * fraction).ceil() as usize)
            .clamp(1, cap)
            .min(members.len());

        // Most-attended pairs represent the cluster; index breaks ties
        members.sort_by(|&a, &b| {
            let score_a = pairs[a].signals.pair_attention.unwrap_or(0.0);
            let score_b = pairs[b].signals.pair_attention.unwrap_or(0.0);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        kept.extend(members.into_iter().take(quota));
    }

    // Noise pairs: random half survives
    let mut noise: Vec<usize> = (0..pairs.len())
        .filter(|&i| assignment.labels[i] == NOISE_LABEL)
        .collect();
    noise.shuffle(&mut rng);
    let noise_quota = noise.len().div_ceil(2);
    kept.extend(noise.into_iter().take(noise_quota));

    kept.sort_unstable();
    kept
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kgx_core::config::PERSISTENCE_DISABLED;
    use kgx_core::{Entity, NounPhrase};
    use proptest::prelude::*;

    fn entity(text: &str, confidence: f32, start: usize) -> Entity {
        Entity::new(
            text,
            "Organization",
            confidence,
            start,
            NounPhrase {
                text: text.to_string(),
                start,
                token_len: 1,
            },
        )
    }

    fn pair(e1: &str, e2: &str, sentence: &str, confidence: f32) -> EntityPair {
        EntityPair::new(
            entity(e1, confidence, 0),
            entity(e2, confidence, 20),
            sentence,
            0,
        )
    }

    fn params(enabled: bool) -> FilterParams {
        FilterParams {
            enabled,
            score_threshold: 0.5,
            attention_score_threshold: 0.1,
            similarity_threshold: 0.999,
            cluster_persistence_threshold: PERSISTENCE_DISABLED,
            min_cluster_size: 2,
            min_samples: 2,
        }
    }

    #[test]
    fn test_disabled_filter_returns_input_unchanged() {
        let filter = PairFilter::new(params(false));
        let input = vec![pair("Acme Corp", "Globex", "Acme Corp acquired Globex.", 0.9)];

        let output = filter.run(input.clone(), 7).unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].key(), input[0].key());
    }

    #[test]
    fn test_dedup_removes_duplicate_keys() {
        let input = vec![
            pair("Acme", "Globex", "s1", 0.9),
            pair("Acme", "Globex", "s1", 0.7),
            pair("Acme", "Globex", "s2", 0.9),
        ];

        let output = dedup_pairs(input);
        assert_eq!(output.len(), 2);
        // First occurrence wins
        assert_eq!(output[0].entity1.confidence, 0.9);
    }

    #[test]
    fn test_dedup_removes_self_pairs() {
        let np = NounPhrase {
            text: "the company".to_string(),
            start: 0,
            token_len: 2,
        };
        let e1 = Entity::new("company", "Organization", 0.9, 4, np.clone());
        let e2 = Entity::new("company", "Organization", 0.9, 4, np);
        let self_pair = EntityPair::new(e1, e2, "the company", 0);

        let output = dedup_pairs(vec![self_pair, pair("Acme", "Globex", "s1", 0.9)]);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].entity1.text, "Acme");
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let input = vec![
            pair("Acme", "Globex", "s1", 0.9),
            pair("Acme", "Globex", "s1", 0.8),
            pair("Initech", "Globex", "s2", 0.7),
        ];

        let once = dedup_pairs(input);
        let twice = dedup_pairs(once.clone());
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.key(), b.key());
        }
    }

    #[test]
    fn test_score_threshold_drops_low_confidence() {
        let filter = PairFilter::new(params(true));
        let input = vec![
            pair("Acme", "Globex", "s1", 0.9),
            pair("Weak", "Signal", "s2", 0.2),
        ];

        let output = filter.run(input, 7).unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].entity1.text, "Acme");
    }

    #[test]
    fn test_attention_threshold_applies_when_scored() {
        let filter = PairFilter::new(params(true));

        let mut scored = pair("Acme", "Globex", "s1", 0.9);
        scored.signals.record_attention(0.01, 0.01, 0.005);

        let output = filter.run(vec![scored], 7).unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn test_persistence_sentinel_returns_input_unchanged() {
        let input = vec![
            pair("Acme", "Globex", "s1", 0.9),
            pair("Initech", "Hooli", "s2", 0.8),
            pair("Umbrella", "Tyrell", "s3", 0.7),
        ];
        // Labels and persistence values are arbitrary; the sentinel must
        // ignore them entirely
        let assignment = vec![(0, 0.9), (NOISE_LABEL, 0.0), (1, 0.01)];

        let output = filter_by_cluster_persistence(&input, &assignment, PERSISTENCE_DISABLED);
        assert_eq!(output.len(), input.len());
        for (a, b) in input.iter().zip(output.iter()) {
            assert_eq!(a.key(), b.key());
        }
    }

    #[test]
    fn test_persistence_floor_drops_weak_clusters_and_noise() {
        let input = vec![
            pair("Acme", "Globex", "s1", 0.9),
            pair("Initech", "Hooli", "s2", 0.8),
            pair("Umbrella", "Tyrell", "s3", 0.7),
        ];
        let assignment = vec![(0, 0.9), (NOISE_LABEL, 0.0), (1, 0.01)];

        let output = filter_by_cluster_persistence(&input, &assignment, 0.1);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].entity1.text, "Acme");
    }

    #[test]
    fn test_single_survivor_skips_clustering() {
        let filter = PairFilter::new(params(true));
        let output = filter
            .run(vec![pair("Acme", "Globex", "s1", 0.9)], 7)
            .unwrap();
        assert_eq!(output.len(), 1);
    }

    #[test]
    fn test_noise_sampling_is_seeded() {
        let filter = PairFilter::new(params(true));

        let make_input = || -> Vec<EntityPair> {
            (0..6)
                .map(|i| {
                    let mut p = pair(
                        &format!("E{i}"),
                        &format!("F{i}"),
                        &format!("s{i}"),
                        0.9,
                    );
                    // Spread-out embeddings: everything is noise
                    let x = (i as f32 * 17.0).sin() * 10.0;
                    let y = (i as f32 * 31.0).cos() * 10.0;
                    p.signals.record_embeddings(vec![x, y, 1.0], vec![y, x, -1.0]);
                    p
                })
                .collect()
        };

        let a = filter.run(make_input(), 42).unwrap();
        let b = filter.run(make_input(), 42).unwrap();

        let keys_a: Vec<_> = a.iter().map(|p| p.key()).collect();
        let keys_b: Vec<_> = b.iter().map(|p| p.key()).collect();
        assert_eq!(keys_a, keys_b);
    }

    proptest! {
        #[test]
        fn prop_dedup_idempotent(confidences in proptest::collection::vec(0.0f32..1.0, 1..20)) {
            let pairs: Vec<EntityPair> = confidences
                .iter()
                .enumerate()
                .map(|(i, &c)| pair(&format!("E{}", i % 3), "Globex", "s", c))
                .collect();

            let once = dedup_pairs(pairs);
            let twice = dedup_pairs(once.clone());
            prop_assert_eq!(once.len(), twice.len());
        }

        #[test]
        fn prop_raising_score_threshold_shrinks_output(
            low in 0.0f32..0.5,
            delta in 0.0f32..0.5,
            confidences in proptest::collection::vec(0.0f32..1.0, 1..20),
        ) {
            let high = low + delta;
            let pairs: Vec<EntityPair> = confidences
                .iter()
                .enumerate()
                .map(|(i, &c)| pair(&format!("E{i}"), &format!("F{i}"), &format!("s{i}"), c))
                .collect();

            let filter_low = PairFilter::new(FilterParams {
                score_threshold: low,
                ..params(true)
            });
            let filter_high = PairFilter::new(FilterParams {
                score_threshold: high,
                ..params(true)
            });

            let out_low: HashSet<_> = filter_low
                .run(pairs.clone(), 7)
                .unwrap()
                .iter()
                .map(|p| p.key())
                .collect();
            let out_high: HashSet<_> = filter_high
                .run(pairs, 7)
                .unwrap()
                .iter()
                .map(|p| p.key())
                .collect();

            prop_assert!(out_high.is_subset(&out_low));
        }
    }
}
