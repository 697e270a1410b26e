//! Context embedding extraction
//!
//! For every distinct (entity, context sentence) observed in a batch, a
//! context vector is read from the recognition model's hidden states: the
//! mean over the entity's token span concatenated with the whole-sentence
//! mean. One shared low-dimensional projector is fitted per batch before
//! any vector is projected; a second projector over sentence-only vectors
//! supports sentence-level similarity queries.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::{Array1, Array2, Axis};
use tracing::debug;

use kgx_core::{EmbeddingRecord, EntityPair, KgxError, LanguageModel, Result};

/// Power-iteration sweeps per principal component
const POWER_ITERATIONS: usize = 60;

// ============================================================================
// Projector
// ============================================================================

/// A batch-fitted linear projection to low dimensionality.
///
/// Principal components are found with deterministic power iteration and
/// deflation; the fit is shared by every vector in the batch.
#[derive(Debug, Clone)]
pub struct Projector {
    mean: Array1<f32>,
    components: Array2<f32>,
}

impl Projector {
    /// Fit a projector over row vectors.
    ///
    /// The component count is capped at both the requested dimensionality
    /// and the number of samples.
    pub fn fit(data: &Array2<f32>, target_dim: usize) -> Result<Self> {
        let n = data.nrows();
        let d = data.ncols();
        if n == 0 || d == 0 {
            return Err(KgxError::Embedding("empty embedding set".to_string()));
        }

        let k = target_dim.min(n).min(d).max(1);

        let mean = data
            .mean_axis(Axis(0))
            .ok_or_else(|| KgxError::Embedding("degenerate embedding matrix".to_string()))?;
        let centered = data - &mean;

        // Covariance without the 1/(n-1) factor; scaling does not change
        // the eigenvectors
        let mut cov = centered.t().dot(&centered);

        let mut components = Array2::<f32>::zeros((k, d));
        for row in 0..k {
            let component = dominant_eigenvector(&cov);
            let eigenvalue = component.dot(&cov.dot(&component));

            // Deflate before extracting the next component
            for i in 0..d {
                for j in 0..d {
                    cov[[i, j]] -= eigenvalue * component[i] * component[j];
                }
            }

            components.row_mut(row).assign(&component);
        }

        Ok(Self { mean, components })
    }

    /// Project one vector through the fitted components
    pub fn project(&self, vector: &[f32]) -> Vec<f32> {
        let x = Array1::from_iter(vector.iter().copied());
        let centered = &x - &self.mean;
        self.components.dot(&centered).to_vec()
    }

    /// Projected dimensionality
    pub fn dim(&self) -> usize {
        self.components.nrows()
    }
}

/// Deterministic power iteration for the dominant eigenvector
fn dominant_eigenvector(matrix: &Array2<f32>) -> Array1<f32> {
    let d = matrix.ncols();
    let mut v = Array1::<f32>::from_elem(d, 1.0 / (d as f32).sqrt());

    for _ in 0..POWER_ITERATIONS {
        let next = matrix.dot(&v);
        let norm = next.dot(&next).sqrt();
        if norm <= f32::EPSILON {
            // Zero matrix after deflation: any unit vector is valid
            return v;
        }
        v = next / norm;
    }

    v
}

// ============================================================================
// Extractor
// ============================================================================

/// Per-batch output of the embedding stage
pub struct BatchEmbeddings {
    /// Projector fitted over entity+sentence context vectors
    pub entity_projector: Projector,

    /// Projector fitted over sentence-only vectors
    pub sentence_projector: Projector,

    /// One projected record per distinct (entity, sentence)
    pub records: Vec<EmbeddingRecord>,
}

/// Extracts and projects context embeddings for a batch of pairs
pub struct EmbeddingExtractor {
    model: Arc<dyn LanguageModel>,
    projection_dim: usize,
}

impl EmbeddingExtractor {
    pub fn new(model: Arc<dyn LanguageModel>, projection_dim: usize) -> Self {
        Self {
            model,
            projection_dim,
        }
    }

    /// Extract context vectors for every distinct (entity, sentence), fit
    /// the shared projectors, and write projected embeddings back onto
    /// each pair's signals.
    pub fn extract(&self, pairs: &mut [EntityPair], source: &str) -> Result<BatchEmbeddings> {
        if pairs.is_empty() {
            return Err(KgxError::Embedding("empty embedding set".to_string()));
        }

        // Distinct (entity text, sentence) -> raw context vector.
        // BTreeMap fixes iteration order for the shared fit.
        let mut entity_vectors: BTreeMap<(String, String), Vec<f32>> = BTreeMap::new();
        let mut sentence_vectors: BTreeMap<String, Vec<f32>> = BTreeMap::new();

        for pair in pairs.iter() {
            for entity in [&pair.entity1, &pair.entity2] {
                let key = (entity.text.clone(), pair.sentence.clone());
                if entity_vectors.contains_key(&key) {
                    continue;
                }

                let (entity_vec, sentence_vec) =
                    self.context_vectors(&pair.sentence, entity.start, entity.end())?;

                sentence_vectors
                    .entry(pair.sentence.clone())
                    .or_insert_with(|| sentence_vec.clone());

                let mut context = entity_vec;
                context.extend(sentence_vec);
                entity_vectors.insert(key, context);
            }
        }

        let distinct_entities = entity_vectors.len();
        let entity_matrix = to_matrix(entity_vectors.values())?;
        let sentence_matrix = to_matrix(sentence_vectors.values())?;

        // The shared fit is capped by how many distinct entities the
        // batch actually produced
        let cap = self.projection_dim.min(distinct_entities);
        let entity_projector = Projector::fit(&entity_matrix, cap)?;
        let sentence_projector = Projector::fit(&sentence_matrix, cap)?;

        let projected: BTreeMap<(String, String), Vec<f32>> = entity_vectors
            .iter()
            .map(|(key, vector)| (key.clone(), entity_projector.project(vector)))
            .collect();

        for pair in pairs.iter_mut() {
            let v1 = projected
                .get(&(pair.entity1.text.clone(), pair.sentence.clone()))
                .cloned()
                .ok_or_else(|| KgxError::Embedding("missing projected vector".to_string()))?;
            let v2 = projected
                .get(&(pair.entity2.text.clone(), pair.sentence.clone()))
                .cloned()
                .ok_or_else(|| KgxError::Embedding("missing projected vector".to_string()))?;
            pair.signals.record_embeddings(v1, v2);
        }

        let records: Vec<EmbeddingRecord> = projected
            .into_iter()
            .map(|((entity, sentence), vector)| EmbeddingRecord {
                entity,
                sentence,
                vector,
                source: source.to_string(),
            })
            .collect();

        debug!(
            entities = distinct_entities,
            dim = entity_projector.dim(),
            "embeddings projected"
        );

        Ok(BatchEmbeddings {
            entity_projector,
            sentence_projector,
            records,
        })
    }

    /// Entity-span mean and whole-sentence mean of the hidden states
    fn context_vectors(
        &self,
        sentence: &str,
        span_start: usize,
        span_end: usize,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let tokens = self.model.tokenize(sentence);
        let output = self.model.infer(sentence, &tokens)?;

        let span: Vec<usize> = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.start >= span_start && t.start < span_end)
            .map(|(i, _)| i)
            .collect();

        let sentence_mean = output
            .hidden
            .mean_axis(Axis(0))
            .ok_or_else(|| KgxError::Embedding("empty hidden states".to_string()))?;

        let entity_mean = if span.is_empty() {
            sentence_mean.clone()
        } else {
            let mut acc = Array1::<f32>::zeros(output.hidden.ncols());
            for &i in &span {
                acc += &output.hidden.row(i);
            }
            acc / span.len() as f32
        };

        Ok((entity_mean.to_vec(), sentence_mean.to_vec()))
    }
}

fn to_matrix<'a>(rows: impl Iterator<Item = &'a Vec<f32>>) -> Result<Array2<f32>> {
    let rows: Vec<&Vec<f32>> = rows.collect();
    if rows.is_empty() {
        return Err(KgxError::Embedding("empty embedding set".to_string()));
    }

    let d = rows[0].len();
    let mut matrix = Array2::<f32>::zeros((rows.len(), d));
    for (i, row) in rows.iter().enumerate() {
        if row.len() != d {
            return Err(KgxError::Embedding("ragged embedding matrix".to_string()));
        }
        for (j, value) in row.iter().enumerate() {
            matrix[[i, j]] = *value;
        }
    }
    Ok(matrix)
}

// ============================================================================
// Tests
// ============================================================================
