//! KGX Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout the KGX system:
//! - Extraction units (token batches, entities, entity pairs, triples)
//! - Event types published to subscribers
//! - Common error types
//! - The shared language-model service trait
//! - Configuration management

pub mod config;
pub mod model;

pub use config::{ClusterConfig, ConfigError, ConstraintConfig, EngineConfig, LoggingConfig};
pub use model::{
    InferenceOutput, LanguageModel, LexiconModel, NounChunk, ParseOutput, ParsedToken, PosTag,
    Token, TokenLabel,
};

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for KGX operations
#[derive(Error, Debug)]
pub enum KgxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Clustering error: {0}")]
    Clustering(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KgxError>;

// ============================================================================
// Ingestion Units
// ============================================================================

/// A unit of ingested text submitted to the engine.
///
/// Created by the upstream ingestion collaborator, consumed exactly once by
/// a worker, and never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBatch {
    /// Originating file or stream identifier
    pub source: String,

    /// Ordered text fragments making up the batch
    pub fragments: Vec<String>,

    /// Error reported by the ingestion source, if any
    pub error: Option<String>,

    /// Whether this batch is part of a continuous token stream
    /// (as opposed to a discrete document)
    pub streaming: bool,
}

impl TokenBatch {
    /// Create a new batch for a source
    pub fn new(source: impl Into<String>, fragments: Vec<String>) -> Self {
        Self {
            source: source.into(),
            fragments,
            error: None,
            streaming: false,
        }
    }

    /// Mark the batch as part of a continuous stream
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Attach a source-reported error
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Whether the source reported an error for this batch
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Concatenated text of all fragments
    pub fn text(&self) -> String {
        self.fragments.join(" ")
    }
}

/// Message on the shared input queue.
///
/// The terminal end-of-stream sentinel is channel closure; `FileDone`
/// marks the end of one source's batches.
#[derive(Debug, Clone)]
pub enum BatchEnvelope {
    /// One batch of work
    Batch(TokenBatch),
    /// All batches for this source have been enqueued
    FileDone { source: String },
}

// ============================================================================
// Recognized Entities
// ============================================================================

/// The noun phrase enclosing a recognized entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NounPhrase {
    /// Phrase text as it appears in the source
    pub text: String,

    /// Byte offset of the phrase in its sentence
    pub start: usize,

    /// Phrase length in tokens
    pub token_len: usize,
}

/// A recognized, typed text span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Span text as it appears in the source
    pub text: String,

    /// Entity-type labels; coalescing unions labels from merged spans
    pub labels: BTreeSet<String>,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,

    /// Byte offset of the span in its sentence
    pub start: usize,

    /// The enclosing noun phrase
    pub noun_phrase: NounPhrase,
}

impl Entity {
    /// Create a new entity with a single label
    pub fn new(
        text: impl Into<String>,
        label: impl Into<String>,
        confidence: f32,
        start: usize,
        noun_phrase: NounPhrase,
    ) -> Self {
        let mut labels = BTreeSet::new();
        labels.insert(label.into());
        Self {
            text: text.into(),
            labels,
            confidence,
            start,
            noun_phrase,
        }
    }

    /// Primary label (lexicographically first; labels are a sorted set)
    pub fn primary_label(&self) -> &str {
        self.labels
            .iter()
            .next()
            .map(String::as_str)
            .unwrap_or("Unknown")
    }

    /// End byte offset of the span
    pub fn end(&self) -> usize {
        self.start + self.text.len()
    }
}

// ============================================================================
// Candidate Pairs
// ============================================================================

/// Scores and embeddings accumulated by the pipeline stages.
///
/// Each stage only fills fields it owns; nothing is ever cleared, so a
/// later stage always sees what earlier stages wrote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairSignals {
    /// Attention relevance of entity 1 within the pair sentence
    pub entity1_attention: Option<f32>,

    /// Attention relevance of entity 2 within the pair sentence
    pub entity2_attention: Option<f32>,

    /// Combined pair attention score (harmonic mean)
    pub pair_attention: Option<f32>,

    /// Projected context embedding for entity 1
    pub entity1_embedding: Option<Vec<f32>>,

    /// Projected context embedding for entity 2
    pub entity2_embedding: Option<Vec<f32>>,
}

impl PairSignals {
    /// Record the attention scores produced by the attention scorer
    pub fn record_attention(&mut self, entity1: f32, entity2: f32, pair: f32) {
        self.entity1_attention = Some(entity1);
        self.entity2_attention = Some(entity2);
        self.pair_attention = Some(pair);
    }

    /// Record the projected embeddings produced by the embedding extractor
    pub fn record_embeddings(&mut self, entity1: Vec<f32>, entity2: Vec<f32>) {
        self.entity1_embedding = Some(entity1);
        self.entity2_embedding = Some(entity2);
    }
}

/// A candidate (subject, object) span pair with accumulating signals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityPair {
    /// First entity of the pair
    pub entity1: Entity,

    /// Second entity of the pair
    pub entity2: Entity,

    /// The sentence window both entities occur in
    pub sentence: String,

    /// Index of the sentence within its batch
    pub sentence_index: usize,

    /// Previous sentence, for context widening
    pub prev_sentence: Option<String>,

    /// Next sentence, for context widening
    pub next_sentence: Option<String>,

    /// Stage-accumulated scores and embeddings
    pub signals: PairSignals,
}

impl EntityPair {
    /// Create a pair with empty signals
    pub fn new(
        entity1: Entity,
        entity2: Entity,
        sentence: impl Into<String>,
        sentence_index: usize,
    ) -> Self {
        Self {
            entity1,
            entity2,
            sentence: sentence.into(),
            sentence_index,
            prev_sentence: None,
            next_sentence: None,
            signals: PairSignals::default(),
        }
    }

    /// Attach surrounding sentences
    pub fn with_context(mut self, prev: Option<String>, next: Option<String>) -> Self {
        self.prev_sentence = prev;
        self.next_sentence = next;
        self
    }

    /// Deduplication key: (entity-1 text, entity-2 text, sentence)
    pub fn key(&self) -> (String, String, String) {
        (
            self.entity1.text.clone(),
            self.entity2.text.clone(),
            self.sentence.clone(),
        )
    }

    /// Whether both sides resolve to the same noun phrase
    pub fn is_self_pair(&self) -> bool {
        self.entity1.noun_phrase == self.entity2.noun_phrase
    }

    /// Strip scores and embeddings for the predicate-resolution collaborator
    pub fn trimmed(&self) -> TrimmedPair {
        TrimmedPair {
            entity1: self.entity1.clone(),
            entity2: self.entity2.clone(),
            sentence: self.sentence.clone(),
            prev_sentence: self.prev_sentence.clone(),
            next_sentence: self.next_sentence.clone(),
        }
    }
}

/// An entity pair trimmed to context, spans, and labels only.
///
/// This is the shape handed to the downstream predicate-resolution
/// collaborator; scores and embeddings never leave the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrimmedPair {
    pub entity1: Entity,
    pub entity2: Entity,
    pub sentence: String,
    pub prev_sentence: Option<String>,
    pub next_sentence: Option<String>,
}

// ============================================================================
// Triples
// ============================================================================

/// A subject-predicate-object emission with provenance and confidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triple {
    /// Unique identifier
    pub id: Uuid,

    /// Subject text
    pub subject: String,

    /// Subject entity type
    pub subject_type: String,

    /// Predicate text
    pub predicate: String,

    /// Predicate type
    pub predicate_type: String,

    /// Object text
    pub object: String,

    /// Object entity type
    pub object_type: String,

    /// Sentence the triple was extracted from
    pub sentence: String,

    /// Originating file or stream
    pub source: String,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
}

impl Triple {
    /// Create a new triple
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subject: impl Into<String>,
        subject_type: impl Into<String>,
        predicate: impl Into<String>,
        predicate_type: impl Into<String>,
        object: impl Into<String>,
        object_type: impl Into<String>,
        sentence: impl Into<String>,
        source: impl Into<String>,
        confidence: f32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            subject_type: subject_type.into(),
            predicate: predicate.into(),
            predicate_type: predicate_type.into(),
            object: object.into(),
            object_type: object_type.into(),
            sentence: sentence.into(),
            source: source.into(),
            confidence,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Event types published by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A serialized triple destined for the graph store
    Graph,
    /// A serialized embedding record destined for the vector store
    Vector,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graph => write!(f, "graph"),
            Self::Vector => write!(f, "vector"),
        }
    }
}

/// An embedding record published alongside triples
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Entity text the embedding belongs to
    pub entity: String,

    /// Context sentence the embedding was extracted in
    pub sentence: String,

    /// Projected vector
    pub vector: Vec<f32>,

    /// Originating file or stream
    pub source: String,
}

/// Payload carried by an event state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EventPayload {
    Graph(Triple),
    Vector(EmbeddingRecord),
}

/// A typed, timestamped state-change event.
///
/// Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventState {
    /// Event type tag
    pub event_type: EventType,

    /// Publication timestamp
    pub timestamp: DateTime<Utc>,

    /// Typed payload
    pub payload: EventPayload,

    /// Originating file or stream
    pub source: String,
}

impl EventState {
    /// Wrap a triple as a graph event
    pub fn graph(triple: Triple) -> Self {
        let source = triple.source.clone();
        Self {
            event_type: EventType::Graph,
            timestamp: Utc::now(),
            payload: EventPayload::Graph(triple),
            source,
        }
    }

    /// Wrap an embedding record as a vector event
    pub fn vector(record: EmbeddingRecord) -> Self {
        let source = record.source.clone();
        Self {
            event_type: EventType::Vector,
            timestamp: Utc::now(),
            payload: EventPayload::Vector(record),
            source,
        }
    }
}

// ============================================================================
// Cluster Assignments
// ============================================================================

/// Label assigned to unclustered (noise) points
pub const NOISE_LABEL: i32 = -1;

/// Per-batch cluster assignment over a list of entity pairs.
///
/// Ephemeral: computed per batch, never persisted.
#[derive(Debug, Clone, Default)]
pub struct ClusterAssignment {
    /// Cluster id per pair index; `NOISE_LABEL` marks noise
    pub labels: Vec<i32>,

    /// Persistence score per cluster id
    pub persistence: std::collections::HashMap<i32, f32>,
}

impl ClusterAssignment {
    /// Persistence of a cluster, 0.0 when unknown (noise has no persistence)
    pub fn persistence_of(&self, cluster: i32) -> f32 {
        self.persistence.get(&cluster).copied().unwrap_or(0.0)
    }

    /// Distinct non-noise cluster ids, ascending
    pub fn cluster_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .labels
            .iter()
            .copied()
            .filter(|&l| l != NOISE_LABEL)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn phrase(text: &str, start: usize) -> NounPhrase {
        NounPhrase {
            text: text.to_string(),
            start,
            token_len: text.split_whitespace().count(),
        }
    }

    #[test]
    fn test_batch_error_flag() {
        let batch = TokenBatch::new("a.txt", vec!["hello".into()]);
        assert!(!batch.is_error());

        let batch = batch.with_error("boom");
        assert!(batch.is_error());
        assert_eq!(batch.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_entity_primary_label_is_sorted_first() {
        let mut entity = Entity::new("Acme", "Organization", 0.9, 0, phrase("Acme", 0));
        entity.labels.insert("Company".to_string());

        // BTreeSet keeps labels sorted, so the primary label is stable
        assert_eq!(entity.primary_label(), "Company");
    }

    #[test]
    fn test_pair_key_ignores_signals() {
        let e1 = Entity::new("Acme", "Organization", 0.9, 0, phrase("Acme", 0));
        let e2 = Entity::new("Globex", "Organization", 0.8, 14, phrase("Globex", 14));

        let mut a = EntityPair::new(e1.clone(), e2.clone(), "Acme acquired Globex.", 0);
        let b = EntityPair::new(e1, e2, "Acme acquired Globex.", 0);

        a.signals.record_attention(0.5, 0.6, 0.54);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_self_pair_detection() {
        let np = phrase("the company", 0);
        let e1 = Entity::new("company", "Organization", 0.9, 4, np.clone());
        let e2 = Entity::new("company", "Organization", 0.8, 4, np);

        let pair = EntityPair::new(e1, e2, "the company grew", 0);
        assert!(pair.is_self_pair());
    }

    #[test]
    fn test_trimmed_pair_strips_signals() {
        let e1 = Entity::new("Acme", "Organization", 0.9, 0, phrase("Acme", 0));
        let e2 = Entity::new("Globex", "Organization", 0.8, 14, phrase("Globex", 14));

        let mut pair = EntityPair::new(e1, e2, "Acme acquired Globex.", 0);
        pair.signals.record_attention(0.5, 0.6, 0.54);
        pair.signals.record_embeddings(vec![0.1], vec![0.2]);

        let trimmed = pair.trimmed();
        let json = serde_json::to_string(&trimmed).unwrap();
        assert!(!json.contains("attention"));
        assert!(!json.contains("embedding"));
    }

    #[test]
    fn test_event_state_source_follows_payload() {
        let triple = Triple::new(
            "Acme Corp",
            "Organization",
            "acquired",
            "action",
            "Globex",
            "Organization",
            "Acme Corp acquired Globex.",
            "a.txt",
            0.8,
        );

        let state = EventState::graph(triple);
        assert_eq!(state.event_type, EventType::Graph);
        assert_eq!(state.source, "a.txt");
    }

    #[test]
    fn test_cluster_assignment_ids_exclude_noise() {
        let assignment = ClusterAssignment {
            labels: vec![0, NOISE_LABEL, 1, 0, NOISE_LABEL],
            persistence: [(0, 0.3), (1, 0.1)].into_iter().collect(),
        };

        assert_eq!(assignment.cluster_ids(), vec![0, 1]);
        assert_eq!(assignment.persistence_of(NOISE_LABEL), 0.0);
        assert!((assignment.persistence_of(0) - 0.3).abs() < f32::EPSILON);
    }
}
