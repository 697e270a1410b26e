//! KGX Score - Statistical pair scoring
//!
//! Two pipeline stages live here:
//! - Attention scoring: per-entity relevance from the recognition model's
//!   final self-attention layer, combined into a pair score
//! - Embedding extraction: context vectors per (entity, sentence) with a
//!   batch-fitted low-dimensional projection

pub mod attention;
pub mod embedding;

pub use attention::{harmonic_pair_score, AttentionScorer};
pub use embedding::{BatchEmbeddings, EmbeddingExtractor, Projector};
