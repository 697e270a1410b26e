//! KGX NLP - Text preparation and candidate extraction
//!
//! Turns raw batch text into scored candidate entity pairs:
//! - Sentence splitting and fixed-size token windows
//! - Entity recognition with sub-word merge and noun-phrase alignment
//! - Candidate pair generation gated by token distance
//! - Fixed-entity / fixed-predicate constraint extractors
//! - The predicate-resolution seam to the downstream collaborator

pub mod chunker;
pub mod constraint;
pub mod pairs;
pub mod recognizer;
pub mod resolver;

pub use chunker::{Chunker, Sentence, TokenWindow};
pub use constraint::{
    ConstraintMatch, FixedEntityExtractor, FixedPredicateExtractor, PredicateMatch, SynonymLexicon,
};
pub use pairs::{PairGenerator, MAX_PAIR_TOKEN_DISTANCE};
pub use recognizer::EntityRecognizer;
pub use resolver::{PredicateResolver, VerbPhraseResolver};
