//! Engine assembly
//!
//! One engine instance owns the input queue, the bounded state queue, the
//! pipeline stages, and the subscriber registry. Engine variants are not
//! subclassed; one engine is parameterized by a capability set derived
//! from its configuration.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bitflags::bitflags;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use kgx_cluster::{FilterParams, PairFilter};
use kgx_core::{
    BatchEnvelope, EngineConfig, Entity, EventState, EventType, KgxError, LanguageModel, Result,
    TokenBatch, TrimmedPair, Triple,
};
use kgx_nlp::{
    Chunker, EntityRecognizer, FixedEntityExtractor, FixedPredicateExtractor, PairGenerator,
    PredicateResolver, SynonymLexicon, VerbPhraseResolver,
};
use kgx_score::{AttentionScorer, EmbeddingExtractor};

use crate::dispatcher::{EventDispatcher, Subscriber};
use crate::listener::state_listener;
use crate::report::RunReport;
use crate::termination::Termination;
use crate::worker::worker_loop;

/// Capacity of the shared input queue
const INPUT_QUEUE_CAPACITY: usize = 64;

/// Predicate type assigned to fixed-predicate matches
const FIXED_PREDICATE_TYPE: &str = "fixed";

bitflags! {
    /// Optional engine stages, derived from configuration
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EngineCapabilities: u32 {
        /// Run the cluster/filter state machine
        const FILTERING = 1;
        /// Confine entity detection to the fixed-entity list
        const FIXED_ENTITIES = 1 << 1;
        /// Resolve predicates from the fixed-predicate list
        const FIXED_PREDICATES = 1 << 2;
        /// Skip model attention scoring
        const SKIP_INFERENCE = 1 << 3;
    }
}

impl EngineCapabilities {
    /// Derive the capability set from configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut caps = Self::empty();
        if config.enable_filtering {
            caps |= Self::FILTERING;
        }
        if config.constraint.is_confined_search {
            // Confined searches bypass the recognizer and its attention
            caps |= Self::FIXED_ENTITIES | Self::SKIP_INFERENCE;
        }
        if !config.constraint.fixed_relationships.is_empty() {
            caps |= Self::FIXED_PREDICATES;
        }
        caps
    }
}

/// Tasks spawned by one `start` call
pub struct EngineHandles {
    /// One handle per worker loop
    pub workers: Vec<JoinHandle<()>>,

    /// The state-listener task; `None` when the engine was started before
    pub listener: Option<JoinHandle<()>>,
}

impl EngineHandles {
    /// Whether every worker loop has finished
    pub fn workers_finished(&self) -> bool {
        self.workers.iter().all(|h| h.is_finished())
    }

    /// Await every spawned task
    pub async fn join(self) {
        for handle in self.workers {
            let _ = handle.await;
        }
        if let Some(listener) = self.listener {
            let _ = listener.await;
        }
    }
}

/// Output of the CPU-bound stage run, handed back to the async worker
pub(crate) struct StageOutput {
    /// Surviving pairs, trimmed for the resolver
    pub trimmed: Vec<TrimmedPair>,

    /// Canonical fixed predicate per pair, when fixed-predicate search is on
    pub fixed_predicates: Vec<Option<String>>,

    /// Embedding records to publish as vector events
    pub records: Vec<kgx_core::EmbeddingRecord>,
}

/// Builder for [`ExtractionEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    model: Arc<dyn LanguageModel>,
    resolver: Option<Arc<dyn PredicateResolver>>,
    termination: Option<Termination>,
    synonyms: SynonymLexicon,
}

impl EngineBuilder {
    /// Override the predicate-resolution collaborator
    pub fn resolver(mut self, resolver: Arc<dyn PredicateResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Share a termination signal with other engines
    pub fn termination(mut self, termination: Termination) -> Self {
        self.termination = Some(termination);
        self
    }

    /// Replace the synonym lexicon used for fixed predicates
    pub fn synonyms(mut self, synonyms: SynonymLexicon) -> Self {
        self.synonyms = synonyms;
        self
    }

    pub fn build(self) -> Arc<ExtractionEngine> {
        let model = self.model;
        let config = self.config;
        let capabilities = EngineCapabilities::from_config(&config);

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(VerbPhraseResolver::new(model.clone())));

        let fixed_entities = if config.constraint.fixed_entities.is_empty() {
            None
        } else {
            FixedEntityExtractor::new(&config.constraint.fixed_entities).ok()
        };
        let fixed_predicates = if config.constraint.fixed_relationships.is_empty() {
            None
        } else {
            FixedPredicateExtractor::new(&config.constraint.fixed_relationships, &self.synonyms)
                .ok()
        };

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        // Zero capacity would panic; validate() rejects it as config later
        let (state_tx, state_rx) = mpsc::channel(config.max_state_transitions.max(1));

        let filter = PairFilter::new(FilterParams::from_config(&config));

        Arc::new(ExtractionEngine {
            chunker: Chunker::new(model.clone()),
            recognizer: EntityRecognizer::new(model.clone()),
            pair_generator: PairGenerator::new(model.clone()),
            scorer: AttentionScorer::new(model.clone()),
            embedder: EmbeddingExtractor::new(model.clone(), config.cluster.projection_dim),
            filter,
            fixed_entities,
            fixed_predicates,
            config,
            capabilities,
            model,
            resolver,
            dispatcher: Arc::new(EventDispatcher::new()),
            termination: self.termination.unwrap_or_default(),
            report: Arc::new(RunReport::new()),
            input_tx: StdMutex::new(Some(input_tx)),
            input_rx: Arc::new(AsyncMutex::new(input_rx)),
            state_tx,
            state_rx: StdMutex::new(Some(state_rx)),
        })
    }
}

/// The concurrent entity/relationship extraction engine
pub struct ExtractionEngine {
    config: EngineConfig,
    capabilities: EngineCapabilities,
    model: Arc<dyn LanguageModel>,
    resolver: Arc<dyn PredicateResolver>,
    dispatcher: Arc<EventDispatcher>,
    termination: Termination,
    report: Arc<RunReport>,

    chunker: Chunker,
    recognizer: EntityRecognizer,
    pair_generator: PairGenerator,
    scorer: AttentionScorer,
    embedder: EmbeddingExtractor,
    filter: PairFilter,
    fixed_entities: Option<FixedEntityExtractor>,
    fixed_predicates: Option<FixedPredicateExtractor>,

    input_tx: StdMutex<Option<mpsc::Sender<BatchEnvelope>>>,
    input_rx: Arc<AsyncMutex<mpsc::Receiver<BatchEnvelope>>>,
    state_tx: mpsc::Sender<EventState>,
    state_rx: StdMutex<Option<mpsc::Receiver<EventState>>>,
}

impl ExtractionEngine {
    /// Start building an engine around a shared model
    pub fn builder(config: EngineConfig, model: Arc<dyn LanguageModel>) -> EngineBuilder {
        EngineBuilder {
            config,
            model,
            resolver: None,
            termination: None,
            synonyms: SynonymLexicon::builtin(),
        }
    }

    /// Engine type name used in fatal logs
    pub fn name(&self) -> &'static str {
        "ExtractionEngine"
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    pub fn termination(&self) -> &Termination {
        &self.termination
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub(crate) fn input_rx(&self) -> &Arc<AsyncMutex<mpsc::Receiver<BatchEnvelope>>> {
        &self.input_rx
    }

    pub(crate) fn state_tx(&self) -> &mpsc::Sender<EventState> {
        &self.state_tx
    }

    pub(crate) fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Register a subscriber for an event type.
    ///
    /// Subscribers registered before `start` see every event; later
    /// registrations see events from that point on.
    pub async fn subscribe(&self, event_type: EventType, subscriber: Arc<dyn Subscriber>) {
        self.dispatcher.subscribe(event_type, subscriber).await;
    }

    /// A producer handle for the shared input queue.
    ///
    /// Fails once the input has been closed.
    pub fn producer(&self) -> Result<mpsc::Sender<BatchEnvelope>> {
        self.input_tx
            .lock()
            .map_err(|_| KgxError::Pipeline("input queue lock poisoned".to_string()))?
            .as_ref()
            .cloned()
            .ok_or_else(|| KgxError::Pipeline("input queue already closed".to_string()))
    }

    /// Close the input queue.
    ///
    /// Workers exit after draining what is already enqueued; this is the
    /// whole-stream end sentinel.
    pub fn close_input(&self) {
        if let Ok(mut guard) = self.input_tx.lock() {
            guard.take();
        }
    }

    /// Validate the engine before any work starts.
    ///
    /// A failure here is fatal: workers refuse to run.
    pub fn validate(&self) -> Result<()> {
        self.config
            .validate()
            .map_err(|e| KgxError::Config(e.to_string()))?;

        if !self.model.is_ready() {
            return Err(KgxError::Config("language model is not ready".to_string()));
        }

        if self.capabilities.contains(EngineCapabilities::FIXED_ENTITIES)
            && self.fixed_entities.is_none()
        {
            return Err(KgxError::Config(
                "confined search enabled but fixed-entity extractor unavailable".to_string(),
            ));
        }

        Ok(())
    }

    /// Spawn `n` worker loops and the state listener.
    ///
    /// All workers share the input queue; the listener owns the state
    /// queue receiver. Worker handles finish when the input closes or
    /// termination is requested; the listener finishes on termination or
    /// its safety valve.
    pub fn start(self: &Arc<Self>, n: usize) -> EngineHandles {
        let listener = self.state_rx.lock().ok().and_then(|mut guard| {
            guard.take().map(|rx| {
                let engine = self.clone();
                tokio::spawn(async move {
                    state_listener(engine, rx).await;
                })
            })
        });

        let workers = (0..n)
            .map(|worker_id| {
                let engine = self.clone();
                tokio::spawn(async move {
                    worker_loop(engine, worker_id).await;
                })
            })
            .collect();

        info!(workers = n, "engine started");
        EngineHandles { workers, listener }
    }

    /// Run the pipeline for one batch and return its events.
    ///
    /// CPU-bound stages run on the blocking pool; the async resolver call
    /// happens afterwards. No event is produced unless every stage
    /// completed.
    pub async fn process_batch(self: &Arc<Self>, batch: &TokenBatch) -> Result<Vec<EventState>> {
        let engine = self.clone();
        let owned = batch.clone();
        let stages = tokio::task::spawn_blocking(move || engine.run_stages(&owned))
            .await
            .map_err(|e| KgxError::Pipeline(format!("stage task failed: {e}")))??;

        let triples = if self.capabilities.contains(EngineCapabilities::FIXED_PREDICATES) {
            self.fixed_predicate_triples(&stages, &batch.source)
        } else if stages.trimmed.is_empty() {
            Vec::new()
        } else {
            self.resolver.resolve(&stages.trimmed, &batch.source).await?
        };

        self.report.triples_emitted(triples.len());

        let mut states: Vec<EventState> =
            triples.into_iter().map(EventState::graph).collect();
        states.extend(stages.records.into_iter().map(EventState::vector));

        Ok(states)
    }

    /// Triples for pairs whose sentence carried a fixed-predicate match.
    ///
    /// Matches substitute for resolution and carry full confidence;
    /// unmatched pairs are dropped.
    fn fixed_predicate_triples(&self, stages: &StageOutput, source: &str) -> Vec<Triple> {
        stages
            .trimmed
            .iter()
            .zip(stages.fixed_predicates.iter())
            .filter_map(|(pair, predicate)| {
                predicate.as_ref().map(|predicate| {
                    Triple::new(
                        pair.entity1.text.clone(),
                        pair.entity1.primary_label(),
                        predicate.clone(),
                        FIXED_PREDICATE_TYPE,
                        pair.entity2.text.clone(),
                        pair.entity2.primary_label(),
                        pair.sentence.clone(),
                        source,
                        1.0,
                    )
                })
            })
            .collect()
    }

    /// The synchronous, CPU-bound stage chain for one batch.
    pub(crate) fn run_stages(&self, batch: &TokenBatch) -> Result<StageOutput> {
        let text = batch.text();
        let sentences = self.chunker.split_sentences(&text);
        if sentences.is_empty() {
            return Ok(StageOutput {
                trimmed: Vec::new(),
                fixed_predicates: Vec::new(),
                records: Vec::new(),
            });
        }

        let entities: Vec<Vec<Entity>> =
            if self.capabilities.contains(EngineCapabilities::FIXED_ENTITIES) {
                let extractor = self.fixed_entities.as_ref().ok_or_else(|| {
                    KgxError::Config("confined search without fixed entities".to_string())
                })?;
                let matches = extractor.scan(&sentences);
                let retained = extractor.retained_sentences(&sentences, &matches);
                debug!(
                    retained = retained.len(),
                    total = sentences.len(),
                    "confined search retained sentences"
                );

                let mut per_sentence = extractor.entities(&matches);
                per_sentence.resize(sentences.len(), Vec::new());
                per_sentence
            } else {
                sentences
                    .iter()
                    .map(|sentence| {
                        let windows = self.chunker.windows(sentence);
                        self.recognizer.recognize(sentence, &windows)
                    })
                    .collect::<Result<Vec<_>>>()?
            };

        let mut pairs = self.pair_generator.generate(&sentences, &entities)?;
        self.report.pairs_generated(pairs.len());

        if !self.capabilities.contains(EngineCapabilities::SKIP_INFERENCE) {
            self.scorer.score(&mut pairs)?;
        }

        let mut records = Vec::new();
        if self.capabilities.contains(EngineCapabilities::FILTERING) && !pairs.is_empty() {
            let embeddings = self.embedder.extract(&mut pairs, &batch.source)?;
            records = embeddings.records;
        }

        let pairs = self.filter.run(pairs, seed_from_source(&batch.source))?;
        self.report.pairs_surviving(pairs.len());

        let fixed_predicates: Vec<Option<String>> =
            if self.capabilities.contains(EngineCapabilities::FIXED_PREDICATES) {
                let extractor = self.fixed_predicates.as_ref().ok_or_else(|| {
                    KgxError::Config("fixed predicates configured but extractor unavailable".to_string())
                })?;
                let matches = extractor.scan(&sentences);
                pairs
                    .iter()
                    .map(|pair| {
                        extractor
                            .predicate_for(&matches, pair.sentence_index)
                            .map(|m| m.canonical.clone())
                    })
                    .collect()
            } else {
                vec![None; pairs.len()]
            };

        Ok(StageOutput {
            trimmed: pairs.iter().map(|p| p.trimmed()).collect(),
            fixed_predicates,
            records,
        })
    }
}

/// Stable per-source seed for the noise-sampling RNG
fn seed_from_source(source: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in source.as_bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

// ============================================================================
// Tests
// ============================================================================
