//! End-to-end engine tests: batches in, events out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use kgx_core::{
    BatchEnvelope, EngineConfig, EventState, EventType, InferenceOutput, KgxError, LanguageModel,
    LexiconModel, ParseOutput, Result, Token, TokenBatch, Triple,
};
use kgx_engine::{AutoScaler, ExtractionEngine, FixedProbe, ResourceManager, Subscriber};

// ============================================================================
// Helpers
// ============================================================================

struct TripleCollector {
    triples: Arc<Mutex<Vec<Triple>>>,
}

#[async_trait]
impl Subscriber for TripleCollector {
    async fn handle_event(&self, state: &EventState) -> Result<()> {
        if let kgx_core::EventPayload::Graph(triple) = &state.payload {
            self.triples.lock().await.push(triple.clone());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "triple-collector"
    }
}

/// Fails inference a fixed number of times before delegating
struct FlakyModel {
    inner: LexiconModel,
    failures_left: AtomicUsize,
}

impl FlakyModel {
    fn new(inner: LexiconModel, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
        }
    }
}

impl LanguageModel for FlakyModel {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        self.inner.tokenize(text)
    }

    fn infer(&self, text: &str, tokens: &[Token]) -> Result<InferenceOutput> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(KgxError::Model("transient inference failure".to_string()));
        }
        self.inner.infer(text, tokens)
    }

    fn parse(&self, text: &str) -> Result<ParseOutput> {
        self.inner.parse(text)
    }

    fn hidden_dim(&self) -> usize {
        self.inner.hidden_dim()
    }

    fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }
}

fn two_org_model() -> LexiconModel {
    let mut model = LexiconModel::empty();
    model.add_term("Acme Corp", "Organization", vec![]);
    model.add_term("Globex", "Organization", vec![]);
    model
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        num_workers: 1,
        max_retries: 3,
        retry_interval_ms: 10,
        message_throttle_delay_ms: 1,
        enable_filtering: false,
        ..Default::default()
    }
}

fn manager() -> Arc<ResourceManager> {
    Arc::new(ResourceManager::new(
        1,
        8,
        Arc::new(FixedProbe {
            cpu: 10.0,
            memory: 10.0,
        }),
    ))
}

async fn run_to_completion(
    engine: Arc<ExtractionEngine>,
    scaler: AutoScaler,
) -> Arc<ExtractionEngine> {
    tokio::time::timeout(Duration::from_secs(30), scaler.run())
        .await
        .expect("auto-scaler should finish")
        .expect("auto-scaler should not error");
    engine
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_single_batch_yields_single_triple() {
    let mut scaler = AutoScaler::new(manager());
    let engine = ExtractionEngine::builder(fast_config(), Arc::new(two_org_model()))
        .termination(scaler.termination().clone())
        .build();

    let triples = Arc::new(Mutex::new(Vec::new()));
    engine
        .subscribe(
            EventType::Graph,
            Arc::new(TripleCollector {
                triples: triples.clone(),
            }),
        )
        .await;

    let producer = engine.producer().unwrap();
    producer
        .send(BatchEnvelope::Batch(TokenBatch::new(
            "a.txt",
            vec!["Acme Corp acquired Globex in Paris.".to_string()],
        )))
        .await
        .unwrap();
    producer
        .send(BatchEnvelope::FileDone {
            source: "a.txt".to_string(),
        })
        .await
        .unwrap();
    drop(producer);
    engine.close_input();

    scaler.register(engine.clone(), 1);
    let engine = run_to_completion(engine, scaler).await;

    let collected = triples.lock().await;
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].subject, "Acme Corp");
    assert_eq!(collected[0].predicate, "acquired");
    assert_eq!(collected[0].object, "Globex");
    assert_eq!(collected[0].source, "a.txt");

    let snapshot = engine.report().snapshot();
    assert_eq!(snapshot.batches_processed, 1);
    assert_eq!(snapshot.triples_emitted, 1);
}

#[tokio::test]
async fn test_error_batch_terminates_without_triples() {
    let mut scaler = AutoScaler::new(manager());
    let engine = ExtractionEngine::builder(fast_config(), Arc::new(two_org_model()))
        .termination(scaler.termination().clone())
        .build();

    let triples = Arc::new(Mutex::new(Vec::new()));
    engine
        .subscribe(
            EventType::Graph,
            Arc::new(TripleCollector {
                triples: triples.clone(),
            }),
        )
        .await;

    let producer = engine.producer().unwrap();
    producer
        .send(BatchEnvelope::Batch(
            TokenBatch::new("a.txt", vec!["irrelevant".to_string()]).with_error("boom"),
        ))
        .await
        .unwrap();
    // A good batch behind the error batch: termination must prevent it
    // from ever being pulled
    producer
        .send(BatchEnvelope::Batch(TokenBatch::new(
            "a.txt",
            vec!["Acme Corp acquired Globex.".to_string()],
        )))
        .await
        .unwrap();
    drop(producer);
    engine.close_input();

    scaler.register(engine.clone(), 1);
    let engine = run_to_completion(engine, scaler).await;

    assert!(engine.termination().is_requested());
    assert!(triples.lock().await.is_empty());

    let snapshot = engine.report().snapshot();
    assert_eq!(snapshot.error_batches_dropped, 1);
    assert_eq!(snapshot.batches_processed, 0);
    assert_eq!(snapshot.triples_emitted, 0);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let mut scaler = AutoScaler::new(manager());
    // Two failures, three attempts allowed
    let model = FlakyModel::new(two_org_model(), 2);
    let engine = ExtractionEngine::builder(fast_config(), Arc::new(model))
        .termination(scaler.termination().clone())
        .build();

    let triples = Arc::new(Mutex::new(Vec::new()));
    engine
        .subscribe(
            EventType::Graph,
            Arc::new(TripleCollector {
                triples: triples.clone(),
            }),
        )
        .await;

    let producer = engine.producer().unwrap();
    producer
        .send(BatchEnvelope::Batch(TokenBatch::new(
            "a.txt",
            vec!["Acme Corp acquired Globex.".to_string()],
        )))
        .await
        .unwrap();
    drop(producer);
    engine.close_input();

    scaler.register(engine.clone(), 1);
    let engine = run_to_completion(engine, scaler).await;

    assert_eq!(triples.lock().await.len(), 1);
    let snapshot = engine.report().snapshot();
    assert_eq!(snapshot.retries, 2);
    assert_eq!(snapshot.batches_processed, 1);
}

#[tokio::test]
async fn test_exhausted_retries_terminate_engine() {
    let mut scaler = AutoScaler::new(manager());
    // More failures than attempts
    let model = FlakyModel::new(two_org_model(), 10);
    let engine = ExtractionEngine::builder(fast_config(), Arc::new(model))
        .termination(scaler.termination().clone())
        .build();

    let producer = engine.producer().unwrap();
    producer
        .send(BatchEnvelope::Batch(TokenBatch::new(
            "a.txt",
            vec!["Acme Corp acquired Globex.".to_string()],
        )))
        .await
        .unwrap();
    drop(producer);
    engine.close_input();

    scaler.register(engine.clone(), 1);
    let engine = run_to_completion(engine, scaler).await;

    assert!(engine.termination().is_requested());
    let snapshot = engine.report().snapshot();
    assert_eq!(snapshot.batches_failed, 1);
    assert_eq!(snapshot.triples_emitted, 0);
}

#[tokio::test]
async fn test_misconfigured_engine_fails_fast() {
    let mut scaler = AutoScaler::new(manager());
    // Empty model: validation refuses to start work
    let engine = ExtractionEngine::builder(fast_config(), Arc::new(LexiconModel::empty()))
        .termination(scaler.termination().clone())
        .build();

    let producer = engine.producer().unwrap();
    producer
        .send(BatchEnvelope::Batch(TokenBatch::new(
            "a.txt",
            vec!["Acme Corp acquired Globex.".to_string()],
        )))
        .await
        .unwrap();
    drop(producer);
    engine.close_input();

    scaler.register(engine.clone(), 2);
    let engine = run_to_completion(engine, scaler).await;

    assert!(engine.termination().is_requested());
    assert_eq!(engine.report().snapshot().batches_processed, 0);
}

#[tokio::test]
async fn test_states_drained_before_listener_exits() {
    // Termination is requested by the scaler as soon as workers finish;
    // every state the worker queued must still reach subscribers.
    let mut scaler = AutoScaler::new(manager());
    let engine = ExtractionEngine::builder(fast_config(), Arc::new(two_org_model()))
        .termination(scaler.termination().clone())
        .build();

    let triples = Arc::new(Mutex::new(Vec::new()));
    engine
        .subscribe(
            EventType::Graph,
            Arc::new(TripleCollector {
                triples: triples.clone(),
            }),
        )
        .await;

    let producer = engine.producer().unwrap();
    for i in 0..5 {
        producer
            .send(BatchEnvelope::Batch(TokenBatch::new(
                format!("file-{i}.txt"),
                vec!["Acme Corp acquired Globex.".to_string()],
            )))
            .await
            .unwrap();
    }
    drop(producer);
    engine.close_input();

    scaler.register(engine.clone(), 2);
    run_to_completion(engine, scaler).await;

    assert_eq!(triples.lock().await.len(), 5);
}

#[tokio::test]
async fn test_streaming_batches_flow_like_documents() {
    let mut scaler = AutoScaler::new(manager());
    let engine = ExtractionEngine::builder(fast_config(), Arc::new(two_org_model()))
        .termination(scaler.termination().clone())
        .build();

    let triples = Arc::new(Mutex::new(Vec::new()));
    engine
        .subscribe(
            EventType::Graph,
            Arc::new(TripleCollector {
                triples: triples.clone(),
            }),
        )
        .await;

    let producer = engine.producer().unwrap();
    producer
        .send(BatchEnvelope::Batch(
            TokenBatch::new("stream-1", vec!["Acme Corp acquired Globex.".to_string()])
                .with_streaming(true),
        ))
        .await
        .unwrap();
    drop(producer);
    engine.close_input();

    scaler.register(engine.clone(), 1);
    run_to_completion(engine, scaler).await;

    assert_eq!(triples.lock().await.len(), 1);
}
