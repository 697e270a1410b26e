//! Worker loop
//!
//! Each worker pulls one envelope at a time from the shared input queue,
//! runs the pipeline with retry, pushes resulting states onto the bounded
//! state queue, and throttles its publish rate. A validation failure or an
//! exhausted retry budget terminates every worker, not just this one.

use std::sync::Arc;

use tracing::{debug, error, warn};

use kgx_core::{BatchEnvelope, TokenBatch};

use crate::engine::ExtractionEngine;

/// What one queue pull produced
enum Pull {
    Item(BatchEnvelope),
    Closed,
    Terminated,
}

pub(crate) async fn worker_loop(engine: Arc<ExtractionEngine>, worker_id: usize) {
    // Fail fast: a misconfigured engine never pulls work
    if let Err(e) = engine.validate() {
        error!(
            engine = engine.name(),
            worker = worker_id,
            error = %e,
            "engine validation failed, terminating"
        );
        engine.termination().request();
        return;
    }

    let throttle_limit = engine.config().message_throttle_limit;
    let mut since_throttle = 0usize;

    loop {
        if engine.termination().is_requested() {
            break;
        }

        let pulled = pull_one(&engine).await;
        let batch = match pulled {
            Pull::Terminated => break,
            Pull::Closed => {
                debug!(worker = worker_id, "input stream closed");
                break;
            }
            Pull::Item(BatchEnvelope::FileDone { source }) => {
                debug!(worker = worker_id, source = %source, "file complete");
                continue;
            }
            Pull::Item(BatchEnvelope::Batch(batch)) => batch,
        };

        // Data error from the source: drop the batch and stop the world,
        // nothing useful will follow from that source
        if let Some(source_error) = &batch.error {
            error!(
                engine = engine.name(),
                worker = worker_id,
                source = %batch.source,
                error = %source_error,
                "error batch received, requesting termination"
            );
            engine.report().error_batch_dropped();
            engine.termination().request();
            return;
        }

        if !process_with_retry(&engine, worker_id, &batch).await {
            return;
        }

        engine.report().batch_processed();

        since_throttle += 1;
        if since_throttle >= throttle_limit {
            tokio::time::sleep(engine.config().message_throttle_delay()).await;
            since_throttle = 0;
        }
    }

    debug!(worker = worker_id, "worker loop exited");
}

/// Block on the shared queue until an envelope, closure, or termination.
///
/// Termination wins over a ready envelope: once requested, no further
/// batch is pulled.
async fn pull_one(engine: &Arc<ExtractionEngine>) -> Pull {
    let mut rx = engine.input_rx().lock().await;
    tokio::select! {
        biased;
        _ = engine.termination().wait() => Pull::Terminated,
        envelope = rx.recv() => match envelope {
            Some(envelope) => Pull::Item(envelope),
            None => Pull::Closed,
        },
    }
}

/// Run the pipeline for one batch with the configured retry budget.
///
/// Returns false when the worker must exit because the final attempt
/// failed and termination was requested. States reach the queue only for
/// fully completed runs.
async fn process_with_retry(
    engine: &Arc<ExtractionEngine>,
    worker_id: usize,
    batch: &TokenBatch,
) -> bool {
    let max_retries = engine.config().max_retries;

    for attempt in 1..=max_retries {
        match engine.process_batch(batch).await {
            Ok(states) => {
                for state in states {
                    if engine.state_tx().send(state).await.is_err() {
                        warn!(
                            worker = worker_id,
                            "state listener stopped, dropping remaining states"
                        );
                        return true;
                    }
                    engine.report().event_published();
                }
                return true;
            }
            Err(e) if attempt < max_retries => {
                warn!(
                    worker = worker_id,
                    source = %batch.source,
                    attempt,
                    error = %e,
                    "pipeline attempt failed, retrying"
                );
                engine.report().retry();
                tokio::time::sleep(engine.config().retry_interval()).await;
            }
            Err(e) => {
                error!(
                    engine = engine.name(),
                    worker = worker_id,
                    source = %batch.source,
                    error = %e,
                    "pipeline failed after final attempt, terminating"
                );
                engine.report().batch_failed();
                engine.termination().request();
                return false;
            }
        }
    }

    // max_retries >= 1 is enforced by validation
    true
}
