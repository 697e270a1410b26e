//! Run accounting
//!
//! Counters for one engine run: batches, pairs, retries, and emissions.
//! Counters are lock-free and safe to bump from any worker.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters for an engine run
#[derive(Debug, Default)]
pub struct RunReport {
    batches_processed: AtomicU64,
    batches_failed: AtomicU64,
    error_batches_dropped: AtomicU64,
    retries: AtomicU64,
    pairs_generated: AtomicU64,
    pairs_surviving: AtomicU64,
    triples_emitted: AtomicU64,
    events_published: AtomicU64,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_processed(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_batch_dropped(&self) {
        self.error_batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pairs_generated(&self, n: usize) {
        self.pairs_generated.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn pairs_surviving(&self, n: usize) {
        self.pairs_surviving.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn triples_emitted(&self, n: usize) {
        self.triples_emitted.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> RunReportSnapshot {
        RunReportSnapshot {
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            error_batches_dropped: self.error_batches_dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            pairs_generated: self.pairs_generated.load(Ordering::Relaxed),
            pairs_surviving: self.pairs_surviving.load(Ordering::Relaxed),
            triples_emitted: self.triples_emitted.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
        }
    }
}

/// Immutable counter snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReportSnapshot {
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub error_batches_dropped: u64,
    pub retries: u64,
    pub pairs_generated: u64,
    pub pairs_surviving: u64,
    pub triples_emitted: u64,
    pub events_published: u64,
}

impl RunReportSnapshot {
    /// Fraction of generated pairs that survived filtering
    pub fn survival_rate(&self) -> f32 {
        if self.pairs_generated == 0 {
            0.0
        } else {
            self.pairs_surviving as f32 / self.pairs_generated as f32
        }
    }
}
