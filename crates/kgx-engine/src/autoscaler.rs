//! Auto-scaler
//!
//! Starts worker loops for every registered engine, within the resource
//! manager's ceiling. Requests beyond the ceiling fail loudly rather than
//! being truncated. Once running, the scaler polls once per second until
//! the shared termination event is set or every worker has completed,
//! then sets the termination event itself so completion propagates.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use kgx_core::{KgxError, Result};

use crate::engine::{EngineHandles, ExtractionEngine};
use crate::resources::ResourceManager;
use crate::termination::Termination;

/// Poll interval for the supervision loop
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One registered engine and its requested worker count
struct Registration {
    engine: Arc<ExtractionEngine>,
    workers: usize,
}

/// Starts and supervises engines within the permitted concurrency
pub struct AutoScaler {
    manager: Arc<ResourceManager>,
    termination: Termination,
    registrations: Vec<Registration>,
}

impl AutoScaler {
    pub fn new(manager: Arc<ResourceManager>) -> Self {
        Self {
            manager,
            termination: Termination::new(),
            registrations: Vec::new(),
        }
    }

    /// The shared termination event.
    ///
    /// Engines built with this termination stop together.
    pub fn termination(&self) -> &Termination {
        &self.termination
    }

    /// Register an engine with its requested worker count
    pub fn register(&mut self, engine: Arc<ExtractionEngine>, workers: usize) {
        self.registrations.push(Registration { engine, workers });
    }

    /// Total workers requested across all registered engines
    pub fn requested_workers(&self) -> usize {
        self.registrations.iter().map(|r| r.workers).sum()
    }

    /// Start every registered engine and supervise until completion.
    ///
    /// Fails loudly when the request exceeds the allowed ceiling; nothing
    /// is started in that case.
    pub async fn run(&self) -> Result<()> {
        let requested = self.requested_workers();
        let allowed = self.manager.allowed();

        if requested > allowed {
            error!(
                requested,
                allowed,
                "requested workers exceed the permitted ceiling, refusing to start"
            );
            return Err(KgxError::Resource(format!(
                "requested {requested} workers but only {allowed} are allowed"
            )));
        }

        info!(
            engines = self.registrations.len(),
            requested,
            allowed,
            "auto-scaler starting engines"
        );

        let mut handles: Vec<EngineHandles> = Vec::new();
        for registration in &self.registrations {
            handles.push(registration.engine.start(registration.workers));
        }

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            poll.tick().await;

            if self.termination.is_requested() {
                break;
            }
            if handles.iter().all(EngineHandles::workers_finished) {
                info!("all worker tasks completed");
                break;
            }
        }

        // Propagate completion upward: listeners and any remaining
        // workers observe the same event
        self.termination.request();

        for engine_handles in handles {
            engine_handles.join().await;
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::FixedProbe;
    use kgx_core::{EngineConfig, LexiconModel};

    fn manager(max: usize) -> Arc<ResourceManager> {
        Arc::new(ResourceManager::new(
            1,
            max,
            Arc::new(FixedProbe { cpu: 10.0, memory: 10.0 }),
        ))
    }

    fn engine(termination: Termination) -> Arc<ExtractionEngine> {
        let mut model = LexiconModel::empty();
        model.add_term("Acme Corp", "Organization", vec![]);
        ExtractionEngine::builder(EngineConfig::default(), Arc::new(model))
            .termination(termination)
            .build()
    }

    #[tokio::test]
    async fn test_overcommit_fails_loudly() {
        let mut scaler = AutoScaler::new(manager(2));
        let engine = engine(scaler.termination().clone());
        scaler.register(engine, 5);

        let result = scaler.run().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_completes_when_input_closes() {
        let mut scaler = AutoScaler::new(manager(4));
        let engine = engine(scaler.termination().clone());
        scaler.register(engine.clone(), 2);

        // No input at all: close immediately so workers drain and finish
        engine.close_input();

        tokio::time::timeout(Duration::from_secs(10), scaler.run())
            .await
            .expect("scaler should finish")
            .expect("scaler should not error");

        assert!(scaler.termination().is_requested());
    }

    #[tokio::test]
    async fn test_requested_workers_sums_registrations() {
        let mut scaler = AutoScaler::new(manager(8));
        let e1 = engine(scaler.termination().clone());
        let e2 = engine(scaler.termination().clone());
        scaler.register(e1, 3);
        scaler.register(e2, 2);

        assert_eq!(scaler.requested_workers(), 5);
    }
}
