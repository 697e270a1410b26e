//! KGX Engine - Concurrent extraction orchestration
//!
//! The engine worker pool pulls token batches from a shared queue, runs
//! the extraction pipeline (chunk, recognize, pair, score, embed,
//! cluster/filter, resolve), and publishes surviving triples as typed
//! events. A dedicated state listener fans events out to subscribers, and
//! the resource manager / auto-scaler decide how many workers may run.

pub mod autoscaler;
pub mod dispatcher;
pub mod engine;
pub mod listener;
pub mod report;
pub mod resources;
pub mod termination;
pub mod worker;

pub use autoscaler::AutoScaler;
pub use dispatcher::{EventDispatcher, Subscriber};
pub use engine::{EngineCapabilities, EngineHandles, ExtractionEngine};
pub use report::{RunReport, RunReportSnapshot};
pub use resources::{FixedProbe, ProcFsProbe, ResourceManager, UtilizationProbe};
pub use termination::Termination;
