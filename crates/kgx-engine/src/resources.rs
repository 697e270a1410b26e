//! Resource manager
//!
//! Tracks how many workers the host can sustain. Utilization comes from a
//! probe trait so tests can inject fixed readings; the Linux probe reads
//! procfs. Crossing 90% utilization shrinks the allowed ceiling, calm
//! readings grow it back toward the configured maximum.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

/// Utilization above which the ceiling shrinks
const UTILIZATION_LIMIT_PERCENT: f32 = 90.0;

/// Host utilization readings, in percent
pub trait UtilizationProbe: Send + Sync {
    fn cpu_percent(&self) -> f32;
    fn memory_percent(&self) -> f32;
}

/// Probe backed by procfs; reads report 0.0 where unavailable
#[derive(Debug, Default)]
pub struct ProcFsProbe;

impl UtilizationProbe for ProcFsProbe {
    fn cpu_percent(&self) -> f32 {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f32;

        std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|content| {
                content
                    .split_whitespace()
                    .next()
                    .and_then(|load| load.parse::<f32>().ok())
            })
            .map(|load| (load / cores) * 100.0)
            .unwrap_or(0.0)
    }

    fn memory_percent(&self) -> f32 {
        let Ok(content) = std::fs::read_to_string("/proc/meminfo") else {
            return 0.0;
        };

        let field = |name: &str| -> Option<f32> {
            content
                .lines()
                .find(|line| line.starts_with(name))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<f32>().ok())
        };

        match (field("MemTotal:"), field("MemAvailable:")) {
            (Some(total), Some(available)) if total > 0.0 => {
                ((total - available) / total) * 100.0
            }
            _ => 0.0,
        }
    }
}

/// Fixed readings for tests
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe {
    pub cpu: f32,
    pub memory: f32,
}

impl UtilizationProbe for FixedProbe {
    fn cpu_percent(&self) -> f32 {
        self.cpu
    }

    fn memory_percent(&self) -> f32 {
        self.memory
    }
}

/// Computes the permitted worker concurrency
pub struct ResourceManager {
    min_allowed: usize,
    max_allowed: usize,
    ceiling: AtomicUsize,
    probe: Arc<dyn UtilizationProbe>,
}

impl ResourceManager {
    /// Create a manager; the ceiling starts at the maximum
    pub fn new(min_allowed: usize, max_allowed: usize, probe: Arc<dyn UtilizationProbe>) -> Self {
        let min_allowed = min_allowed.max(1);
        let max_allowed = max_allowed.max(min_allowed);
        Self {
            min_allowed,
            max_allowed,
            ceiling: AtomicUsize::new(max_allowed),
            probe,
        }
    }

    /// Manager with the procfs probe
    pub fn with_host_probe(min_allowed: usize, max_allowed: usize) -> Self {
        Self::new(min_allowed, max_allowed, Arc::new(ProcFsProbe))
    }

    pub fn max_allowed_workers(&self) -> usize {
        self.max_allowed
    }

    pub fn min_allowed_workers(&self) -> usize {
        self.min_allowed
    }

    /// The current worker ceiling
    pub fn allowed(&self) -> usize {
        self.ceiling.load(Ordering::SeqCst)
    }

    /// Sample utilization and move the ceiling.
    ///
    /// Above 90% on either axis the ceiling halves (never below the
    /// minimum); otherwise it creeps back up toward the maximum. Returns
    /// the resulting desired worker count.
    pub fn desired_workers(&self) -> usize {
        let cpu = self.probe.cpu_percent();
        let memory = self.probe.memory_percent();
        let current = self.allowed();

        let next = if cpu > UTILIZATION_LIMIT_PERCENT || memory > UTILIZATION_LIMIT_PERCENT {
            let shrunk = (current / 2).max(self.min_allowed);
            warn!(cpu, memory, ceiling = shrunk, "utilization high, shrinking worker ceiling");
            shrunk
        } else {
            let grown = (current + 1).min(self.max_allowed);
            if grown != current {
                debug!(cpu, memory, ceiling = grown, "utilization normal, growing worker ceiling");
            }
            grown
        };

        self.ceiling.store(next, Ordering::SeqCst);
        next
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_starts_at_max() {
        let manager = ResourceManager::new(1, 8, Arc::new(FixedProbe { cpu: 10.0, memory: 10.0 }));
        assert_eq!(manager.allowed(), 8);
        assert_eq!(manager.max_allowed_workers(), 8);
        assert_eq!(manager.min_allowed_workers(), 1);
    }

    #[test]
    fn test_high_cpu_shrinks_ceiling() {
        let manager = ResourceManager::new(1, 8, Arc::new(FixedProbe { cpu: 95.0, memory: 10.0 }));
        assert_eq!(manager.desired_workers(), 4);
        assert_eq!(manager.desired_workers(), 2);
        assert_eq!(manager.desired_workers(), 1);
        // Never below the minimum
        assert_eq!(manager.desired_workers(), 1);
    }

    #[test]
    fn test_high_memory_shrinks_ceiling() {
        let manager = ResourceManager::new(2, 8, Arc::new(FixedProbe { cpu: 10.0, memory: 99.0 }));
        assert_eq!(manager.desired_workers(), 4);
        assert_eq!(manager.desired_workers(), 2);
        assert_eq!(manager.desired_workers(), 2);
    }

    #[test]
    fn test_calm_utilization_grows_back() {
        let manager = ResourceManager::new(1, 8, Arc::new(FixedProbe { cpu: 95.0, memory: 10.0 }));
        manager.desired_workers();
        manager.desired_workers();
        assert_eq!(manager.allowed(), 2);

        let calm = ResourceManager::new(1, 8, Arc::new(FixedProbe { cpu: 10.0, memory: 10.0 }));
        calm.ceiling.store(2, Ordering::SeqCst);
        assert_eq!(calm.desired_workers(), 3);
        assert_eq!(calm.desired_workers(), 4);
    }

    #[test]
    fn test_bounds_normalized() {
        let manager = ResourceManager::new(0, 0, Arc::new(FixedProbe { cpu: 0.0, memory: 0.0 }));
        assert_eq!(manager.min_allowed_workers(), 1);
        assert_eq!(manager.max_allowed_workers(), 1);
    }

    #[test]
    fn test_procfs_probe_does_not_panic() {
        let probe = ProcFsProbe;
        let cpu = probe.cpu_percent();
        let memory = probe.memory_percent();
        assert!(cpu >= 0.0);
        assert!((0.0..=100.0).contains(&memory) || memory == 0.0);
    }
}
