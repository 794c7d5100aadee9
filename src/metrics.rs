//! Per-cycle counters delivered to the host.
//!
//! The engine reports one [`CycleReport`] per completed model cycle through
//! the [`MetricsSink`] trait; hosts forward it to whatever metrics or logging
//! stack they run. The in-memory sink aggregates counters for embedded use
//! and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::registry::ModelName;

/// Counters for one completed model cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Model the cycle processed.
    pub model: ModelName,
    /// Records fetched from the standardized stage.
    pub fetched: usize,
    /// Records promoted to the keyed stage.
    pub keyed: usize,
    /// Records left in place because no candidate could be extracted.
    pub skipped: usize,
    /// Records promoted with more than one owner.
    pub conflicts: usize,
    /// Fresh references minted for previously unseen candidates.
    pub minted: usize,
    /// Wall-clock duration of the cycle.
    pub duration: Duration,
    /// Batch size proposed for the model's next cycle.
    pub next_batch_size: usize,
}

/// Receives per-cycle counters.
pub trait MetricsSink: Send + Sync {
    /// Called once per completed model cycle.
    fn record_cycle(&self, report: &CycleReport);
}

/// Sink that discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record_cycle(&self, _report: &CycleReport) {}
}

/// Sink aggregating totals in atomics, with the full report stream retained
/// for inspection.
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    cycles: AtomicU64,
    keyed: AtomicU64,
    skipped: AtomicU64,
    conflicts: AtomicU64,
    minted: AtomicU64,
    reports: Mutex<Vec<CycleReport>>,
}

impl InMemoryMetricsSink {
    /// Create a new empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed cycles observed.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Total records promoted to the keyed stage.
    #[must_use]
    pub fn keyed(&self) -> u64 {
        self.keyed.load(Ordering::Relaxed)
    }

    /// Total records skipped as unresolvable.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Total records promoted with conflicting owners.
    #[must_use]
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Total fresh references minted.
    #[must_use]
    pub fn minted(&self) -> u64 {
        self.minted.load(Ordering::Relaxed)
    }

    /// Copy of every report received so far.
    #[must_use]
    pub fn reports(&self) -> Vec<CycleReport> {
        match self.reports.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record_cycle(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.keyed.fetch_add(report.keyed as u64, Ordering::Relaxed);
        self.skipped
            .fetch_add(report.skipped as u64, Ordering::Relaxed);
        self.conflicts
            .fetch_add(report.conflicts as u64, Ordering::Relaxed);
        self.minted
            .fetch_add(report.minted as u64, Ordering::Relaxed);
        if let Ok(mut guard) = self.reports.lock() {
            guard.push(report.clone());
        }
    }
}
