//! Adaptive batch sizing.
//!
//! A proportional feedback controller, not a learned model: the next cycle's
//! fetch size is proposed from the previous cycle's duration, record count,
//! and memory footprint. Determinism and bounded output are the hard
//! requirements - whatever the inputs, the proposal stays inside the
//! configured `[floor, ceiling]`.

use std::time::Duration;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct BatchSizerConfig {
    /// Smallest batch size ever proposed.
    pub floor: usize,
    /// Largest batch size ever proposed.
    pub ceiling: usize,
    /// Cycle duration the controller steers toward.
    pub target_cycle: Duration,
    /// Memory footprint budget per cycle.
    pub memory_budget_bytes: u64,
    /// Percentage grown per under-target cycle (e.g. 25 = +25%).
    pub growth_percent: usize,
    /// Percentage shrunk per over-target cycle (e.g. 50 = -50%).
    pub shrink_percent: usize,
}

impl Default for BatchSizerConfig {
    fn default() -> Self {
        Self {
            floor: 16,
            ceiling: 4096,
            target_cycle: Duration::from_secs(2),
            memory_budget_bytes: 256 * 1024 * 1024,
            growth_percent: 25,
            shrink_percent: 50,
        }
    }
}

/// Observed outcome of one completed cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleSample {
    /// Wall-clock duration of the cycle.
    pub duration: Duration,
    /// Records fetched in the cycle.
    pub record_count: usize,
    /// Approximate memory footprint of the fetched batch.
    pub memory_bytes: u64,
}

/// Proportional batch-size controller.
#[derive(Debug)]
pub struct BatchSizer {
    config: BatchSizerConfig,
    current: usize,
}

impl BatchSizer {
    /// Creates a controller starting at the floor.
    ///
    /// Degenerate configs are sanitized: the floor is at least 1, the
    /// ceiling at least the floor, and shrink is capped below 100% so the
    /// proposal can never collapse to zero.
    #[must_use]
    pub fn new(config: BatchSizerConfig) -> Self {
        let mut config = config;
        config.floor = config.floor.max(1);
        config.ceiling = config.ceiling.max(config.floor);
        config.shrink_percent = config.shrink_percent.min(90);
        let current = config.floor;
        Self { config, current }
    }

    /// The size the controller currently proposes.
    #[must_use]
    pub const fn current(&self) -> usize {
        self.current
    }

    /// Feeds the previous cycle's observation and returns the next proposal.
    ///
    /// Grows when the full batch finished under the target duration with
    /// memory under budget; shrinks when either threshold was exceeded;
    /// holds otherwise. An empty cycle carries no throughput signal and
    /// holds the previous proposal. Zero durations (clock anomalies) simply
    /// read as fast cycles; the clamp keeps the output bounded regardless.
    pub fn next_batch_size(&mut self, last: &CycleSample) -> usize {
        if last.record_count == 0 {
            return self.current;
        }

        let over_time = last.duration > self.config.target_cycle;
        let over_memory = last.memory_bytes > self.config.memory_budget_bytes;
        let batch_was_full = last.record_count >= self.current;

        let proposed = if over_time || over_memory {
            let cut = self.current.saturating_mul(self.config.shrink_percent) / 100;
            self.current.saturating_sub(cut.max(1))
        } else if batch_was_full {
            let gain = self.current.saturating_mul(self.config.growth_percent) / 100;
            self.current.saturating_add(gain.max(1))
        } else {
            self.current
        };

        self.current = proposed.clamp(self.config.floor, self.config.ceiling);
        self.current
    }
}
