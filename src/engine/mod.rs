//! Association engine.
//!
//! The background orchestrator of the pipeline: a supervising loop discovers
//! registered models, dispatches one cycle job per model into a bounded
//! worker pool, and feeds every completed cycle back into that model's batch
//! sizer. Failures degrade per-model - a model whose cycle errors backs off
//! and retries while every other model keeps flowing.

mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::batch::{BatchSizer, BatchSizerConfig, CycleSample};
use crate::error::LinkageResult;
use crate::index::KeyIndexStore;
use crate::metrics::{CycleReport, MetricsSink};
use crate::registry::{ModelName, ModelRegistry};
use crate::stage::StageStore;

use worker::{run_cycle, CycleStats, WorkerContext};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker slots; models processed concurrently are capped at
    /// this, independent of how many models are registered.
    pub workers: usize,
    /// Sleep between supervisor ticks when no work is eligible.
    pub poll_interval: Duration,
    /// Soft deadline per model cycle; exceeding it is a recoverable failure.
    pub cycle_deadline: Duration,
    /// Mint a fresh canonical reference when every candidate misses the
    /// index. Hosts that mint upstream turn this off and receive zero-owner
    /// keyed records instead.
    pub mint_missing: bool,
    /// Cap on the tick count a failing model backs off between retries.
    pub max_backoff_ticks: u32,
    /// Batch-size controller configuration, one controller per model.
    pub sizer: BatchSizerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(200),
            cycle_deadline: Duration::from_secs(30),
            mint_missing: true,
            max_backoff_ticks: 64,
            sizer: BatchSizerConfig::default(),
        }
    }
}

struct CycleJob {
    model: ModelName,
    batch_size: usize,
}

struct CycleOutcome {
    model: ModelName,
    duration: Duration,
    result: LinkageResult<CycleStats>,
}

/// Per-model supervisor bookkeeping.
struct ModelState {
    sizer: BatchSizer,
    in_flight: bool,
    disabled: bool,
    consecutive_failures: u32,
    backoff_remaining: u32,
}

impl ModelState {
    fn new(config: &BatchSizerConfig) -> Self {
        Self {
            sizer: BatchSizer::new(config.clone()),
            in_flight: false,
            disabled: false,
            consecutive_failures: 0,
            backoff_remaining: 0,
        }
    }
}

/// The running association engine.
///
/// Returned by [`AssociationEngine::start`]; the engine runs until
/// [`shutdown`](AssociationEngine::shutdown) is called or the value is
/// dropped. Shutdown is a graceful drain: in-flight cycles finish their
/// stage transition, no new cycles start, and all threads are joined.
pub struct AssociationEngine {
    shutdown_tx: Option<Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl AssociationEngine {
    /// Starts the engine against the given collaborators.
    pub fn start(
        stage: Arc<dyn StageStore>,
        index: Arc<dyn KeyIndexStore>,
        registry: Arc<dyn ModelRegistry>,
        sink: Arc<dyn MetricsSink>,
        config: EngineConfig,
    ) -> Self {
        let workers = config.workers.max(1);
        let stop = Arc::new(AtomicBool::new(false));

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let (job_tx, job_rx) = bounded::<CycleJob>(workers);
        let (outcome_tx, outcome_rx) = bounded::<CycleOutcome>(workers * 2);

        let mut worker_handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let job_rx: Receiver<CycleJob> = job_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let stop = Arc::clone(&stop);
            let ctx = WorkerContext {
                stage: Arc::clone(&stage),
                index: Arc::clone(&index),
                registry: Arc::clone(&registry),
                cycle_deadline: config.cycle_deadline,
                mint_missing: config.mint_missing,
            };
            let handle = thread::Builder::new()
                .name(format!("linkage-worker-{idx}"))
                .spawn(move || worker_loop(&ctx, &stop, &job_rx, &outcome_tx))
                .expect("failed to spawn linkage worker");
            worker_handles.push(handle);
        }
        // Workers hold the only outcome senders; the supervisor's drain ends
        // when the last worker exits.
        drop(outcome_tx);

        let supervisor_registry = Arc::clone(&registry);
        let supervisor = thread::Builder::new()
            .name("linkage-supervisor".to_string())
            .spawn(move || {
                supervise(
                    &config,
                    &supervisor_registry,
                    &sink,
                    &stop,
                    &shutdown_rx,
                    job_tx,
                    &outcome_rx,
                    worker_handles,
                );
            })
            .expect("failed to spawn linkage supervisor");

        tracing::info!(workers, "association engine started");

        Self {
            shutdown_tx: Some(shutdown_tx),
            supervisor: Some(supervisor),
        }
    }

    /// Stops the engine and waits for the drain to complete.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        // Closing the shutdown channel wakes the supervisor, which stops
        // dispatching, drains in-flight cycles, and joins the workers.
        if let Some(tx) = self.shutdown_tx.take() {
            drop(tx);
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
            tracing::info!("association engine stopped");
        }
    }
}

impl Drop for AssociationEngine {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn worker_loop(
    ctx: &WorkerContext,
    stop: &AtomicBool,
    job_rx: &Receiver<CycleJob>,
    outcome_tx: &Sender<CycleOutcome>,
) {
    while let Ok(job) = job_rx.recv() {
        // A job claimed before shutdown but not yet started is abandoned;
        // its records are untouched and a later run picks them up.
        if stop.load(Ordering::Acquire) {
            continue;
        }
        let started = Instant::now();
        let result = run_cycle(ctx, &job.model, job.batch_size);
        let outcome = CycleOutcome {
            model: job.model,
            duration: started.elapsed(),
            result,
        };
        if outcome_tx.send(outcome).is_err() {
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn supervise(
    config: &EngineConfig,
    registry: &Arc<dyn ModelRegistry>,
    sink: &Arc<dyn MetricsSink>,
    stop: &AtomicBool,
    shutdown_rx: &Receiver<()>,
    job_tx: Sender<CycleJob>,
    outcome_rx: &Receiver<CycleOutcome>,
    worker_handles: Vec<JoinHandle<()>>,
) {
    let workers = config.workers.max(1);
    let mut states: HashMap<ModelName, ModelState> = HashMap::new();
    let mut active = 0usize;

    loop {
        match shutdown_rx.recv_timeout(config.poll_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        while let Ok(outcome) = outcome_rx.try_recv() {
            active = active.saturating_sub(1);
            handle_outcome(&mut states, sink, config, outcome);
        }

        for model in registry.list_models() {
            if active >= workers {
                break;
            }
            let state = states
                .entry(model.clone())
                .or_insert_with(|| ModelState::new(&config.sizer));
            if state.disabled || state.in_flight {
                continue;
            }
            if state.backoff_remaining > 0 {
                state.backoff_remaining -= 1;
                continue;
            }

            let job = CycleJob {
                model: model.clone(),
                batch_size: state.sizer.current(),
            };
            match job_tx.try_send(job) {
                Ok(()) => {
                    state.in_flight = true;
                    active += 1;
                }
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    // Graceful drain: no new cycles, let in-flight ones finish their
    // transition, then join the pool.
    stop.store(true, Ordering::Release);
    drop(job_tx);
    while let Ok(outcome) = outcome_rx.recv() {
        handle_outcome(&mut states, sink, config, outcome);
    }
    for handle in worker_handles {
        let _ = handle.join();
    }
}

fn handle_outcome(
    states: &mut HashMap<ModelName, ModelState>,
    sink: &Arc<dyn MetricsSink>,
    config: &EngineConfig,
    outcome: CycleOutcome,
) {
    let Some(state) = states.get_mut(&outcome.model) else {
        return;
    };
    state.in_flight = false;

    match outcome.result {
        Ok(stats) => {
            state.consecutive_failures = 0;
            state.backoff_remaining = 0;

            // Idle cycles carry no signal; don't move the sizer or spam the
            // sink with them.
            if stats.fetched == 0 {
                return;
            }

            let next_batch_size = state.sizer.next_batch_size(&CycleSample {
                duration: outcome.duration,
                record_count: stats.fetched,
                memory_bytes: stats.memory_bytes,
            });
            let report = CycleReport {
                model: outcome.model.clone(),
                fetched: stats.fetched,
                keyed: stats.keyed,
                skipped: stats.skipped,
                conflicts: stats.conflicts,
                minted: stats.minted,
                duration: outcome.duration,
                next_batch_size,
            };
            sink.record_cycle(&report);
            tracing::debug!(
                model = %outcome.model,
                fetched = stats.fetched,
                keyed = stats.keyed,
                skipped = stats.skipped,
                conflicts = stats.conflicts,
                next_batch_size,
                "cycle complete"
            );
        }
        Err(err) if err.is_config() => {
            // Reported once; the model stays disabled until re-registered
            // with corrected paths and the engine restarted.
            state.disabled = true;
            tracing::error!(model = %outcome.model, error = %err, "model disabled");
        }
        Err(err) => {
            state.consecutive_failures += 1;
            let exponent = state.consecutive_failures.min(16);
            state.backoff_remaining = 2u32
                .saturating_pow(exponent)
                .min(config.max_backoff_ticks);
            tracing::warn!(
                model = %outcome.model,
                error = %err,
                retryable = err.is_retryable(),
                backoff_ticks = state.backoff_remaining,
                "cycle failed"
            );
        }
    }
}
