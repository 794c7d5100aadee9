//! Per-model cycle execution.
//!
//! One cycle runs the ordered stages fetch -> extract -> resolve -> assign ->
//! transition for a single model. Stages are strictly sequential within a
//! cycle; extraction and owner assignment are pure in-memory computation, so
//! the store calls are the only points where the worker blocks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ConfigError, IndexError, LinkageError, LinkageResult};
use crate::extract::{extract_candidates, CandidateSet};
use crate::index::{assign_owners, resolve_batch, KeyIndexStore};
use crate::record::{KeyedRecord, RawStageRecord, ReferenceId, StagePartition};
use crate::registry::{ModelName, ModelRegistry};
use crate::stage::{transition, StageStore};

/// Shared collaborators and per-cycle policy handed to each worker.
pub(crate) struct WorkerContext {
    pub stage: Arc<dyn StageStore>,
    pub index: Arc<dyn KeyIndexStore>,
    pub registry: Arc<dyn ModelRegistry>,
    pub cycle_deadline: Duration,
    pub mint_missing: bool,
}

/// Counters produced by one completed cycle.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CycleStats {
    pub fetched: usize,
    pub keyed: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub minted: usize,
    pub memory_bytes: u64,
}

/// Runs one cycle for one model.
///
/// Failure at any stage aborts only this model's cycle; its records are left
/// untouched for the next cycle. The soft deadline is checked between stages
/// only - a transition that has started is allowed to finish so records are
/// never left half-moved.
pub(crate) fn run_cycle(
    ctx: &WorkerContext,
    model: &ModelName,
    batch_size: usize,
) -> LinkageResult<CycleStats> {
    let started = Instant::now();

    let paths = ctx.registry.identity_paths(model)?;
    if paths.is_empty() {
        return Err(ConfigError::NoIdentityPaths {
            model: model.to_string(),
        }
        .into());
    }

    let records = ctx
        .stage
        .fetch_batch(model, StagePartition::Standardized, batch_size)?;
    let fetched = records.len();
    if records.is_empty() {
        return Ok(CycleStats::default());
    }
    let memory_bytes = records.iter().map(RawStageRecord::approx_bytes).sum();
    check_deadline(started, ctx.cycle_deadline, model)?;

    let mut pending: Vec<(RawStageRecord, CandidateSet)> = Vec::with_capacity(records.len());
    let mut skipped = 0usize;
    for record in records {
        match extract_candidates(&paths, &record) {
            Ok(candidates) if !candidates.is_empty() => pending.push((record, candidates)),
            Ok(_) => skipped += 1,
            Err(err) => {
                // Left in place and retried later; the payload may be
                // enriched by then.
                skipped += 1;
                tracing::debug!(model = %model, record = %record.id, error = %err, "record skipped");
            }
        }
    }
    check_deadline(started, ctx.cycle_deadline, model)?;

    let candidate_sets: Vec<CandidateSet> =
        pending.iter().map(|(_, set)| set.clone()).collect();
    let hits = resolve_batch(ctx.index.as_ref(), model, &candidate_sets)?;
    check_deadline(started, ctx.cycle_deadline, model)?;

    let mut keyed_records = Vec::with_capacity(pending.len());
    let mut conflicts = 0usize;
    let mut minted = 0usize;
    for (record, candidates) in pending {
        let mut owners = assign_owners(&candidates, &hits);
        if owners.is_empty() && ctx.mint_missing {
            let outcome = mint_owners(ctx.index.as_ref(), model, &candidates)?;
            if outcome.fresh_bound {
                minted += 1;
            }
            owners = outcome.owners;
        }
        if owners.len() > 1 {
            conflicts += 1;
        }
        keyed_records.push(KeyedRecord::from_raw(record, owners));
    }
    check_deadline(started, ctx.cycle_deadline, model)?;

    transition(
        ctx.stage.as_ref(),
        model,
        StagePartition::Standardized,
        StagePartition::Keyed,
        &keyed_records,
    )?;

    Ok(CycleStats {
        fetched,
        keyed: keyed_records.len(),
        skipped,
        conflicts,
        minted,
        memory_bytes,
    })
}

struct MintOutcome {
    owners: BTreeSet<ReferenceId>,
    fresh_bound: bool,
}

/// Mints a canonical reference for a record none of whose candidates matched
/// the index.
///
/// Every candidate is bound with a conditional insert. When a racing worker
/// got there first, the store's conflict carries the winning reference and we
/// adopt it - both racers converge on one identity without a read-then-write
/// window. A record whose candidates land on different references keeps all
/// of them, surfacing the conflict downstream.
fn mint_owners(
    index: &dyn KeyIndexStore,
    model: &ModelName,
    candidates: &CandidateSet,
) -> LinkageResult<MintOutcome> {
    let fresh = ReferenceId::new();
    let mut current = fresh;
    let mut owners = BTreeSet::new();

    for candidate in candidates.iter() {
        match index.insert(model, candidate, current) {
            Ok(_) => {
                owners.insert(current);
            }
            Err(IndexError::Conflict { existing, .. }) => {
                owners.insert(existing);
                // Adopt the winner for the remaining candidates, unless a
                // previous candidate already bound our fresh reference.
                if !owners.contains(&fresh) {
                    current = existing;
                }
            }
            Err(err @ IndexError::Store(_)) => return Err(err.into()),
        }
    }

    let fresh_bound = owners.contains(&fresh);
    Ok(MintOutcome { owners, fresh_bound })
}

fn check_deadline(
    started: Instant,
    deadline: Duration,
    model: &ModelName,
) -> LinkageResult<()> {
    let elapsed = started.elapsed();
    if elapsed > deadline {
        return Err(LinkageError::DeadlineExceeded {
            model: model.to_string(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InMemoryKeyIndex;
    use crate::record::SourceId;
    use crate::registry::{IdentityPath, InMemoryModelRegistry};
    use crate::stage::InMemoryStageStore;
    use crate::value::{Payload, PayloadValue};
    use chrono::Utc;

    fn context(
        stage: Arc<InMemoryStageStore>,
        index: Arc<InMemoryKeyIndex>,
        registry: Arc<InMemoryModelRegistry>,
        mint_missing: bool,
    ) -> WorkerContext {
        WorkerContext {
            stage,
            index,
            registry,
            cycle_deadline: Duration::from_secs(30),
            mint_missing,
        }
    }

    fn model() -> ModelName {
        ModelName::new("customer")
    }

    fn record(code: &str) -> RawStageRecord {
        let mut payload = Payload::new();
        payload.insert(
            "customerCode".to_string(),
            PayloadValue::String(code.to_string()),
        );
        RawStageRecord::new(
            SourceId::new("crm"),
            Utc::now(),
            payload,
            StagePartition::Standardized,
        )
    }

    fn registry_with_paths() -> Arc<InMemoryModelRegistry> {
        let registry = InMemoryModelRegistry::new();
        registry.register(model(), vec![IdentityPath::new("customerCode")]);
        Arc::new(registry)
    }

    #[test]
    fn cycle_promotes_resolved_records() {
        let stage = Arc::new(InMemoryStageStore::new());
        let index = Arc::new(InMemoryKeyIndex::new());
        let reference = ReferenceId::new();
        index.insert(&model(), "cust-001", reference).unwrap();
        stage.seed(&model(), record("CUST-001"));

        let ctx = context(stage.clone(), index, registry_with_paths(), false);
        let stats = run_cycle(&ctx, &model(), 10).unwrap();

        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.keyed, 1);
        assert_eq!(stats.skipped, 0);
        let keyed = stage.records_in(&model(), StagePartition::Keyed);
        assert!(keyed[0].owners.contains(&reference));
    }

    #[test]
    fn empty_stage_is_an_empty_cycle() {
        let stage = Arc::new(InMemoryStageStore::new());
        let index = Arc::new(InMemoryKeyIndex::new());
        let ctx = context(stage, index, registry_with_paths(), false);
        let stats = run_cycle(&ctx, &model(), 10).unwrap();
        assert_eq!(stats.fetched, 0);
    }

    #[test]
    fn no_identity_paths_is_a_config_error() {
        let registry = InMemoryModelRegistry::new();
        registry.register(model(), Vec::new());
        let ctx = context(
            Arc::new(InMemoryStageStore::new()),
            Arc::new(InMemoryKeyIndex::new()),
            Arc::new(registry),
            false,
        );
        let err = run_cycle(&ctx, &model(), 10).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn minting_binds_all_candidates_to_one_fresh_reference() {
        let stage = Arc::new(InMemoryStageStore::new());
        let index = Arc::new(InMemoryKeyIndex::new());
        stage.seed(&model(), record("CUST-001"));

        let ctx = context(stage.clone(), index.clone(), registry_with_paths(), true);
        let stats = run_cycle(&ctx, &model(), 10).unwrap();

        assert_eq!(stats.minted, 1);
        let keyed = stage.records_in(&model(), StagePartition::Keyed);
        assert_eq!(keyed[0].owners.len(), 1);
        let entries = index.entries(&model());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].aggregation_key, "cust-001");
        assert!(keyed[0].owners.contains(&entries[0].reference_id));
    }

    #[test]
    fn mint_race_loser_adopts_winner() {
        let index = InMemoryKeyIndex::new();
        let winner = ReferenceId::new();
        index.insert(&model(), "cust-001", winner).unwrap();

        let mut candidates = CandidateSet::new();
        candidates.push("cust-001".to_string());
        candidates.push("alias-7".to_string());

        let outcome = mint_owners(&index, &model(), &candidates).unwrap();
        assert!(!outcome.fresh_bound);
        assert_eq!(outcome.owners.len(), 1);
        assert!(outcome.owners.contains(&winner));
        // The remaining candidate was bound to the adopted winner.
        let entries = index.entries(&model());
        assert!(entries
            .iter()
            .any(|e| e.aggregation_key == "alias-7" && e.reference_id == winner));
    }

    #[test]
    fn deadline_zero_aborts_before_resolution() {
        let stage = Arc::new(InMemoryStageStore::new());
        stage.seed(&model(), record("CUST-001"));
        let index = Arc::new(InMemoryKeyIndex::new());
        let ctx = WorkerContext {
            stage: stage.clone(),
            index,
            registry: registry_with_paths(),
            cycle_deadline: Duration::ZERO,
            mint_missing: false,
        };

        let err = run_cycle(&ctx, &model(), 10).unwrap_err();
        assert!(matches!(err, LinkageError::DeadlineExceeded { .. }));
        // Nothing moved.
        assert_eq!(stage.count(&model(), StagePartition::Standardized), 1);
        assert_eq!(stage.count(&model(), StagePartition::Keyed), 0);
    }
}
