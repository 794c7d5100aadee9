//! Stage store and the stage transition protocol.
//!
//! Records move between stage partitions with an upsert-then-delete sequence:
//! destination records are bulk-upserted first, and only after the upsert
//! batch reports success are the source ids bulk-deleted. The guarantee is
//! at-least-once promotion - a crash between the two steps leaves the record
//! briefly visible in both stages, and a later cycle's idempotent re-run
//! cleans up the stale source copy. Downstream consumers must therefore be
//! idempotent on record id.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::error::{StoreError, TransitionError};
use crate::record::{KeyedRecord, RawStageRecord, RecordId, StagePartition};
use crate::registry::ModelName;

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend(format!("poisoned lock: {context}"))
}

/// Persistent, per-model, per-stage record storage.
///
/// # Safety Considerations
/// - `bulk_upsert` must be id-keyed and idempotent: re-upserting an id
///   replaces the stored record, never duplicates it.
/// - `bulk_delete` must treat missing ids as already-deleted no-ops so stale
///   source copies can be re-deleted by a later cycle.
pub trait StageStore: Send + Sync {
    /// Fetches up to `limit` records from a stage partition.
    ///
    /// # Errors
    /// - `StoreError` if the backend is unreachable.
    fn fetch_batch(
        &self,
        model: &ModelName,
        stage: StagePartition,
        limit: usize,
    ) -> Result<Vec<RawStageRecord>, StoreError>;

    /// Writes destination-stage records, keyed by record id.
    ///
    /// # Errors
    /// - `StoreError` if the backend is unreachable or rejects the batch.
    fn bulk_upsert(
        &self,
        model: &ModelName,
        stage: StagePartition,
        records: &[KeyedRecord],
    ) -> Result<(), StoreError>;

    /// Deletes records by id from a stage partition.
    ///
    /// # Errors
    /// - `StoreError` if the backend is unreachable or rejects the batch.
    fn bulk_delete(
        &self,
        model: &ModelName,
        stage: StagePartition,
        ids: &[RecordId],
    ) -> Result<(), StoreError>;
}

/// Advances a batch of records from one stage partition to the next.
///
/// Upsert first, delete after: if the upsert fails nothing is deleted and the
/// whole batch is retried unchanged on a later cycle; if the delete fails the
/// stale source copies remain for an idempotent re-run. Re-running with the
/// same batch never duplicates destination records.
///
/// # Errors
/// - `TransitionError::UpsertFailed` / `TransitionError::DeleteFailed`.
pub fn transition(
    store: &dyn StageStore,
    model: &ModelName,
    from: StagePartition,
    to: StagePartition,
    records: &[KeyedRecord],
) -> Result<(), TransitionError> {
    if records.is_empty() {
        return Ok(());
    }

    let ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();

    store
        .bulk_upsert(model, to, records)
        .map_err(|source| TransitionError::UpsertFailed {
            model: model.to_string(),
            stage: to,
            source,
        })?;

    store
        .bulk_delete(model, from, &ids)
        .map_err(|source| TransitionError::DeleteFailed {
            model: model.to_string(),
            stage: from,
            source,
        })
}

/// Thread-safe in-memory stage store for embedded use and tests.
///
/// Records are ordered by id within a partition so fetches are
/// deterministic. Failure toggles let tests exercise the crash window
/// between the upsert and delete halves of a transition.
#[derive(Debug, Default)]
pub struct InMemoryStageStore {
    state: RwLock<HashMap<(ModelName, StagePartition), BTreeMap<RecordId, KeyedRecord>>>,
    fail_upserts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl InMemoryStageStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a raw record into the partition named by its `stage` field.
    pub fn seed(&self, model: &ModelName, record: RawStageRecord) {
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stage = record.stage;
        let keyed = KeyedRecord::from_raw(record, std::collections::BTreeSet::new());
        state
            .entry((model.clone(), stage))
            .or_default()
            .insert(keyed.id, keyed);
    }

    /// Makes subsequent upserts fail with `StoreError::Unavailable`.
    pub fn set_fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::Relaxed);
    }

    /// Makes subsequent deletes fail with `StoreError::Unavailable`.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Relaxed);
    }

    /// Ids currently visible in a partition, ascending.
    #[must_use]
    pub fn ids_in(&self, model: &ModelName, stage: StagePartition) -> Vec<RecordId> {
        let state = match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state
            .get(&(model.clone(), stage))
            .map(|records| records.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of records in a partition.
    #[must_use]
    pub fn count(&self, model: &ModelName, stage: StagePartition) -> usize {
        self.ids_in(model, stage).len()
    }

    /// Snapshot of a partition's records with their owner sets, by id order.
    #[must_use]
    pub fn records_in(&self, model: &ModelName, stage: StagePartition) -> Vec<KeyedRecord> {
        let state = match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state
            .get(&(model.clone(), stage))
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl StageStore for InMemoryStageStore {
    fn fetch_batch(
        &self,
        model: &ModelName,
        stage: StagePartition,
        limit: usize,
    ) -> Result<Vec<RawStageRecord>, StoreError> {
        let state = self.state.read().map_err(|_| lock_err("stage.fetch"))?;
        let Some(records) = state.get(&(model.clone(), stage)) else {
            return Ok(Vec::new());
        };
        Ok(records
            .values()
            .take(limit)
            .cloned()
            .map(|r| r.into_raw(stage))
            .collect())
    }

    fn bulk_upsert(
        &self,
        model: &ModelName,
        stage: StagePartition,
        records: &[KeyedRecord],
    ) -> Result<(), StoreError> {
        if self.fail_upserts.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("stage store offline".to_string()));
        }

        let mut state = self.state.write().map_err(|_| lock_err("stage.upsert"))?;
        let partition = state.entry((model.clone(), stage)).or_default();
        for record in records {
            partition.insert(record.id, record.clone());
        }
        Ok(())
    }

    fn bulk_delete(
        &self,
        model: &ModelName,
        stage: StagePartition,
        ids: &[RecordId],
    ) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("stage store offline".to_string()));
        }

        let mut state = self.state.write().map_err(|_| lock_err("stage.delete"))?;
        if let Some(partition) = state.get_mut(&(model.clone(), stage)) {
            for id in ids {
                // Missing ids are already-deleted no-ops.
                partition.remove(id);
            }
        }
        Ok(())
    }
}
