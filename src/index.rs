//! Key index and batch resolver.
//!
//! The key index is a persistent map from normalized aggregation key to
//! canonical reference. Entries are append-only: a key's reference is never
//! repointed, so replaying history is deterministic. The resolver's defining
//! property is that it issues **one bulk lookup per processing batch** - the
//! single most important performance property of the pipeline.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, ResolutionError, StoreError};
use crate::extract::CandidateSet;
use crate::record::ReferenceId;
use crate::registry::ModelName;

/// One aggregation-key binding in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIndexEntry {
    /// Normalized candidate identity string. Unique per model.
    pub aggregation_key: String,
    /// Canonical reference the key is bound to.
    pub reference_id: ReferenceId,
}

/// Outcome of a conditional index insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The binding was newly written.
    Inserted,
    /// The identical binding already existed; idempotent no-op.
    Replayed,
}

/// Persistent map from aggregation key to canonical reference.
///
/// # Safety Considerations
/// - `insert` must be a conditional unique write inside the store, never a
///   read-then-write in caller code: concurrent first-sight collisions on the
///   same key from different workers or process instances must serialize into
///   one winner, with losers told the winning reference via
///   [`IndexError::Conflict`].
pub trait KeyIndexStore: Send + Sync {
    /// Looks up many candidates at once, returning **only the hits**.
    ///
    /// Callers must treat absent keys as misses, not errors.
    ///
    /// # Errors
    /// - `StoreError` if the index backend is unreachable.
    fn bulk_lookup(
        &self,
        model: &ModelName,
        candidates: &[String],
    ) -> Result<HashMap<String, ReferenceId>, StoreError>;

    /// Conditionally binds a key to a reference.
    ///
    /// Re-inserting an existing identical binding is an idempotent no-op;
    /// inserting an existing key with a different reference fails loudly.
    ///
    /// # Errors
    /// - `IndexError::Conflict` if the key is bound to a different reference
    ///   (the error carries the existing, winning binding).
    /// - `IndexError::Store` if the backend is unreachable.
    fn insert(
        &self,
        model: &ModelName,
        key: &str,
        reference: ReferenceId,
    ) -> Result<InsertOutcome, IndexError>;
}

/// Thread-safe in-memory key index for embedded use and tests.
///
/// Counts bulk lookups so tests can assert the one-call-per-batch property,
/// and carries a failure toggle to exercise resolution-error paths.
#[derive(Debug, Default)]
pub struct InMemoryKeyIndex {
    state: RwLock<HashMap<ModelName, HashMap<String, ReferenceId>>>,
    lookup_calls: AtomicU64,
    fail_lookups: AtomicBool,
}

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend(format!("poisoned lock: {context}"))
}

impl InMemoryKeyIndex {
    /// Create a new empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bulk lookup calls issued so far.
    #[must_use]
    pub fn lookup_calls(&self) -> u64 {
        self.lookup_calls.load(Ordering::Relaxed)
    }

    /// Makes subsequent bulk lookups fail with `StoreError::Unavailable`.
    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::Relaxed);
    }

    /// Snapshot of a model's entries, sorted by key.
    #[must_use]
    pub fn entries(&self, model: &ModelName) -> Vec<KeyIndexEntry> {
        let state = match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<KeyIndexEntry> = state
            .get(model)
            .map(|keys| {
                keys.iter()
                    .map(|(k, v)| KeyIndexEntry {
                        aggregation_key: k.clone(),
                        reference_id: *v,
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.aggregation_key.cmp(&b.aggregation_key));
        out
    }
}

impl KeyIndexStore for InMemoryKeyIndex {
    fn bulk_lookup(
        &self,
        model: &ModelName,
        candidates: &[String],
    ) -> Result<HashMap<String, ReferenceId>, StoreError> {
        self.lookup_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_lookups.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("key index offline".to_string()));
        }

        let state = self.state.read().map_err(|_| lock_err("index.lookup"))?;
        let Some(keys) = state.get(model) else {
            return Ok(HashMap::new());
        };

        let mut hits = HashMap::new();
        for candidate in candidates {
            if let Some(reference) = keys.get(candidate) {
                hits.insert(candidate.clone(), *reference);
            }
        }
        Ok(hits)
    }

    fn insert(
        &self,
        model: &ModelName,
        key: &str,
        reference: ReferenceId,
    ) -> Result<InsertOutcome, IndexError> {
        // Single write-lock section: the check and the write are one
        // conditional operation, so racing first-sight inserts serialize.
        let mut state = self.state.write().map_err(|_| lock_err("index.insert"))?;
        let keys = state.entry(model.clone()).or_default();

        match keys.get(key) {
            Some(existing) if *existing == reference => Ok(InsertOutcome::Replayed),
            Some(existing) => Err(IndexError::Conflict {
                key: key.to_string(),
                existing: *existing,
                attempted: reference,
            }),
            None => {
                keys.insert(key.to_string(), reference);
                Ok(InsertOutcome::Inserted)
            }
        }
    }
}

/// Resolves a whole batch of candidate sets with exactly one bulk lookup.
///
/// The union of all records' candidates goes out in a single call; the
/// returned hit map is shared by every record's owner assignment.
///
/// # Errors
/// - `ResolutionError::LookupFailed` if the index backend is unreachable.
pub fn resolve_batch(
    index: &dyn KeyIndexStore,
    model: &ModelName,
    candidate_sets: &[CandidateSet],
) -> Result<HashMap<String, ReferenceId>, ResolutionError> {
    let mut union: Vec<String> = Vec::new();
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for set in candidate_sets {
        for candidate in set.iter() {
            if seen.insert(candidate) {
                union.push(candidate.to_string());
            }
        }
    }

    if union.is_empty() {
        return Ok(HashMap::new());
    }

    index
        .bulk_lookup(model, &union)
        .map_err(|source| ResolutionError::LookupFailed {
            model: model.to_string(),
            source,
        })
}

/// Assigns the owner set for one record from the batch's hit map.
///
/// Collects the distinct references hit by any of the record's candidates:
/// exactly one means a clean match, several surface a genuine conflict
/// untouched, none leaves the record unresolved.
#[must_use]
pub fn assign_owners(
    candidates: &CandidateSet,
    hits: &HashMap<String, ReferenceId>,
) -> BTreeSet<ReferenceId> {
    candidates
        .iter()
        .filter_map(|candidate| hits.get(candidate).copied())
        .collect()
}
