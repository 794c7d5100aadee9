//! # Linkage - identity resolution and keying pipeline
//!
//! Linkage ingests raw entity snapshots produced independently by multiple
//! source systems, deduplicates them against previously observed real-world
//! identities, and promotes each record through ordered stage partitions
//! until it carries a stable, shared canonical reference.
//!
//! ## Core Concepts
//!
//! - **Stage partition**: the ordered buckets (intake, standardized, keyed) a
//!   record passes through; a record is never visible in two at once after a
//!   completed cycle.
//! - **Candidate**: a normalized identity value extracted from a record's
//!   payload along a model's declared identity paths.
//! - **Key index**: an append-only map from candidate to canonical reference;
//!   resolved in bulk, one lookup per processing batch.
//! - **Owner set**: the canonical references assigned to a keyed record -
//!   one is the normal case, zero means unresolved, several surface a
//!   genuine conflict for downstream canonicalization.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use linkage::{
//!     AssociationEngine, EngineConfig, IdentityPath, InMemoryKeyIndex,
//!     InMemoryMetricsSink, InMemoryModelRegistry, InMemoryStageStore, ModelName,
//! };
//!
//! let registry = Arc::new(InMemoryModelRegistry::new());
//! registry.register(
//!     ModelName::new("customer"),
//!     vec![IdentityPath::new("customerCode"), IdentityPath::new("external.id")],
//! );
//!
//! let engine = AssociationEngine::start(
//!     Arc::new(InMemoryStageStore::new()),
//!     Arc::new(InMemoryKeyIndex::new()),
//!     registry,
//!     Arc::new(InMemoryMetricsSink::new()),
//!     EngineConfig::default(),
//! );
//! // ... producers feed the standardized stage ...
//! engine.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod engine;
pub mod error;
pub mod extract;
pub mod index;
pub mod metrics;
pub mod record;
pub mod registry;
pub mod stage;
pub mod value;

// Re-export primary types at crate root for convenience
pub use batch::{BatchSizer, BatchSizerConfig, CycleSample};
pub use engine::{AssociationEngine, EngineConfig};
pub use error::{
    ConfigError, ExtractionError, IndexError, LinkageError, LinkageResult, ResolutionError,
    StoreError, TransitionError,
};
pub use extract::{extract_candidates, normalize_candidate, CandidateSet};
pub use index::{
    assign_owners, resolve_batch, InMemoryKeyIndex, InsertOutcome, KeyIndexEntry, KeyIndexStore,
};
pub use metrics::{CycleReport, InMemoryMetricsSink, MetricsSink, NullSink};
pub use record::{
    KeyedRecord, RawStageRecord, RecordId, ReferenceId, SourceId, StagePartition,
};
pub use registry::{IdentityPath, InMemoryModelRegistry, ModelName, ModelRegistry};
pub use stage::{transition, InMemoryStageStore, StageStore};
pub use value::{Payload, PayloadValue};
