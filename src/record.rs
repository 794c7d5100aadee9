//! Record identity and stage data model.
//!
//! Records flow through ordered stage partitions. Stable record identifiers
//! are the prerequisite for the whole pipeline: stage transitions are
//! idempotent on record id, and downstream canonicalization deduplicates by
//! it, so a record never multiplies however many times a crash window replays
//! its promotion.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Payload;

/// Opaque, stable record identifier.
///
/// Assigned by the producer when the snapshot is first written and preserved
/// across every stage transition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Creates a new random record ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a record ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Creates a nil record ID (for testing or sentinel values).
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical reference identifier shared by all records known to describe the
/// same real-world entity.
///
/// Sortable (UUID byte order) and immutable: once an aggregation key is bound
/// to a reference, that binding is never repointed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ReferenceId(Uuid);

impl ReferenceId {
    /// Mints a new random reference ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a reference ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReferenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptor of the source system that produced a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Creates a source descriptor.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the descriptor as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered stage partitions a record passes through.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StagePartition {
    /// Raw snapshots as delivered by producers.
    Intake,
    /// Shape-normalized records awaiting keying.
    Standardized,
    /// Records carrying owner reference(s).
    Keyed,
}

impl StagePartition {
    /// The stage a record is promoted into from this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Intake => Some(Self::Standardized),
            Self::Standardized => Some(Self::Keyed),
            Self::Keyed => None,
        }
    }

    /// Stable lowercase name of the partition.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Standardized => "standardized",
            Self::Keyed => "keyed",
        }
    }
}

impl fmt::Display for StagePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw entity snapshot sitting in a pre-keyed stage partition.
///
/// Immutable except for stage migration; deleted from its source partition
/// once promoted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStageRecord {
    /// Opaque record identifier.
    pub id: RecordId,
    /// Origin system descriptor.
    pub source_id: SourceId,
    /// When the snapshot was observed at the source.
    pub occurred_at: DateTime<Utc>,
    /// Ordered map of loosely typed payload fields.
    pub payload: Payload,
    /// Partition the record currently sits in.
    pub stage: StagePartition,
}

impl RawStageRecord {
    /// Creates a record in the given stage.
    #[must_use]
    pub fn new(
        source_id: SourceId,
        occurred_at: DateTime<Utc>,
        payload: Payload,
        stage: StagePartition,
    ) -> Self {
        Self {
            id: RecordId::new(),
            source_id,
            occurred_at,
            payload,
            stage,
        }
    }

    /// Rough in-memory footprint in bytes, used for batch-size feedback.
    #[must_use]
    pub fn approx_bytes(&self) -> u64 {
        let fixed = 16 + 8; // id + timestamp
        let source = self.source_id.as_str().len() as u64;
        let payload: u64 = self
            .payload
            .iter()
            .map(|(k, v)| k.len() as u64 + v.approx_bytes() + 16)
            .sum();
        fixed + source + payload
    }
}

/// A stage record plus the owner references assigned by keying.
///
/// Owner cardinality is meaningful and preserved: one owner is the normal
/// case, zero means no candidate matched the index, and more than one marks a
/// genuine conflict that downstream canonicalization must see as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedRecord {
    /// Opaque record identifier, unchanged from the source record.
    pub id: RecordId,
    /// Origin system descriptor.
    pub source_id: SourceId,
    /// When the snapshot was observed at the source.
    pub occurred_at: DateTime<Utc>,
    /// Ordered map of loosely typed payload fields.
    pub payload: Payload,
    /// Canonical references believed to apply to this record.
    pub owners: BTreeSet<ReferenceId>,
}

impl KeyedRecord {
    /// Builds the destination-stage record for a promotion: core fields are
    /// copied, owners attached.
    #[must_use]
    pub fn from_raw(record: RawStageRecord, owners: BTreeSet<ReferenceId>) -> Self {
        Self {
            id: record.id,
            source_id: record.source_id,
            occurred_at: record.occurred_at,
            payload: record.payload,
            owners,
        }
    }

    /// Converts back into a raw record in the given stage, dropping owners.
    #[must_use]
    pub fn into_raw(self, stage: StagePartition) -> RawStageRecord {
        RawStageRecord {
            id: self.id,
            source_id: self.source_id,
            occurred_at: self.occurred_at,
            payload: self.payload,
            stage,
        }
    }

    /// True if more than one canonical reference claims this record.
    #[must_use]
    pub fn is_conflicted(&self) -> bool {
        self.owners.len() > 1
    }

    /// True if no candidate matched anything in the index.
    #[must_use]
    pub fn is_unresolved(&self) -> bool {
        self.owners.is_empty()
    }
}
