//! Error types for the linkage pipeline.
//!
//! All errors are strongly typed using thiserror. Each pipeline phase has its
//! own error family so callers can pattern-match on specific conditions; the
//! engine folds them into [`LinkageError`] and degrades per-model, never
//! globally.

use thiserror::Error;

use crate::record::{RecordId, ReferenceId, StagePartition};

/// Backend failure reported by a stage or key index store.
///
/// Store implementations map their transport/IO failures into this type;
/// the pipeline classifies it by the phase in which it occurred.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backing store rejected the operation.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors raised while extracting candidate values from a record payload.
///
/// Absent or empty identity paths are not errors (they are skipped silently);
/// extraction fails only when a declared path points at a value that cannot
/// yield an identity string.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("identity path '{path}' on record {record} holds a {found} value, expected text")]
    MalformedField {
        path: String,
        record: RecordId,
        found: &'static str,
    },
}

/// Errors raised while resolving a batch of candidates against the key index.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("bulk lookup failed for model '{model}': {source}")]
    LookupFailed {
        model: String,
        source: StoreError,
    },
}

/// Errors raised while moving a batch of records between stage partitions.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The bulk upsert into the destination stage failed. Nothing was
    /// deleted; the whole batch is retried unchanged on a later cycle.
    #[error("bulk upsert into {stage} failed for model '{model}': {source}")]
    UpsertFailed {
        model: String,
        stage: StagePartition,
        source: StoreError,
    },

    /// The bulk delete from the source stage failed after a successful
    /// upsert. Stale source copies remain until an idempotent re-delete.
    #[error("bulk delete from {stage} failed for model '{model}': {source}")]
    DeleteFailed {
        model: String,
        stage: StagePartition,
        source: StoreError,
    },
}

/// Errors raised by the key index store.
#[derive(Debug, Error)]
pub enum IndexError {
    /// An aggregation key is already bound to a different reference.
    ///
    /// Bindings are append-only; the store must never repoint a key. The
    /// existing (winning) reference is carried so a racing caller can adopt
    /// it instead of the reference it attempted to bind.
    #[error("aggregation key '{key}' is bound to {existing}, refusing rebind to {attempted}")]
    Conflict {
        key: String,
        existing: ReferenceId,
        attempted: ReferenceId,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration errors for registered models.
///
/// These disable the offending model until corrected; they are reported once,
/// not retried per cycle.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("model '{model}' is not registered")]
    UnknownModel { model: String },

    #[error("model '{model}' declares no identity paths")]
    NoIdentityPaths { model: String },
}

/// Top-level error type for the linkage pipeline.
#[derive(Debug, Error)]
pub enum LinkageError {
    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Store failure outside a classified phase (e.g. fetching a batch).
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A worker cycle exceeded its soft deadline. Recoverable; the model's
    /// records are untouched and retried next cycle.
    #[error("cycle for model '{model}' exceeded its deadline after {elapsed_ms}ms")]
    DeadlineExceeded { model: String, elapsed_ms: u64 },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl LinkageError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this error is expected to clear on a later cycle.
    ///
    /// Conflicts and configuration errors will not change on retry; store
    /// reachability, transition failures, and deadline overruns will.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Resolution(_)
            | Self::Transition(_)
            | Self::Store(_)
            | Self::DeadlineExceeded { .. } => true,
            Self::Index(e) => matches!(e, IndexError::Store(_)),
            Self::Extraction(_) | Self::Config(_) | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for linkage operations.
pub type LinkageResult<T> = Result<T, LinkageError>;
