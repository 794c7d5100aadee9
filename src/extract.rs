//! Candidate extraction.
//!
//! Pure functions that read a model's declared identity paths out of a record
//! payload and normalize the values into aggregation-key candidates. No side
//! effects: an empty result is not an error, it marks the record unresolvable
//! for this cycle (the payload may not have been enriched yet).

use serde::{Deserialize, Serialize};

use crate::error::ExtractionError;
use crate::record::RawStageRecord;
use crate::registry::IdentityPath;
use crate::value::{Payload, PayloadValue};

/// Ephemeral, ordered, deduplicated set of normalized candidate strings for
/// one record. Never persisted on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSet {
    values: Vec<String>,
}

impl CandidateSet {
    /// Creates an empty candidate set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a normalized candidate, keeping first-seen order and dropping
    /// duplicates.
    pub fn push(&mut self, candidate: String) {
        if !self.values.iter().any(|v| v == &candidate) {
            self.values.push(candidate);
        }
    }

    /// True if no candidate was extracted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of distinct candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Iterates candidates in extraction order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }

    /// Candidates as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.values
    }

    /// True if the two sets share at least one candidate.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.values.iter().any(|v| other.values.contains(v))
    }
}

/// Normalizes a raw identity value into an aggregation-key candidate.
///
/// Trim, case-fold, and unify `_` to `-`: producers disagree on casing,
/// padding, and separator convention, but the remaining characters are
/// significant.
#[must_use]
pub fn normalize_candidate(raw: &str) -> String {
    raw.trim().to_lowercase().replace('_', "-")
}

/// Extracts the candidate set for one record.
///
/// For each declared path, reads the payload value (flat key first, then
/// dotted descent through nested maps), normalizes it, and adds it to the
/// set. Absent or empty values are skipped silently.
///
/// # Errors
/// - `ExtractionError::MalformedField` if a declared path holds a value that
///   cannot yield an identity string (bool, float, or a nested map at the
///   leaf position).
pub fn extract_candidates(
    paths: &[IdentityPath],
    record: &RawStageRecord,
) -> Result<CandidateSet, ExtractionError> {
    let mut candidates = CandidateSet::new();

    for path in paths {
        let Some(value) = resolve_path(&record.payload, path) else {
            continue;
        };

        match value {
            PayloadValue::String(s) => {
                let normalized = normalize_candidate(s);
                if !normalized.is_empty() {
                    candidates.push(normalized);
                }
            }
            PayloadValue::StringArray(items) => {
                for item in items {
                    let normalized = normalize_candidate(item);
                    if !normalized.is_empty() {
                        candidates.push(normalized);
                    }
                }
            }
            // Numeric source identifiers are common; render them stably.
            PayloadValue::Int(i) => candidates.push(i.to_string()),
            other => {
                return Err(ExtractionError::MalformedField {
                    path: path.to_string(),
                    record: record.id,
                    found: other.kind(),
                })
            }
        }
    }

    Ok(candidates)
}

/// Resolves a path against a payload: a flat key that literally matches the
/// whole path wins over nested descent.
fn resolve_path<'a>(payload: &'a Payload, path: &IdentityPath) -> Option<&'a PayloadValue> {
    if let Some(value) = payload.get(path.as_str()) {
        return Some(value);
    }

    let mut segments = path.segments();
    let first = segments.next()?;
    let mut current = payload.get(first)?;
    for segment in segments {
        current = current.as_map()?.get(segment)?;
    }
    Some(current)
}
