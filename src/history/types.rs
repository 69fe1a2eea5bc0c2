//! History record types

use crate::models::Report;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One persisted analysis. The report fields are flattened into the
/// record document, matching the storage layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Record id, assigned when the record is created
    pub id: String,
    /// When the analyzed image was captured
    pub captured_at: DateTime<Utc>,
    /// Base64-encoded PNG thumbnail of the analyzed image
    pub thumbnail: String,
    #[serde(flatten)]
    pub report: Report,
}

impl HistoryRecord {
    /// Create a record with a fresh id
    pub fn new(captured_at: DateTime<Utc>, thumbnail: String, report: Report) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            captured_at,
            thumbnail,
            report,
        }
    }
}

/// Sort newest first: captured_at descending, id descending as tiebreak
/// so the order is total and stable across backends.
pub fn sort_records(records: &mut [HistoryRecord]) {
    records.sort_by(|a, b| {
        b.captured_at
            .cmp(&a.captured_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}
