//! Shared domain models
//!
//! Report is the structured lip-hydration analysis result. It is produced
//! by the AnalysisClient, displayed by the session, and embedded into
//! persisted history records.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Overall hydration verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DehydrationStatus {
    #[serde(rename = "Hydrated")]
    Hydrated,
    #[serde(rename = "Mildly Dehydrated")]
    MildlyDehydrated,
    #[serde(rename = "Severely Dehydrated")]
    SeverelyDehydrated,
}

impl DehydrationStatus {
    /// Convert to the wire/display string
    pub fn as_str(&self) -> &'static str {
        match self {
            DehydrationStatus::Hydrated => "Hydrated",
            DehydrationStatus::MildlyDehydrated => "Mildly Dehydrated",
            DehydrationStatus::SeverelyDehydrated => "Severely Dehydrated",
        }
    }
}

impl std::fmt::Display for DehydrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric assessment scores, each 0-100
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetrics {
    pub crack_intensity: i32,
    pub dryness_level: i32,
    pub moisture_score: i32,

    /// Short free-text note on lip color (may be absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_description: Option<String>,
}

impl ReportMetrics {
    /// Reject scores outside the 0-100 contract
    pub fn validate(&self) -> Result<()> {
        let scores = [
            ("crack_intensity", self.crack_intensity),
            ("dryness_level", self.dryness_level),
            ("moisture_score", self.moisture_score),
        ];

        for (name, value) in scores {
            if !(0..=100).contains(&value) {
                return Err(Error::AnalysisParse(format!(
                    "metric {} out of range: {}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

/// Structured analysis result, immutable once received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub dehydration_status: DehydrationStatus,
    pub metrics: ReportMetrics,

    /// May be absent in the service response
    #[serde(default)]
    pub visual_observations: Vec<String>,

    pub recommendations: Vec<String>,
    pub summary: String,
}

impl Report {
    /// Validate the report against the response contract
    pub fn validate(&self) -> Result<()> {
        self.metrics.validate()
    }
}
