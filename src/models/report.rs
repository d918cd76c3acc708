use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{DoctorUrgency, EstimatedStage};
use super::ModelError;

static CITATION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("citation marker pattern"));

/// Lyme risk on a 0-100 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct RiskScore(u8);

impl RiskScore {
    pub const MAX: u8 = 100;

    pub fn new(value: i64) -> Result<Self, ModelError> {
        match u8::try_from(value) {
            Ok(v) if v <= Self::MAX => Ok(Self(v)),
            _ => Err(ModelError::RiskScoreOutOfRange(value)),
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for RiskScore {
    type Error = ModelError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RiskScore> for i64 {
    fn from(score: RiskScore) -> Self {
        i64::from(score.0)
    }
}

/// A generated risk assessment. Only the latest one is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    /// When the report was generated, not when any survey was taken.
    pub timestamp: DateTime<Utc>,
    pub risk_score: RiskScore,
    pub doctor_urgency: DoctorUrgency,
    pub estimated_stage: EstimatedStage,
    /// Free text with inline `[n]` markers.
    pub narrative: String,
    /// Each item is `"[n] <source text>"`.
    pub citations: Vec<String>,
}

impl Report {
    pub fn new(
        risk_score: RiskScore,
        doctor_urgency: DoctorUrgency,
        estimated_stage: EstimatedStage,
        narrative: String,
        citations: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            risk_score,
            doctor_urgency,
            estimated_stage,
            narrative,
            citations,
        }
    }

    /// Citations flattened one per line, for display.
    pub fn citation_text(&self) -> String {
        self.citations.join("\n")
    }

    /// Marker numbers referenced inside the narrative.
    pub fn cited_markers(&self) -> BTreeSet<u32> {
        markers_in(&self.narrative)
    }

    /// Marker numbers that lead a citation entry.
    pub fn citation_markers(&self) -> BTreeSet<u32> {
        self.citations
            .iter()
            .filter_map(|c| {
                let caps = CITATION_MARKER.captures(c.trim_start())?;
                let whole = caps.get(0)?;
                if whole.start() != 0 {
                    return None;
                }
                caps.get(1)?.as_str().parse().ok()
            })
            .collect()
    }

    /// Markers the narrative uses without a matching citation.
    pub fn dangling_markers(&self) -> BTreeSet<u32> {
        let available = self.citation_markers();
        self.cited_markers()
            .into_iter()
            .filter(|n| !available.contains(n))
            .collect()
    }
}

fn markers_in(text: &str) -> BTreeSet<u32> {
    CITATION_MARKER
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect()
}
