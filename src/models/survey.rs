use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::Symptom;

/// Answers to one day's survey, as submitted by the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SurveyAnswers {
    pub spent_time_outdoors: bool,
    pub used_repellent: bool,
    pub checked_for_ticks: bool,
    pub found_ticks: bool,
    #[serde(default)]
    pub symptoms: Vec<Symptom>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A stored survey submission. Never edited after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub spent_time_outdoors: bool,
    pub used_repellent: bool,
    pub checked_for_ticks: bool,
    pub found_ticks: bool,
    pub symptoms: Vec<Symptom>,
    /// `None` when the user left notes blank; `Some("")` is kept as-is.
    pub notes: Option<String>,
}

impl SurveyEntry {
    /// Create an entry stamped with a fresh id and the current time.
    pub fn new(answers: SurveyAnswers) -> Self {
        Self::with_timestamp(answers, Utc::now())
    }

    pub fn with_timestamp(answers: SurveyAnswers, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            spent_time_outdoors: answers.spent_time_outdoors,
            used_repellent: answers.used_repellent,
            checked_for_ticks: answers.checked_for_ticks,
            found_ticks: answers.found_ticks,
            symptoms: dedup_preserving_order(answers.symptoms),
            notes: answers.notes,
        }
    }

    /// Symptom labels in the order the user selected them.
    pub fn symptom_labels(&self) -> Vec<&'static str> {
        self.symptoms.iter().map(Symptom::as_str).collect()
    }
}

fn dedup_preserving_order(symptoms: Vec<Symptom>) -> Vec<Symptom> {
    let mut seen = Vec::with_capacity(symptoms.len());
    for symptom in symptoms {
        if !seen.contains(&symptom) {
            seen.push(symptom);
        }
    }
    seen
}
