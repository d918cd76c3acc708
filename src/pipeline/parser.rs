use serde::Deserialize;
use thiserror::Error;

use crate::models::{DoctorUrgency, EstimatedStage, Report, RiskScore};

/// Fence markers small models wrap around JSON. Longer markers come first
/// so "```json" is not left as "json" after stripping "```".
const FENCE_MARKERS: [&str; 7] = [
    "```json", "```JSON", "```", "'''json", "'''", "\"\"\"json", "\"\"\"",
];

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("The model response contained no JSON object")]
    NoJsonFound,

    #[error("The model response did not match the report format: {0}")]
    SchemaMismatch(#[from] serde_json::Error),
}

/// Wire shape of the model's answer.
#[derive(Debug, Deserialize)]
struct RawReport {
    risk_score: RiskScore,
    doctor_urgency: DoctorUrgency,
    estimated_stage: EstimatedStage,
    report: String,
    evidence: Vec<String>,
}

/// Parse raw model output into a `Report`.
pub fn parse_report_response(raw: &str) -> Result<Report, ParseError> {
    let stripped = strip_fences(raw);
    let payload = extract_json_block(stripped)?;
    let parsed: RawReport = serde_json::from_str(payload)?;

    Ok(Report::new(
        parsed.risk_score,
        parsed.doctor_urgency,
        parsed.estimated_stage,
        parsed.report,
        parsed.evidence,
    ))
}

/// Strip fence markers from both ends until nothing changes.
fn strip_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    loop {
        let before = text;
        for marker in FENCE_MARKERS {
            if let Some(rest) = text.strip_prefix(marker) {
                text = rest.trim();
            }
            if let Some(rest) = text.strip_suffix(marker) {
                text = rest.trim();
            }
        }
        if text.len() == before.len() {
            return text;
        }
    }
}

/// First `{` through last `}`, inclusive.
fn extract_json_block(text: &str) -> Result<&str, ParseError> {
    let start = text.find('{').ok_or(ParseError::NoJsonFound)?;
    let end = text.rfind('}').ok_or(ParseError::NoJsonFound)?;
    if end < start {
        return Err(ParseError::NoJsonFound);
    }
    Ok(&text[start..=end])
}
