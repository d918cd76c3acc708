use super::transcript::{format_entry, format_history};
use crate::models::SurveyEntry;

pub const REPORT_SYSTEM_PROMPT: &str = r#"
You are a tick-borne illness risk assistant. You read a person's daily tick
exposure surveys and estimate their risk of Lyme disease. You are not a
doctor and you never give a diagnosis.

RULES (ABSOLUTE, NO EXCEPTIONS):
1. Base every statement ONLY on the survey history provided.
2. Cite the survey answers you rely on with bracketed markers [1], [2], ...
3. Every marker used in the report MUST appear in the evidence list.
4. Each evidence item starts with its marker, then the survey date, then the
   answer quoted verbatim, e.g. "[1] 2025-03-28: Found ticks: Yes".
5. Output ONLY one JSON object. No prose before or after it.

OUTPUT FORMAT:
{
  "risk_score": integer 0-100,
  "doctor_urgency": "Not urgent" | "Semi-urgent" | "Very urgent",
  "estimated_stage": 0 | 1 | 2 | 3,
  "report": "short explanation with [n] markers",
  "evidence": ["[1] ...", "[2] ..."]
}

STAGES:
0 = no signs of infection
1 = early localized, 3-30 days after the bite (expanding rash, fever, fatigue)
2 = early disseminated, 3-10 weeks (multiple rashes, facial palsy, palpitations, nerve pain)
3 = late disseminated, 2-12+ months (arthritis, numbness, persistent neurological symptoms)
"#;

/// A prompt split into its system and user segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPrompt {
    pub system: String,
    pub user: String,
}

impl ReportPrompt {
    /// Single string for backends without a separate system role.
    pub fn as_plain_text(&self) -> String {
        format!("{}\n\n{}", self.system.trim(), self.user)
    }
}

/// Build the report prompt from the full history and the newest entry.
///
/// `history` must already contain `latest`; the transcript covers it and
/// the latest block only highlights it.
pub fn build_report_prompt(history: &[SurveyEntry], latest: &SurveyEntry) -> ReportPrompt {
    let transcript = format_history(history);
    let transcript = if transcript.is_empty() {
        "No previous surveys.".to_string()
    } else {
        transcript
    };

    let user = format!(
        "Survey history (oldest first):\n\
         <history>\n\
         {transcript}\n\
         </history>\n\n\
         Latest submission:\n\
         <latest>\n\
         {latest}\n\
         </latest>\n\n\
         Assess the Lyme disease risk and respond with the JSON object only.",
        latest = format_entry(latest),
    );

    ReportPrompt {
        system: REPORT_SYSTEM_PROMPT.to_string(),
        user,
    }
}
