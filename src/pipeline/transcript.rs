//! History transcript: the deterministic text rendering of survey entries
//! that the generator sees.

use crate::models::SurveyEntry;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M UTC";

/// Render all entries, oldest first, one block per entry separated by a
/// blank line. Entries with equal timestamps are ordered by id, so the text
/// does not depend on input order.
pub fn format_history(entries: &[SurveyEntry]) -> String {
    let mut ordered: Vec<&SurveyEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| (e.timestamp, e.id));

    ordered
        .into_iter()
        .map(format_entry)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Render one entry as a fixed-format block (no trailing newline).
pub fn format_entry(entry: &SurveyEntry) -> String {
    let symptoms = if entry.symptoms.is_empty() {
        "None".to_string()
    } else {
        entry.symptom_labels().join(", ")
    };
    let notes = entry.notes.as_deref().unwrap_or("None");

    format!(
        "Date: {date}\n\
         Spent time outdoors: {outdoors}\n\
         Used repellent: {repellent}\n\
         Checked for ticks: {checked}\n\
         Found ticks: {found}\n\
         Symptoms: {symptoms}\n\
         Additional notes: {notes}",
        date = entry.timestamp.format(DATE_FORMAT),
        outdoors = yes_no(entry.spent_time_outdoors),
        repellent = yes_no(entry.used_repellent),
        checked = yes_no(entry.checked_for_ticks),
        found = yes_no(entry.found_ticks),
    )
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}
