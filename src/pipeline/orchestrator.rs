use std::sync::Arc;

use super::parser::parse_report_response;
use super::prompt::build_report_prompt;
use super::session::GenerationSession;
use crate::error::PipelineError;
use crate::events::{EventSink, PipelineEvent};
use crate::models::{Report, SurveyAnswers, SurveyEntry};
use crate::store::SurveyStore;

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionOutcome {
    pub entry: SurveyEntry,
    pub report: Report,
    /// False when a newer submission's report was stored first; the stored
    /// report is then left as it is.
    pub is_latest: bool,
}

/// Drives a survey submission end to end:
/// store entry → transcript → prompt → generate → parse → store report
pub struct ReportPipeline {
    store: Arc<SurveyStore>,
    session: Arc<GenerationSession>,
    events: Arc<dyn EventSink>,
}

impl ReportPipeline {
    pub fn new(
        store: Arc<SurveyStore>,
        session: Arc<GenerationSession>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            session,
            events,
        }
    }

    /// Start loading the model before the first submission needs it.
    pub async fn prepare(&self) -> Result<(), PipelineError> {
        self.session.initialize().await.map_err(PipelineError::from)
    }

    /// Record a survey and generate a fresh report from the full history.
    ///
    /// The entry is kept even when report generation fails; the previous
    /// report is only replaced on success.
    pub async fn submit_survey(
        &self,
        answers: SurveyAnswers,
    ) -> Result<SubmissionOutcome, PipelineError> {
        let (entry, history) = self.store.record(answers).await?;
        self.events.emit(PipelineEvent::SurveyResultsChanged {
            count: history.len(),
        });

        tracing::info!(entry_id = %entry.id, "Survey submitted, generating report");

        match self.generate_report(&history, &entry).await {
            Ok((report, is_latest)) => {
                tracing::info!(
                    entry_id = %entry.id,
                    report_id = %report.id,
                    risk_score = report.risk_score.value(),
                    urgency = %report.doctor_urgency,
                    stage = report.estimated_stage.number(),
                    is_latest,
                    "Report generated"
                );
                Ok(SubmissionOutcome {
                    entry,
                    report,
                    is_latest,
                })
            }
            Err(e) => {
                tracing::warn!(entry_id = %entry.id, error = %e, "Report generation failed");
                self.events.emit(PipelineEvent::ReportFailed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// `history` is the snapshot taken when `entry` was recorded; entries
    /// submitted later are not part of this report.
    async fn generate_report(
        &self,
        history: &[SurveyEntry],
        entry: &SurveyEntry,
    ) -> Result<(Report, bool), PipelineError> {
        let prompt = build_report_prompt(history, entry);

        let output = self
            .session
            .generate(Some(&prompt.system), &prompt.user)
            .await?;

        let report = parse_report_response(&output.text).map_err(|e| {
            tracing::debug!(raw_output = %output.text, "Unparseable model output");
            e
        })?;

        let dangling = report.dangling_markers();
        if !dangling.is_empty() {
            tracing::warn!(report_id = %report.id, markers = ?dangling, "Report cites markers with no evidence entry");
        }

        let stored = self.store.offer_report(report.clone(), entry.id).await?;
        if stored {
            self.events.emit(PipelineEvent::LatestReportChanged {
                report_id: report.id,
            });
        }
        Ok((report, stored))
    }

    /// Delete the entry at `index` (insertion order). The report is kept.
    pub async fn remove_survey(&self, index: usize) -> Result<SurveyEntry, PipelineError> {
        let removed = self.store.remove(index).await?;
        self.publish_survey_count().await;
        Ok(removed)
    }

    /// Delete every entry. The report is kept.
    pub async fn clear_surveys(&self) -> Result<(), PipelineError> {
        self.store.clear().await?;
        self.publish_survey_count().await;
        Ok(())
    }

    pub async fn survey_results(&self) -> Vec<SurveyEntry> {
        self.store.list().await
    }

    pub async fn latest_report(&self) -> Option<Report> {
        self.store.latest_report().await
    }

    pub fn download_progress(&self) -> f64 {
        self.session.download_progress()
    }

    pub fn is_generating(&self) -> bool {
        self.session.is_generating()
    }

    async fn publish_survey_count(&self) {
        let count = self.store.len().await;
        self.events.emit(PipelineEvent::SurveyResultsChanged { count });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DoctorUrgency, EstimatedStage, Symptom};
    use crate::pipeline::backend::{BackendError, MockBackend};
    use crate::pipeline::session::{SessionConfig, SessionError};
    use crate::pipeline::transcript::format_history;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    const REPORT_JSON: &str = r#"```json
{
  "risk_score": 42,
  "doctor_urgency": "Semi-urgent",
  "estimated_stage": 1,
  "report": "Fever and headache after outdoor time [1].",
  "evidence": ["[1] 2025-03-28: Symptoms: Fever or chills, Headache"]
}
```"#;

    const SECOND_JSON: &str = r#"{"risk_score": 10, "doctor_urgency": "Not urgent",
        "estimated_stage": 0, "report": "Low risk.", "evidence": []}"#;

    struct Harness {
        pipeline: ReportPipeline,
        backend: Arc<MockBackend>,
        events: UnboundedReceiver<PipelineEvent>,
        _dir: tempfile::TempDir,
    }

    async fn harness(backend: MockBackend) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SurveyStore::open(dir.path()).await.unwrap());
        let backend = Arc::new(backend);
        let (tx, rx) = unbounded_channel();
        let events: Arc<dyn EventSink> = Arc::new(tx);
        let session = Arc::new(GenerationSession::new(
            backend.clone(),
            SessionConfig {
                timeout: Duration::from_secs(5),
                ..SessionConfig::default()
            },
            Arc::clone(&events),
        ));
        Harness {
            pipeline: ReportPipeline::new(store, session, events),
            backend,
            events: rx,
            _dir: dir,
        }
    }

    fn answers() -> SurveyAnswers {
        SurveyAnswers {
            spent_time_outdoors: true,
            used_repellent: false,
            checked_for_ticks: true,
            found_ticks: false,
            symptoms: vec![Symptom::FeverOrChills, Symptom::Headache],
            notes: None,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn submission_stores_entry_and_report() {
        let mut h = harness(MockBackend::new(REPORT_JSON)).await;

        let outcome = h.pipeline.submit_survey(answers()).await.unwrap();

        let stored = h.pipeline.survey_results().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], outcome.entry);

        let transcript = format_history(&stored);
        assert!(transcript.contains("Found ticks: No"));
        assert!(transcript.contains("Symptoms: Fever or chills, Headache"));

        assert_eq!(outcome.report.risk_score.value(), 42);
        assert_eq!(outcome.report.doctor_urgency, DoctorUrgency::SemiUrgent);
        assert_eq!(outcome.report.estimated_stage, EstimatedStage::EarlyLocalized);
        assert_eq!(h.pipeline.latest_report().await, Some(outcome.report.clone()));

        let events = drain(&mut h.events);
        assert!(events.contains(&PipelineEvent::SurveyResultsChanged { count: 1 }));
        assert!(events.contains(&PipelineEvent::LatestReportChanged {
            report_id: outcome.report.id
        }));
        assert!(!h.pipeline.is_generating());
        assert_eq!(h.pipeline.download_progress(), 1.0);
    }

    #[tokio::test]
    async fn prompt_includes_full_history() {
        let h = harness(MockBackend::new(REPORT_JSON)).await;
        h.pipeline.submit_survey(answers()).await.unwrap();
        h.pipeline
            .submit_survey(SurveyAnswers {
                found_ticks: true,
                ..answers()
            })
            .await
            .unwrap();

        let request = h.backend.last_request().unwrap();
        assert_eq!(request.prompt.matches("Found ticks: No").count(), 1);
        // Latest entry shows in history and in the latest block.
        assert_eq!(request.prompt.matches("Found ticks: Yes").count(), 2);
        assert!(request.system.unwrap().contains("risk_score"));
    }

    #[tokio::test]
    async fn parse_failure_keeps_entry_and_old_report() {
        // The queued report is used first, then the unparseable default.
        let mut h =
            harness(MockBackend::new("I am unable to help.").then_respond(REPORT_JSON)).await;
        let first = h.pipeline.submit_survey(answers()).await.unwrap();
        assert_eq!(h.backend.generate_calls(), 1);

        let result = h.pipeline.submit_survey(answers()).await;
        assert!(matches!(result, Err(PipelineError::Parse(_))));
        assert_eq!(h.pipeline.survey_results().await.len(), 2);
        assert_eq!(h.pipeline.latest_report().await, Some(first.report));

        let failed = drain(&mut h.events)
            .into_iter()
            .filter(|e| matches!(e, PipelineEvent::ReportFailed { .. }))
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn generation_failure_keeps_entry() {
        let h = harness(MockBackend::new(REPORT_JSON).failing_generate(BackendError::Timeout(9)))
            .await;

        let result = h.pipeline.submit_survey(answers()).await;
        assert!(matches!(
            result,
            Err(PipelineError::BackendGeneration(SessionError::Generation(
                BackendError::Timeout(9)
            )))
        ));
        assert_eq!(h.pipeline.survey_results().await.len(), 1);
        assert!(h.pipeline.latest_report().await.is_none());

        // Session recovers for the next submission.
        let outcome = h.pipeline.submit_survey(answers()).await.unwrap();
        assert_eq!(outcome.report.risk_score.value(), 42);
        assert_eq!(h.pipeline.survey_results().await.len(), 2);
    }

    #[tokio::test]
    async fn init_failure_is_reported_as_backend_init() {
        let h = harness(MockBackend::new(REPORT_JSON).failing_init(BackendError::NotReachable))
            .await;

        let prepared = h.pipeline.prepare().await;
        assert!(matches!(prepared, Err(PipelineError::BackendInit(_))));

        let result = h.pipeline.submit_survey(answers()).await;
        assert!(matches!(result, Err(PipelineError::BackendInit(_))));
        assert_eq!(h.pipeline.survey_results().await.len(), 1);
    }

    #[tokio::test]
    async fn success_replaces_report() {
        let h = harness(MockBackend::new(SECOND_JSON).then_respond(REPORT_JSON)).await;
        let first = h.pipeline.submit_survey(answers()).await.unwrap();
        let second = h.pipeline.submit_survey(answers()).await.unwrap();

        assert_ne!(first.report.id, second.report.id);
        assert_eq!(second.report.risk_score.value(), 10);
        assert_eq!(h.pipeline.latest_report().await, Some(second.report));
    }

    #[tokio::test]
    async fn persistence_failure_skips_generation() {
        let h = harness(MockBackend::new(REPORT_JSON)).await;
        std::fs::remove_dir_all(h.pipeline.store.dir()).unwrap();

        let result = h.pipeline.submit_survey(answers()).await;
        assert!(matches!(result, Err(PipelineError::Persistence(_))));
        assert_eq!(h.backend.generate_calls(), 0);
        assert!(h.pipeline.survey_results().await.is_empty());
    }

    #[tokio::test]
    async fn remove_and_clear_keep_report() {
        let mut h = harness(MockBackend::new(REPORT_JSON)).await;
        for _ in 0..3 {
            h.pipeline.submit_survey(answers()).await.unwrap();
        }
        let report = h.pipeline.latest_report().await;
        drain(&mut h.events);

        h.pipeline.remove_survey(1).await.unwrap();
        assert_eq!(h.pipeline.survey_results().await.len(), 2);

        h.pipeline.clear_surveys().await.unwrap();
        assert!(h.pipeline.survey_results().await.is_empty());
        assert_eq!(h.pipeline.latest_report().await, report);

        assert_eq!(
            drain(&mut h.events),
            vec![
                PipelineEvent::SurveyResultsChanged { count: 2 },
                PipelineEvent::SurveyResultsChanged { count: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn remove_out_of_range_is_a_caller_error() {
        let h = harness(MockBackend::new(REPORT_JSON)).await;
        h.pipeline.submit_survey(answers()).await.unwrap();
        assert!(matches!(
            h.pipeline.remove_survey(3).await,
            Err(PipelineError::NoSuchSurvey { index: 3, len: 1 })
        ));
    }

    fn notes_in(block: &str) -> Vec<&str> {
        block
            .lines()
            .filter_map(|line| line.strip_prefix("Additional notes: "))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_label_their_own_entry_as_latest() {
        let h = harness(MockBackend::new(REPORT_JSON)).await;
        let pipeline = Arc::new(h.pipeline);

        let mut handles = Vec::new();
        for n in 0..16 {
            let pipeline = Arc::clone(&pipeline);
            handles.push(tokio::spawn(async move {
                pipeline
                    .submit_survey(SurveyAnswers {
                        notes: Some(format!("entry {n}")),
                        ..answers()
                    })
                    .await
                    .unwrap()
            }));
        }
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        let requests = h.backend.requests();
        assert_eq!(requests.len(), 16);
        for request in &requests {
            let (history, latest) = request.prompt.split_once("</history>").unwrap();
            let history_notes = notes_in(history);
            let latest_notes = notes_in(latest);
            assert_eq!(latest_notes.len(), 1);
            assert_eq!(history_notes.last(), latest_notes.first());
        }

        // The newest entry's report is the one kept.
        let stored = pipeline.survey_results().await;
        let newest = stored.last().unwrap();
        let newest_outcome = outcomes.iter().find(|o| o.entry.id == newest.id).unwrap();
        assert!(newest_outcome.is_latest);
        assert_eq!(
            pipeline.latest_report().await,
            Some(newest_outcome.report.clone())
        );
    }
}
