//! State-change notifications for whatever UI hosts the core.
//!
//! The core never binds to a UI framework. It pushes `PipelineEvent`s into an
//! `EventSink`; the host forwards them however it likes (channel, FFI
//! callback, websocket). Event payloads serialize with a `type` tag.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// The survey list changed (append, remove, clear).
    SurveyResultsChanged { count: usize },
    /// A new report replaced the stored one.
    LatestReportChanged { report_id: Uuid },
    /// Model load/download progress in [0, 1].
    DownloadProgress { fraction: f64 },
    GenerationStarted { generation: u64 },
    /// Text produced so far for one generation, published in batches.
    PartialOutput {
        generation: u64,
        text: String,
        token_count: usize,
    },
    GenerationFinished {
        generation: u64,
        token_count: usize,
        tokens_per_second: f64,
    },
    GenerationFailed { generation: u64, message: String },
    /// Report generation for a submitted survey did not produce a report.
    ReportFailed { message: String },
}

impl PipelineEvent {
    /// Event name for hosts that dispatch by string.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SurveyResultsChanged { .. } => "survey-results-changed",
            Self::LatestReportChanged { .. } => "latest-report-changed",
            Self::DownloadProgress { .. } => "download-progress",
            Self::GenerationStarted { .. } => "generation-started",
            Self::PartialOutput { .. } => "partial-output",
            Self::GenerationFinished { .. } => "generation-finished",
            Self::GenerationFailed { .. } => "generation-failed",
            Self::ReportFailed { .. } => "report-failed",
        }
    }
}

/// Receiver of pipeline events. Emitting never blocks and never fails.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: PipelineEvent) {}
}

impl EventSink for broadcast::Sender<PipelineEvent> {
    fn emit(&self, event: PipelineEvent) {
        // No subscribers is not an error for the core.
        let _ = self.send(event);
    }
}

impl EventSink for mpsc::UnboundedSender<PipelineEvent> {
    fn emit(&self, event: PipelineEvent) {
        if self.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}
