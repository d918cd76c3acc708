pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod pipeline;
pub mod store;

use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::events::{EventSink, PipelineEvent};
use crate::models::SurveyAnswers;
use crate::pipeline::ollama::OllamaBackend;
use crate::pipeline::{GenerationSession, ReportPipeline, SessionConfig};
use crate::store::SurveyStore;

/// Read one survey as JSON from stdin, generate a report with the local
/// model and print it as JSON on stdout. Logs go to stderr.
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("LYMELY_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(submit_from_stdin()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Survey submission failed");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("Could not read the survey from stdin: {0}")]
    Input(#[from] std::io::Error),

    #[error("The survey is not valid JSON: {0}")]
    Survey(#[from] serde_json::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

async fn submit_from_stdin() -> Result<(), CliError> {
    let config = AppConfig::from_env().map_err(PipelineError::from)?;

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let answers: SurveyAnswers = serde_json::from_str(&input)?;

    let store = Arc::new(
        SurveyStore::open(&config.data_dir)
            .await
            .map_err(PipelineError::from)?,
    );
    let backend = Arc::new(OllamaBackend::from_config(&config).map_err(PipelineError::from)?);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<PipelineEvent>();
    let events: Arc<dyn EventSink> = Arc::new(tx);
    let session = Arc::new(GenerationSession::new(
        backend,
        SessionConfig::from(&config),
        Arc::clone(&events),
    ));
    let pipeline = ReportPipeline::new(store, session, events);

    let progress_log = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                PipelineEvent::DownloadProgress { fraction } => {
                    tracing::info!(percent = (fraction * 100.0).round(), "Model download");
                }
                PipelineEvent::PartialOutput { token_count, .. } => {
                    tracing::trace!(token_count, "Partial output");
                }
                other => tracing::debug!(event = other.name(), "Pipeline event"),
            }
        }
    });

    let outcome = pipeline.submit_survey(answers).await;
    drop(pipeline);
    let _ = progress_log.await;

    let outcome = outcome?;
    println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    Ok(())
}
