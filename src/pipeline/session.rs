//! Generation session: lifecycle of one backend instance.
//!
//! States: Uninitialized → Initializing → Ready ⇄ Generating, with a
//! terminal Failed reachable from Initializing. A generation failure only
//! fails that call; the session goes back to Ready.
//!
//! At most one generation runs at a time. Concurrent callers wait on a fair
//! async mutex, so they are served in arrival order and their partial output
//! never interleaves.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::JoinHandle;

use super::backend::{ceil_secs, BackendError, GenerationBackend, GenerationRequest};
use super::stream_guard::{Degeneration, StreamGuard, StreamGuardConfig};
use crate::config::AppConfig;
use crate::events::{EventSink, PipelineEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Generating,
    /// Initialization failed; this session can no longer be used.
    Failed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Generating => write!(f, "generating"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Model initialization failed: {0}")]
    Init(BackendError),

    #[error("The model session failed earlier and cannot be used: {0}")]
    Unrecoverable(String),

    #[error("Generation failed: {0}")]
    Generation(BackendError),

    #[error("No output from the model for {0:?}")]
    Timeout(Duration),

    #[error("The previous generation is still running after {0:?}")]
    Stalled(Duration),

    #[error("Model output degenerated: {0}")]
    Degenerate(Degeneration),

    #[error("Background task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The backend signalled completion.
    Completed,
    /// The output cap was reached and the stream was cut.
    TokenLimit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub token_count: usize,
    pub elapsed: Duration,
    pub tokens_per_second: f64,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub max_output_tokens: usize,
    /// Publish partial output every N tokens.
    pub partial_interval: usize,
    /// Longest gap between progress updates or tokens.
    pub timeout: Duration,
    pub guard: StreamGuardConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SessionConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_output_tokens: config.max_output_tokens,
            partial_interval: config.partial_interval.max(1),
            timeout: config.timeout,
            guard: StreamGuardConfig::default(),
        }
    }
}

pub struct GenerationSession {
    backend: Arc<dyn GenerationBackend>,
    config: SessionConfig,
    events: Arc<dyn EventSink>,
    state: Mutex<SessionState>,
    progress: Mutex<f64>,
    init_lock: tokio::sync::Mutex<()>,
    /// The slot for the single in-flight generation. Holds the backend task
    /// of a generation that timed out and has not finished yet.
    generation_lock: tokio::sync::Mutex<Option<BackendTask>>,
    generation_counter: AtomicU64,
}

type BackendTask = JoinHandle<Result<(), BackendError>>;

impl GenerationSession {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        config: SessionConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            backend,
            config,
            events,
            state: Mutex::new(SessionState::Uninitialized),
            progress: Mutex::new(0.0),
            init_lock: tokio::sync::Mutex::new(()),
            generation_lock: tokio::sync::Mutex::new(None),
            generation_counter: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| SessionState::Failed("state lock poisoned".into()))
    }

    pub fn is_generating(&self) -> bool {
        self.state() == SessionState::Generating
    }

    /// Model load progress in [0, 1].
    pub fn download_progress(&self) -> f64 {
        self.progress.lock().map(|p| *p).unwrap_or(0.0)
    }

    /// Load the model. Returns immediately when already loaded.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        let _init = self.init_lock.lock().await;

        match self.state() {
            SessionState::Ready | SessionState::Generating => return Ok(()),
            SessionState::Failed(reason) => return Err(SessionError::Unrecoverable(reason)),
            SessionState::Uninitialized | SessionState::Initializing => {}
        }

        self.set_state(SessionState::Initializing);
        tracing::info!(backend = self.backend.name(), "Initializing generation backend");

        let (progress_tx, mut progress_rx) = unbounded_channel::<f64>();
        let backend = Arc::clone(&self.backend);
        let task = tokio::task::spawn_blocking(move || backend.initialize(progress_tx));

        loop {
            match tokio::time::timeout(self.config.timeout, progress_rx.recv()).await {
                Ok(Some(fraction)) => self.report_progress(fraction),
                Ok(None) => break,
                Err(_) => {
                    let error = BackendError::Timeout(ceil_secs(self.config.timeout));
                    return Err(self.fail_init(error));
                }
            }
        }

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = format!("initialization task failed: {e}");
                self.set_state(SessionState::Failed(reason.clone()));
                tracing::error!(error = %e, "Backend initialization task panicked");
                return Err(SessionError::Task(reason));
            }
        };

        match outcome {
            Ok(()) => {
                self.report_progress(1.0);
                self.set_state(SessionState::Ready);
                tracing::info!(backend = self.backend.name(), "Generation backend ready");
                Ok(())
            }
            Err(e) => Err(self.fail_init(e)),
        }
    }

    /// Run one generation. Initializes first if needed; waits its turn if
    /// another generation is in flight.
    pub async fn generate(
        &self,
        system: Option<&str>,
        prompt: &str,
    ) -> Result<GenerationOutput, SessionError> {
        self.initialize().await?;

        let mut slot = self.generation_lock.lock().await;
        self.settle_stalled(&mut slot).await?;
        let generation = self.generation_counter.fetch_add(1, Ordering::SeqCst) + 1;

        self.set_state(SessionState::Generating);
        self.events.emit(PipelineEvent::GenerationStarted { generation });

        let request = GenerationRequest::new(
            system,
            prompt,
            self.backend.supports_system_role(),
            self.config.max_output_tokens,
        );
        let result = self.run_generation(generation, request, &mut slot).await;

        self.set_state(SessionState::Ready);

        match &result {
            Ok(output) => {
                tracing::info!(
                    generation,
                    tokens = output.token_count,
                    tokens_per_second = output.tokens_per_second,
                    stop_reason = ?output.stop_reason,
                    "Generation finished"
                );
                self.events.emit(PipelineEvent::GenerationFinished {
                    generation,
                    token_count: output.token_count,
                    tokens_per_second: output.tokens_per_second,
                });
            }
            Err(e) => {
                tracing::warn!(generation, error = %e, "Generation failed");
                self.events.emit(PipelineEvent::GenerationFailed {
                    generation,
                    message: e.to_string(),
                });
            }
        }

        result
    }

    /// The receive loop. Each iteration is a suspension point, so a cancel
    /// signal can be added as another branch of the timeout select.
    async fn run_generation(
        &self,
        generation: u64,
        request: GenerationRequest,
        stalled: &mut Option<BackendTask>,
    ) -> Result<GenerationOutput, SessionError> {
        let (token_tx, mut token_rx) = unbounded_channel::<String>();
        let backend = Arc::clone(&self.backend);
        let task = tokio::task::spawn_blocking(move || backend.generate(&request, token_tx));

        let mut guard = StreamGuard::new(self.config.guard.clone());
        let mut text = String::new();
        let mut token_count = 0usize;
        let mut unpublished = 0usize;
        let started = Instant::now();

        let stop_reason = loop {
            let next = match tokio::time::timeout(self.config.timeout, token_rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    // The next generation waits for this task before starting.
                    drop(token_rx);
                    *stalled = Some(task);
                    return Err(SessionError::Timeout(self.config.timeout));
                }
            };

            let Some(token) = next else {
                break StopReason::Completed;
            };

            token_count += 1;
            unpublished += 1;
            text.push_str(&token);

            if let Err(degeneration) = guard.feed(&token) {
                drop(token_rx);
                let _ = self.join_backend(task, stalled).await;
                return Err(SessionError::Degenerate(degeneration));
            }

            if unpublished >= self.config.partial_interval {
                self.publish_partial(generation, &text, token_count);
                unpublished = 0;
            }

            if token_count >= self.config.max_output_tokens {
                break StopReason::TokenLimit;
            }
        };

        // Closing the channel tells the backend to stop if it is still going.
        drop(token_rx);
        if unpublished > 0 {
            self.publish_partial(generation, &text, token_count);
        }

        self.join_backend(task, stalled)
            .await?
            .map_err(SessionError::Generation)?;

        let elapsed = started.elapsed();
        let tokens_per_second = if token_count == 0 {
            0.0
        } else {
            token_count as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        };

        Ok(GenerationOutput {
            text,
            token_count,
            elapsed,
            tokens_per_second,
            stop_reason,
        })
    }

    /// Wait for the backend task to return. If it does not return within
    /// the timeout it is parked in `stalled`.
    async fn join_backend(
        &self,
        mut task: BackendTask,
        stalled: &mut Option<BackendTask>,
    ) -> Result<Result<(), BackendError>, SessionError> {
        match tokio::time::timeout(self.config.timeout, &mut task).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(SessionError::Task(e.to_string())),
            Err(_) => {
                *stalled = Some(task);
                Err(SessionError::Timeout(self.config.timeout))
            }
        }
    }

    /// Give a backend task left over from a timed-out generation up to one
    /// timeout to finish. A new backend call never starts while it runs.
    async fn settle_stalled(&self, stalled: &mut Option<BackendTask>) -> Result<(), SessionError> {
        let Some(mut task) = stalled.take() else {
            return Ok(());
        };
        tracing::debug!("Waiting for the previous backend call to return");
        match tokio::time::timeout(self.config.timeout, &mut task).await {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!("Previous backend call is still running");
                *stalled = Some(task);
                Err(SessionError::Stalled(self.config.timeout))
            }
        }
    }

    fn publish_partial(&self, generation: u64, text: &str, token_count: usize) {
        self.events.emit(PipelineEvent::PartialOutput {
            generation,
            text: text.to_string(),
            token_count,
        });
    }

    /// Record progress, clamped to [0, 1] and never moving backwards.
    fn report_progress(&self, fraction: f64) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        let advanced = match self.progress.lock() {
            Ok(mut current) if fraction > *current => {
                *current = fraction;
                true
            }
            _ => false,
        };
        if advanced {
            self.events.emit(PipelineEvent::DownloadProgress { fraction });
        }
    }

    fn fail_init(&self, error: BackendError) -> SessionError {
        tracing::error!(backend = self.backend.name(), error = %error, "Backend initialization failed");
        self.set_state(SessionState::Failed(error.to_string()));
        SessionError::Init(error)
    }

    fn set_state(&self, next: SessionState) {
        if let Ok(mut state) = self.state.lock() {
            tracing::debug!(from = %*state, to = %next, "Session state change");
            *state = next;
        }
    }
}
