//! Text-generation backend abstraction.
//!
//! Backends are blocking (HTTP or on-device inference); the session runs
//! them on the blocking pool. Output flows back through channels:
//! - load progress as fractions in [0, 1]
//! - generated text one token (chunk) at a time
//!
//! A closed token channel means the consumer stopped listening (token
//! limit, degeneration, timeout). Backends should then stop and return.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Errors a backend can report. Messages are complete sentences.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("The model server is not running. Start it to enable reports")]
    NotReachable,

    #[error("The model server returned an error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Model '{0}' is not installed")]
    ModelNotFound(String),

    #[error("Invalid model name: '{0}'")]
    InvalidModelName(String),

    #[error("Only localhost connections are allowed for health data")]
    NonLocalEndpoint,

    #[error("Invalid URL format")]
    InvalidUrl,

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Model download failed: {0}")]
    PullFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Could not read the model server response: {0}")]
    ResponseParsing(String),
}

/// One generation call as seen by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Separate system segment, only set when the backend supports roles.
    pub system: Option<String>,
    pub prompt: String,
    /// Upper bound hint; the session enforces it regardless.
    pub max_tokens: usize,
}

impl GenerationRequest {
    /// Build a request, folding `system` into the prompt text when the
    /// backend has no system role.
    pub fn new(
        system: Option<&str>,
        prompt: &str,
        supports_system_role: bool,
        max_tokens: usize,
    ) -> Self {
        match system {
            Some(system) if supports_system_role => Self {
                system: Some(system.to_string()),
                prompt: prompt.to_string(),
                max_tokens,
            },
            Some(system) => Self {
                system: None,
                prompt: format!("{}\n\n{}", system.trim(), prompt),
                max_tokens,
            },
            None => Self {
                system: None,
                prompt: prompt.to_string(),
                max_tokens,
            },
        }
    }
}

/// Capability to load a model and stream text from it.
pub trait GenerationBackend: Send + Sync {
    /// Short identifier for logs ("ollama", "mock").
    fn name(&self) -> &str;

    /// Whether a distinct system segment is honoured.
    fn supports_system_role(&self) -> bool {
        true
    }

    /// Load or download the model, reporting fractional progress.
    fn initialize(&self, progress: UnboundedSender<f64>) -> Result<(), BackendError>;

    /// Generate text for `request`, sending each token as it is produced.
    /// Returning `Ok(())` signals completion.
    fn generate(
        &self,
        request: &GenerationRequest,
        tokens: UnboundedSender<String>,
    ) -> Result<(), BackendError>;
}

/// Scripted backend for tests and offline demos.
///
/// Responses are split into word-sized tokens. Queued responses are used
/// once each, in order; after that the default response repeats.
pub struct MockBackend {
    default_response: String,
    queued_responses: Mutex<VecDeque<String>>,
    progress_steps: Vec<f64>,
    init_failure: Option<BackendError>,
    generate_failures: Mutex<VecDeque<BackendError>>,
    token_delay: Duration,
    system_role: bool,
    init_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockBackend {
    pub fn new(response: &str) -> Self {
        Self {
            default_response: response.to_string(),
            queued_responses: Mutex::new(VecDeque::new()),
            progress_steps: vec![0.25, 0.5, 1.0],
            init_failure: None,
            generate_failures: Mutex::new(VecDeque::new()),
            token_delay: Duration::ZERO,
            system_role: true,
            init_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Respond with `response` on the next unused call.
    pub fn then_respond(self, response: &str) -> Self {
        if let Ok(mut queue) = self.queued_responses.lock() {
            queue.push_back(response.to_string());
        }
        self
    }

    pub fn with_progress_steps(mut self, steps: Vec<f64>) -> Self {
        self.progress_steps = steps;
        self
    }

    pub fn failing_init(mut self, error: BackendError) -> Self {
        self.init_failure = Some(error);
        self
    }

    /// Fail the next generate call with `error` (queued, one per call).
    pub fn failing_generate(self, error: BackendError) -> Self {
        if let Ok(mut queue) = self.generate_failures.lock() {
            queue.push_back(error);
        }
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn without_system_role(mut self) -> Self {
        self.system_role = false;
        self
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.requests.lock().ok()?.last().cloned()
    }

    /// Every request received, in call order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn next_response(&self) -> String {
        self.queued_responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_else(|| self.default_response.clone())
    }
}

/// Whole seconds in `duration`, rounded up, for `BackendError::Timeout`.
pub fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Split text into tokens that concatenate back to the original.
pub fn split_tokens(text: &str) -> Vec<String> {
    text.split_inclusive(char::is_whitespace)
        .map(str::to_string)
        .collect()
}

impl GenerationBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports_system_role(&self) -> bool {
        self.system_role
    }

    fn initialize(&self, progress: UnboundedSender<f64>) -> Result<(), BackendError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref error) = self.init_failure {
            let _ = progress.send(0.1);
            return Err(error.clone());
        }
        for step in &self.progress_steps {
            let _ = progress.send(*step);
        }
        Ok(())
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        tokens: UnboundedSender<String>,
    ) -> Result<(), BackendError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let failure = self
            .generate_failures
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        if let Some(error) = failure {
            return Err(error);
        }

        for token in split_tokens(&self.next_response()) {
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            if tokens.send(token).is_err() {
                // Consumer stopped listening.
                return Ok(());
            }
        }
        Ok(())
    }
}
