//! Ollama HTTP backend for local inference.
//!
//! Survey answers never leave the machine: the base URL must be loopback.
//! Both `/api/pull` and `/api/generate` are consumed as NDJSON streams, one
//! JSON object per line.

use std::io::{self, BufRead, BufReader, Read};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use super::backend::{ceil_secs, BackendError, GenerationBackend, GenerationRequest};
use crate::config::AppConfig;

static MODEL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]*(/[a-zA-Z0-9][a-zA-Z0-9._-]*)?(:[a-zA-Z0-9._-]+)?$")
        .expect("static regex")
});

/// Validate that a base URL points to localhost only.
///
/// Accepts: localhost, 127.0.0.1, [::1].
pub fn validate_base_url(url: &str) -> Result<(), BackendError> {
    let after_scheme = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or(BackendError::InvalidUrl)?;

    let host = if let Some(bracketed) = after_scheme.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or("")
    } else {
        after_scheme
            .split(['/', ':'])
            .next()
            .unwrap_or("")
    };

    match host {
        "localhost" | "127.0.0.1" | "::1" => Ok(()),
        "" => Err(BackendError::InvalidUrl),
        _ => Err(BackendError::NonLocalEndpoint),
    }
}

/// Validate a model name: `[namespace/]model[:tag]`, one namespace at most.
///
/// Valid: `medgemma:4b`, `alibayram/medgemma`
/// Invalid: `../etc/passwd`, `; rm -rf /`, `a/b/c`
pub fn validate_model_name(name: &str) -> Result<(), BackendError> {
    if MODEL_NAME.is_match(name) {
        Ok(())
    } else {
        Err(BackendError::InvalidModelName(name.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

#[derive(Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

/// One NDJSON line from `/api/pull`.
#[derive(Debug, Clone, Deserialize)]
struct PullProgress {
    #[serde(default)]
    status: String,
    total: Option<u64>,
    completed: Option<u64>,
    error: Option<String>,
}

impl PullProgress {
    fn fraction(&self) -> Option<f64> {
        if self.status == "success" {
            return Some(1.0);
        }
        match (self.completed, self.total) {
            (Some(done), Some(total)) if total > 0 => Some(done as f64 / total as f64),
            _ => None,
        }
    }
}

/// Low temperature keeps the JSON output stable across runs.
#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    num_predict: usize,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

/// One NDJSON line from `/api/generate`.
#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

// ═══════════════════════════════════════════════════════════
// OllamaBackend
// ═══════════════════════════════════════════════════════════

pub struct OllamaBackend {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl std::fmt::Debug for OllamaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaBackend")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OllamaBackend {
    /// Create a backend for `model` at `base_url` (loopback only).
    ///
    /// `timeout` bounds connecting and each read of the response; a long
    /// pull or generation keeps going as long as data arrives.
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, BackendError> {
        let base_url = base_url.trim_end_matches('/');
        validate_base_url(base_url)?;
        validate_model_name(model)?;

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.to_string(),
            model: model.to_string(),
            client,
            timeout_secs: ceil_secs(timeout),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, BackendError> {
        Self::new(&config.ollama_url, &config.model, config.timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Installed model names.
    pub fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| self.map_request_error(e))?;
        let response = check_status(response)?;

        let parsed: TagsResponse = response
            .json()
            .map_err(|e| BackendError::ResponseParsing(e.to_string()))?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    pub fn is_model_installed(&self) -> Result<bool, BackendError> {
        let installed = self.list_models()?;
        Ok(installed.iter().any(|name| model_matches(name, &self.model)))
    }

    fn pull(&self, progress: &UnboundedSender<f64>) -> Result<(), BackendError> {
        tracing::info!(model = %self.model, "Pulling model");
        let url = format!("{}/api/pull", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&PullRequest {
                model: &self.model,
                stream: true,
            })
            .send()
            .map_err(|e| self.map_request_error(e))?;
        let response = check_status(response)?;

        let mut succeeded = false;
        for_each_line(response, self.timeout_secs, |line| {
            let event: PullProgress = serde_json::from_str(line)
                .map_err(|e| BackendError::ResponseParsing(e.to_string()))?;
            if let Some(error) = event.error {
                return Err(BackendError::PullFailed(error));
            }
            if let Some(fraction) = event.fraction() {
                let _ = progress.send(fraction);
            }
            if event.status == "success" {
                succeeded = true;
                return Ok(LineFlow::Stop);
            }
            Ok(LineFlow::Continue)
        })?;

        if succeeded {
            tracing::info!(model = %self.model, "Model pull complete");
            Ok(())
        } else {
            Err(BackendError::PullFailed(
                "the download ended before completing".into(),
            ))
        }
    }

    fn map_request_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_connect() {
            BackendError::NotReachable
        } else if e.is_timeout() {
            BackendError::Timeout(self.timeout_secs)
        } else {
            BackendError::Network(e.to_string())
        }
    }
}

impl GenerationBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn initialize(&self, progress: UnboundedSender<f64>) -> Result<(), BackendError> {
        if self.is_model_installed()? {
            tracing::debug!(model = %self.model, "Model already installed");
            let _ = progress.send(1.0);
            return Ok(());
        }
        self.pull(&progress)?;
        let _ = progress.send(1.0);
        Ok(())
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        tokens: UnboundedSender<String>,
    ) -> Result<(), BackendError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt: &request.prompt,
            system: request.system.as_deref(),
            stream: true,
            options: GenerateOptions {
                temperature: 0.1,
                top_p: 0.9,
                num_predict: request.max_tokens,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.map_request_error(e))?;
        let response = check_status(response)?;

        for_each_line(response, self.timeout_secs, |line| {
            let chunk: GenerateChunk = serde_json::from_str(line)
                .map_err(|e| BackendError::ResponseParsing(e.to_string()))?;
            if let Some(message) = chunk.error {
                return Err(BackendError::Api {
                    status: 200,
                    message,
                });
            }
            if !chunk.response.is_empty() && tokens.send(chunk.response).is_err() {
                // Consumer stopped listening; dropping the response closes
                // the connection and Ollama stops generating.
                return Ok(LineFlow::Stop);
            }
            if chunk.done {
                return Ok(LineFlow::Stop);
            }
            Ok(LineFlow::Continue)
        })
    }
}

enum LineFlow {
    Continue,
    Stop,
}

/// Feed each non-empty line of an NDJSON body to `handle`.
///
/// A read that times out becomes `BackendError::Timeout(timeout_secs)`.
fn for_each_line<R, F>(body: R, timeout_secs: u64, mut handle: F) -> Result<(), BackendError>
where
    R: Read,
    F: FnMut(&str) -> Result<LineFlow, BackendError>,
{
    let reader = BufReader::new(body);
    for line in reader.lines() {
        let line = line.map_err(|e| {
            if is_read_timeout(&e) {
                BackendError::Timeout(timeout_secs)
            } else {
                BackendError::Network(e.to_string())
            }
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let LineFlow::Stop = handle(line)? {
            break;
        }
    }
    Ok(())
}

/// reqwest reports a body read timeout as an io error wrapping its own
/// timeout error.
fn is_read_timeout(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::TimedOut
        || e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout)
}

fn check_status(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    if status.as_u16() == 404 && body.contains("not found") {
        return Err(BackendError::ModelNotFound(body));
    }
    Err(BackendError::Api {
        status: status.as_u16(),
        message: body,
    })
}

/// `medgemma` matches an installed `medgemma:latest`.
fn model_matches(installed: &str, wanted: &str) -> bool {
    if installed == wanted {
        return true;
    }
    !wanted.contains(':') && installed.strip_suffix(":latest") == Some(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn loopback_urls_accepted() {
        for url in [
            "http://localhost:11434",
            "http://127.0.0.1:11434",
            "https://localhost",
            "http://[::1]:11434",
            "http://localhost/",
        ] {
            assert!(validate_base_url(url).is_ok(), "{url}");
        }
    }

    #[test]
    fn remote_urls_rejected() {
        assert_eq!(
            validate_base_url("http://192.168.1.5:11434"),
            Err(BackendError::NonLocalEndpoint)
        );
        assert_eq!(
            validate_base_url("http://localhost.evil.com"),
            Err(BackendError::NonLocalEndpoint)
        );
        assert_eq!(validate_base_url("localhost:11434"), Err(BackendError::InvalidUrl));
        assert_eq!(validate_base_url("ftp://localhost"), Err(BackendError::InvalidUrl));
    }

    #[test]
    fn model_names_validated() {
        for name in ["medgemma:4b", "alibayram/medgemma", "llama3.1:8b-q4_K_M"] {
            assert!(validate_model_name(name).is_ok(), "{name}");
        }
        for name in ["", "../etc/passwd", "; rm -rf /", "a/b/c", "/medgemma", "m:"] {
            assert!(validate_model_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn constructor_trims_and_validates() {
        let backend =
            OllamaBackend::new("http://localhost:11434/", "medgemma:4b", Duration::from_secs(5))
                .unwrap();
        assert_eq!(backend.base_url(), "http://localhost:11434");
        assert_eq!(backend.model(), "medgemma:4b");
        assert_eq!(backend.name(), "ollama");

        assert!(matches!(
            OllamaBackend::new("http://10.0.0.1:11434", "medgemma", Duration::from_secs(5)),
            Err(BackendError::NonLocalEndpoint)
        ));
        assert!(matches!(
            OllamaBackend::new("http://localhost:11434", "bad name", Duration::from_secs(5)),
            Err(BackendError::InvalidModelName(_))
        ));
    }

    #[test]
    fn unreachable_server_maps_to_not_reachable() {
        // Port 9 (discard) is closed on any sane test machine.
        let backend =
            OllamaBackend::new("http://127.0.0.1:9", "medgemma:4b", Duration::from_secs(2))
                .unwrap();
        let (tx, _rx) = unbounded_channel();
        assert_eq!(backend.initialize(tx), Err(BackendError::NotReachable));
    }

    #[test]
    fn pull_progress_fraction() {
        let line = r#"{"status":"downloading sha256:abc","digest":"sha256:abc","total":200,"completed":50}"#;
        let event: PullProgress = serde_json::from_str(line).unwrap();
        assert_eq!(event.fraction(), Some(0.25));

        let event: PullProgress = serde_json::from_str(r#"{"status":"pulling manifest"}"#).unwrap();
        assert_eq!(event.fraction(), None);

        let event: PullProgress = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert_eq!(event.fraction(), Some(1.0));
    }

    #[test]
    fn pull_error_line_decodes() {
        let event: PullProgress =
            serde_json::from_str(r#"{"error":"pull model manifest: file does not exist"}"#).unwrap();
        assert!(event.error.is_some());
        assert_eq!(event.status, "");
    }

    #[test]
    fn generate_stream_lines() {
        let body = concat!(
            r#"{"model":"medgemma:4b","response":"{\"risk","done":false}"#,
            "\n\n",
            r#"{"model":"medgemma:4b","response":"_score\"","done":false}"#,
            "\n",
            r#"{"model":"medgemma:4b","response":"","done":true,"eval_count":2}"#,
            "\n",
            r#"{"model":"medgemma:4b","response":"ignored","done":false}"#,
            "\n",
        );
        let mut collected = Vec::new();
        for_each_line(body.as_bytes(), 5, |line| {
            let chunk: GenerateChunk = serde_json::from_str(line).unwrap();
            if !chunk.response.is_empty() {
                collected.push(chunk.response);
            }
            Ok(if chunk.done { LineFlow::Stop } else { LineFlow::Continue })
        })
        .unwrap();
        assert_eq!(collected.concat(), "{\"risk_score\"");
    }

    #[test]
    fn handler_error_stops_stream() {
        let body = "{\"error\":\"model crashed\"}\n{\"response\":\"x\"}\n";
        let mut seen = 0;
        let result = for_each_line(body.as_bytes(), 5, |line| {
            seen += 1;
            let chunk: GenerateChunk = serde_json::from_str(line).unwrap();
            match chunk.error {
                Some(message) => Err(BackendError::Api { status: 200, message }),
                None => Ok(LineFlow::Continue),
            }
        });
        assert_eq!(seen, 1);
        assert!(matches!(result, Err(BackendError::Api { .. })));
    }

    struct TimingOutReader;

    impl Read for TimingOutReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
        }
    }

    #[test]
    fn read_timeout_maps_to_timeout() {
        let result = for_each_line(TimingOutReader, 7, |_| Ok(LineFlow::Continue));
        assert_eq!(result, Err(BackendError::Timeout(7)));
    }

    #[test]
    fn silent_server_mid_stream_times_out() {
        use std::io::Write;
        use std::net::TcpListener;
        use std::time::Instant;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request);
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Type: application/x-ndjson\r\n\
                      Transfer-Encoding: chunked\r\n\r\n",
                )
                .unwrap();
            socket.flush().unwrap();
            // Headers sent, then nothing.
            std::thread::sleep(Duration::from_secs(10));
        });

        let backend = OllamaBackend::new(
            &format!("http://127.0.0.1:{port}"),
            "medgemma:4b",
            Duration::from_secs(1),
        )
        .unwrap();
        let request = GenerationRequest::new(None, "hello", true, 16);
        let (tx, _rx) = unbounded_channel();

        let started = Instant::now();
        let result = backend.generate(&request, tx);
        assert_eq!(result, Err(BackendError::Timeout(1)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn sub_second_timeout_reports_one_second() {
        let backend =
            OllamaBackend::new("http://localhost:11434", "medgemma:4b", Duration::from_millis(300))
                .unwrap();
        assert_eq!(backend.timeout_secs, 1);
    }

    #[test]
    fn generate_request_omits_missing_system() {
        let body = GenerateRequest {
            model: "medgemma:4b",
            prompt: "p",
            system: None,
            stream: true,
            options: GenerateOptions {
                temperature: 0.1,
                top_p: 0.9,
                num_predict: 64,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("system").is_none());
        assert_eq!(json["stream"], true);
        assert_eq!(json["options"]["num_predict"], 64);
    }

    #[test]
    fn installed_model_matching() {
        assert!(model_matches("medgemma:4b", "medgemma:4b"));
        assert!(model_matches("medgemma:latest", "medgemma"));
        assert!(!model_matches("medgemma:27b", "medgemma:4b"));
        assert!(!model_matches("medgemma:27b", "medgemma"));
    }
}
