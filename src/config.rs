use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "Lymely";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "medgemma:4b";
pub const DEFAULT_MAX_OUTPUT_TOKENS: usize = 2048;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_PARTIAL_INTERVAL: usize = 4;

/// File holding the survey entry list.
pub const SURVEY_RESULTS_FILE: &str = "survey_results.json";
/// File holding the single latest report.
pub const LATEST_REPORT_FILE: &str = "latest_report.json";

/// Default tracing filter when `LYMELY_LOG` / `RUST_LOG` are unset.
pub fn default_log_filter() -> &'static str {
    "info,lymely_lib=debug,reqwest=warn"
}

/// Get the application data directory
/// ~/Lymely/ when a home directory is known, ./Lymely otherwise.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
}

/// Runtime configuration for the survey pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Where survey and report files live.
    pub data_dir: PathBuf,
    pub ollama_url: String,
    pub model: String,
    /// Hard cap on generated tokens per report.
    pub max_output_tokens: usize,
    /// Longest wait for the next token (or for model load) before failing.
    pub timeout: Duration,
    /// Publish partial output every N tokens.
    pub partial_interval: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: app_data_dir(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            partial_interval: DEFAULT_PARTIAL_INTERVAL,
        }
    }
}

impl AppConfig {
    /// Defaults overridden by `LYMELY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` but reads values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("LYMELY_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("LYMELY_OLLAMA_URL").filter(|v| !v.trim().is_empty()) {
            config.ollama_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(model) = lookup("LYMELY_MODEL").filter(|v| !v.trim().is_empty()) {
            config.model = model.trim().to_string();
        }
        if let Some(raw) = lookup("LYMELY_MAX_OUTPUT_TOKENS") {
            config.max_output_tokens = parse_positive("LYMELY_MAX_OUTPUT_TOKENS", &raw)? as usize;
        }
        if let Some(raw) = lookup("LYMELY_TIMEOUT_SECS") {
            config.timeout = Duration::from_secs(parse_positive("LYMELY_TIMEOUT_SECS", &raw)?);
        }

        Ok(config)
    }
}

fn parse_positive(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber {
            key,
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn app_data_dir_ends_with_app_name() {
        assert!(app_data_dir().ends_with("Lymely"));
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.ollama_url, "http://localhost:11434");
        assert_eq!(config.max_output_tokens, 2048);
        assert_eq!(config.partial_interval, 4);
    }

    #[test]
    fn env_overrides_apply() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("LYMELY_DATA_DIR", "/tmp/lymely-test"),
            ("LYMELY_OLLAMA_URL", "http://127.0.0.1:11500/"),
            ("LYMELY_MODEL", " llama3.2:3b "),
            ("LYMELY_MAX_OUTPUT_TOKENS", "512"),
            ("LYMELY_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/lymely-test"));
        assert_eq!(config.ollama_url, "http://127.0.0.1:11500");
        assert_eq!(config.model, "llama3.2:3b");
        assert_eq!(config.max_output_tokens, 512);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn invalid_number_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[("LYMELY_MAX_OUTPUT_TOKENS", "lots")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                key: "LYMELY_MAX_OUTPUT_TOKENS",
                value: "lots".into()
            }
        );
        assert!(AppConfig::from_lookup(lookup_from(&[("LYMELY_TIMEOUT_SECS", "0")])).is_err());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = AppConfig::from_lookup(lookup_from(&[("LYMELY_MODEL", "  ")])).unwrap();
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn app_name_is_lymely() {
        assert_eq!(APP_NAME, "Lymely");
    }
}
