//! Survey record store: the single owner of persisted survey data.
//!
//! Holds the append-only survey entry list and the one "latest report"
//! slot. Each is persisted as its own JSON file under the data directory.
//!
//! Writes go to a temp file in the same directory and are renamed over the
//! target, so a crash never leaves a half-written file. Every mutation holds
//! one async lock for its full duration (single writer), and a failed write
//! rolls the in-memory state back to the last durable state.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{LATEST_REPORT_FILE, SURVEY_RESULTS_FILE};
use crate::models::{Report, SurveyAnswers, SurveyEntry};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Could not access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stored file {path} is not valid: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Could not encode data for storage: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("No survey entry at position {index} (store holds {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Storage task failed: {0}")]
    Task(String),
}

#[derive(Debug, Default)]
struct StoreState {
    entries: Vec<SurveyEntry>,
    latest_report: Option<Report>,
    /// Entry whose submission produced `latest_report`, when known in this
    /// process. Not persisted.
    report_source: Option<Uuid>,
}

/// Persisted survey entries plus the latest report.
#[derive(Debug)]
pub struct SurveyStore {
    dir: PathBuf,
    state: Mutex<StoreState>,
}

impl SurveyStore {
    /// Open (or create) the store rooted at `dir`.
    ///
    /// Missing files mean empty state; unreadable files are errors so that
    /// a corrupt history is never silently replaced by an empty one.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        let load_dir = dir.clone();
        let state = run_blocking(move || {
            std::fs::create_dir_all(&load_dir).map_err(|source| StoreError::Io {
                path: load_dir.clone(),
                source,
            })?;
            let entries: Vec<SurveyEntry> =
                read_json(&load_dir.join(SURVEY_RESULTS_FILE))?.unwrap_or_default();
            let latest_report: Option<Report> =
                read_json::<Option<Report>>(&load_dir.join(LATEST_REPORT_FILE))?.flatten();
            Ok(StoreState {
                entries,
                latest_report,
                report_source: None,
            })
        })
        .await?;

        tracing::info!(
            dir = %dir.display(),
            entries = state.entries.len(),
            has_report = state.latest_report.is_some(),
            "Survey store opened"
        );

        Ok(Self {
            dir,
            state: Mutex::new(state),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Add an entry to the end of the list and persist it.
    pub async fn append(&self, entry: SurveyEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry_id = entry.id;
        state.entries.push(entry);

        if let Err(e) = self.persist_entries(&state.entries).await {
            state.entries.pop();
            tracing::error!(entry_id = %entry_id, error = %e, "Failed to persist survey entry");
            return Err(e);
        }

        tracing::debug!(entry_id = %entry_id, total = state.entries.len(), "Survey entry appended");
        Ok(())
    }

    /// Create an entry from `answers`, append it, and return it together
    /// with the history up to and including it.
    ///
    /// The entry is stamped inside the write lock, so insertion order and
    /// timestamp order agree.
    pub async fn record(
        &self,
        answers: SurveyAnswers,
    ) -> Result<(SurveyEntry, Vec<SurveyEntry>), StoreError> {
        let mut state = self.state.lock().await;
        let entry = SurveyEntry::new(answers);
        state.entries.push(entry.clone());

        if let Err(e) = self.persist_entries(&state.entries).await {
            state.entries.pop();
            tracing::error!(entry_id = %entry.id, error = %e, "Failed to persist survey entry");
            return Err(e);
        }

        tracing::debug!(entry_id = %entry.id, total = state.entries.len(), "Survey entry recorded");
        Ok((entry, state.entries.clone()))
    }

    /// All entries in insertion order.
    pub async fn list(&self) -> Vec<SurveyEntry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Remove the entry at `index` (insertion order) and persist.
    pub async fn remove(&self, index: usize) -> Result<SurveyEntry, StoreError> {
        let mut state = self.state.lock().await;
        let len = state.entries.len();
        if index >= len {
            return Err(StoreError::IndexOutOfRange { index, len });
        }

        let removed = state.entries.remove(index);
        if let Err(e) = self.persist_entries(&state.entries).await {
            state.entries.insert(index, removed);
            tracing::error!(index, error = %e, "Failed to persist survey removal");
            return Err(e);
        }

        tracing::debug!(entry_id = %removed.id, index, "Survey entry removed");
        Ok(removed)
    }

    /// Remove every entry. The latest report is left untouched.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let previous = std::mem::take(&mut state.entries);

        if let Err(e) = self.persist_entries(&state.entries).await {
            state.entries = previous;
            tracing::error!(error = %e, "Failed to persist survey clear");
            return Err(e);
        }

        tracing::info!(removed = previous.len(), "Survey entries cleared");
        Ok(())
    }

    /// Replace the latest report and persist it.
    pub async fn set_latest_report(&self, report: Report) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        self.store_report(&mut state, report, None).await
    }

    /// Store `report` unless the current report came from a later entry.
    /// Returns whether the report was stored.
    ///
    /// Reports for concurrent submissions can finish out of order; this
    /// keeps the report of the newest submission.
    pub async fn offer_report(&self, report: Report, source: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let position = |id: Uuid| state.entries.iter().position(|e| e.id == id);

        let current = state.report_source.and_then(position);
        let superseded = match (current, position(source)) {
            (Some(current), Some(offered)) => current > offered,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if superseded {
            tracing::debug!(report_id = %report.id, source = %source, "Report superseded by a newer submission");
            return Ok(false);
        }

        self.store_report(&mut state, report, Some(source)).await?;
        Ok(true)
    }

    pub async fn latest_report(&self) -> Option<Report> {
        self.state.lock().await.latest_report.clone()
    }

    async fn store_report(
        &self,
        state: &mut StoreState,
        report: Report,
        source: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let report_id = report.id;
        let previous = state.latest_report.replace(report);
        let previous_source = std::mem::replace(&mut state.report_source, source);

        let bytes = serde_json::to_vec_pretty(&state.latest_report)?;
        if let Err(e) = write_atomic(self.dir.join(LATEST_REPORT_FILE), bytes).await {
            state.latest_report = previous;
            state.report_source = previous_source;
            tracing::error!(report_id = %report_id, error = %e, "Failed to persist latest report");
            return Err(e);
        }

        tracing::debug!(report_id = %report_id, "Latest report stored");
        Ok(())
    }

    async fn persist_entries(&self, entries: &[SurveyEntry]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        write_atomic(self.dir.join(SURVEY_RESULTS_FILE), bytes).await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// Write `bytes` to `path` via a synced temp file and rename.
async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> Result<(), StoreError> {
    run_blocking(move || {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    })
    .await
}

/// Read and decode a JSON file. `Ok(None)` when the file does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}
