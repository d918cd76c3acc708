use thiserror::Error;

use crate::config::ConfigError;
use crate::pipeline::backend::BackendError;
use crate::pipeline::parser::ParseError;
use crate::pipeline::session::SessionError;
use crate::store::StoreError;

/// Everything a survey submission can fail with.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Could not save survey data: {0}")]
    Persistence(StoreError),

    /// The model could not be loaded. The session stays failed until the
    /// pipeline is recreated.
    #[error("{0}")]
    BackendInit(SessionError),

    /// One generation failed; the next submission may succeed.
    #[error("{0}")]
    BackendGeneration(SessionError),

    #[error("There is no survey at position {index}; {len} are stored")]
    NoSuchSurvey { index: usize, len: usize },

    #[error("Could not read the generated report: {0}")]
    Parse(#[from] ParseError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Could not set up the model backend: {0}")]
    Backend(#[from] BackendError),
}

impl From<SessionError> for PipelineError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Init(_) | SessionError::Unrecoverable(_) => Self::BackendInit(e),
            other => Self::BackendGeneration(other),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::IndexOutOfRange { index, len } => Self::NoSuchSurvey { index, len },
            other => Self::Persistence(other),
        }
    }
}
