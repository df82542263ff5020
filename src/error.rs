use std::path::PathBuf;
use thiserror::Error;

use crate::types::FailureReason;

/// Everything that can go wrong while processing a single task. These never
/// escape the worker; they become a [`crate::types::TaskFailure`].
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no image found for sample")]
    ImageUnresolved,

    #[error("failed to read image {path}: {source}")]
    ImageRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("classifier call failed: {0}")]
    Transport(String),

    #[error("classifier returned an empty response")]
    EmptyResponse,

    #[error("no JSON object found in response")]
    NoJsonObject,

    #[error("invalid JSON in response: {0}")]
    InvalidJson(String),
}

impl TaskError {
    pub fn reason(&self) -> FailureReason {
        match self {
            TaskError::ImageUnresolved | TaskError::ImageRead { .. } => FailureReason::Resolution,
            TaskError::Transport(_) | TaskError::EmptyResponse => FailureReason::Transport,
            TaskError::NoJsonObject | TaskError::InvalidJson(_) => FailureReason::Parse,
        }
    }
}
