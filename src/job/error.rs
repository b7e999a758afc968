use std::{io, path::PathBuf};

use frame_pipe::ToolError;

/// A job that cannot start; reported to the user as is.
#[derive(Debug, thiserror::Error)]
pub enum ConfigIssue {
    #[error("input file not found: {}", .0.display())]
    InputMissing(PathBuf),
    #[error("source has no video stream")]
    NoVideoStream,
    #[error("source frame rate could not be determined")]
    UnknownFrameRate,
    #[error("transform tool not found: {}", .0.display())]
    TransformBinaryMissing(PathBuf),
    #[error("model directory not found: {}", .0.display())]
    ModelDirMissing(PathBuf),
    #[error("output path is empty")]
    OutputPathEmpty,
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("cannot create working directory {}: {source}", .path.display())]
    WorkingDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigIssue),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("job was cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<io::Error> for JobError {
    fn from(err: io::Error) -> Self {
        JobError::Other(err.into())
    }
}
