use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("watch setup failed for {path}: {message}")]
    WatchSetup { path: PathBuf, message: String },

    #[error("task queue is shut down")]
    QueueClosed,

    #[error("task failed: {0}")]
    Task(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
