use thiserror::Error;

#[derive(Error, Debug)]
pub enum GaleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unmatched response: {0}")]
    UnmatchedResponse(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Scheduler overrun: {count} runner(s) did not terminate after cancellation (VUs {vu_ids:?})")]
    SchedulerOverrun { count: usize, vu_ids: Vec<u64> },
}

impl GaleError {
    /// Failures that happened before the session reached `open`
    pub fn is_connect(&self) -> bool {
        matches!(self, GaleError::Connect(_))
    }
}

pub type Result<T> = std::result::Result<T, GaleError>;
