use thiserror::Error;

/// Convenience alias for Results with [`MeshError`].
pub type Result<T> = std::result::Result<T, MeshError>;

/// Closed set of error kinds surfaced by the orchestration core.
///
/// Callers discriminate on the kind, not the message; the message is for
/// logs and humans only. Execution-time failures never reach here
/// synchronously — they land in a stored `TaskResult` and an emitted
/// event instead (see `events` and `orchestrator`).
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("queue full (max {max})")]
    QueueFull { max: usize },

    #[error("duplicate id: {id}")]
    Duplicate { id: String },

    #[error("not found: {id}")]
    NotFound { id: String },

    #[error("unknown: no data recorded for {id}")]
    Unknown { id: String },

    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("orchestrator is not running")]
    NotRunning,

    #[error("orchestrator is already running")]
    AlreadyRunning,

    #[error("capability mismatch: missing {missing:?}")]
    CapabilityMismatch { missing: Vec<String> },

    #[error("timed out: {message}")]
    Timeout { message: String },

    #[error("cancelled: {id}")]
    Cancelled { id: String },

    #[error("dropped under backpressure: {id}")]
    BackpressureDropped { id: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
