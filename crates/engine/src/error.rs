use thiserror::Error;

/// Engine-level failures. The first four are the run-facing taxonomy;
/// `Storage` and `NotFound` come from the orchestrator's collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed or insufficient candles
    #[error("data error: {0}")]
    Data(String),

    /// Internal invariant violation inside simulation or resolution
    #[error("simulation error: {0}")]
    Simulation(String),

    #[error("run exceeded its {0}s budget")]
    Timeout(u64),

    /// Invalid parameters or scope, rejected before scheduling
    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    /// Short machine-readable kind, persisted next to the message
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Data(_) => "data",
            EngineError::Simulation(_) => "simulation",
            EngineError::Timeout(_) => "timeout",
            EngineError::Config(_) => "config",
            EngineError::Storage(_) => "storage",
            EngineError::NotFound(_) => "not_found",
        }
    }
}

impl From<persistence::DbError> for EngineError {
    fn from(e: persistence::DbError) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(format!("serialization: {e}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
