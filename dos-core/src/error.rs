use thiserror::Error;

pub type Result<T> = std::result::Result<T, DosError>;

#[derive(Error, Debug)]
pub enum DosError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Object already exists: {0}")]
    ObjectAlreadyExists(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Object not found in local store: {0}")]
    ObjectNotInStore(String),

    #[error("Not enough replicas: need {required}, found {found}")]
    NotEnoughReplicas { required: usize, found: usize },

    #[error("Replication failed: need {required} acks, got {acked}")]
    ReplicationFailed { required: usize, acked: usize },

    #[error("Not enough ghost nodes for tolerance: need {required}, found {available}")]
    ToleranceNotMet { required: usize, available: usize },

    #[error("No ghost node available for recovery")]
    NoGhostAvailable,

    #[error("Replica disconnected: {0}")]
    ReplicaClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for DosError {
    fn from(err: redis::RedisError) -> Self {
        DosError::Redis(err.to_string())
    }
}

impl DosError {
    /// Errors a data node survives: the command is dropped and the node
    /// keeps serving. Anything else escaping the agent is fatal.
    pub fn is_not_in_store(&self) -> bool {
        matches!(self, DosError::ObjectNotInStore(_))
    }
}
