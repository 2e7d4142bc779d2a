//! Error types for the counter subsystem.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CounterError>;

/// Errors surfaced by the counter store, event log and service layer.
///
/// Invalid counter records and lost rebuild locks are *not* errors; they are
/// handled inside the read path. Only store-level failures reach callers.
#[derive(Debug, Error)]
pub enum CounterError {
    /// The shared store could not be reached at all. Callers should map this
    /// to a service-unavailable response.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("key {key} holds a value of the wrong type")]
    WrongType { key: String },

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("malformed event payload: {0}")]
    Event(#[from] serde_json::Error),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CounterError {
    /// Whether the error means the backing store is unreachable, as opposed
    /// to a problem with a single key or payload.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CounterError::Unavailable(_) | CounterError::Storage(_))
    }
}

impl From<figment::Error> for CounterError {
    fn from(e: figment::Error) -> Self {
        CounterError::Config(e.to_string())
    }
}
