use thiserror::Error;
use transport_bus::BusError;

/// Contract violations. Expected distributed outcomes (conflicts, offline owners,
/// rejected reassignments) are reported as values, never through this type.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid session resource {input:?}: {source}")]
    InvalidResource {
        input: String,
        #[source]
        source: url::ParseError,
    },
    #[error("client is not connected")]
    NotConnected,
    #[error("already connected as {0}")]
    AlreadyConnected(String),
    #[error("version counter for client {0} is exhausted")]
    CounterExhausted(String),
    #[error("unknown host: {0}")]
    UnknownHost(String),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

pub type SyncResult<T> = Result<T, SyncError>;
