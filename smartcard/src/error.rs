use crate::pcsc::ScardError;

/// Error type for a secure channel transform injected into a connection.
pub type TransformError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SmartCardError {
    #[error("smart card transport failed: {0}")]
    Transport(#[from] ScardError),
    #[error("malformed response: {0}")]
    BadResponse(&'static str),
    #[error("chained response exceeded {limit} bytes")]
    ResponseOverflow { limit: usize },
    #[error("secure channel processing failed: {0}")]
    SecureChannel(#[source] TransformError),
    #[error("could not start worker thread: {0}")]
    Worker(#[from] std::io::Error),
}
