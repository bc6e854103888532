use thiserror::Error;

/// Errors surfaced by every store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Key not found in store")]
    KeyNotFound,

    #[error("Key exists in store")]
    KeyExists,

    #[error("Key has been modified since it was last read")]
    KeyModified,

    #[error("Previous K/V pair should be provided for the atomic operation")]
    PreviousNotSpecified,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalidated: {0}")]
    Invalidated(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Backend storage not supported yet, please choose one of {0}")]
    BackendNotSupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backend error: {0}")]
    Backend(String),
}
