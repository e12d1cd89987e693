use checkin_common::store::StoreError;
use thiserror::Error;

/// Errors that stop an iteration of a consumer loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a store error occurred while processing: {0}")]
    StoreError(#[from] StoreError),
    #[error("the store handed out an entry with an invalid id: {0}")]
    InvalidEntryId(String),
}

impl WorkerError {
    /// Whether the loop should back off and try again rather than give up.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::StoreError(err) => err.is_transient(),
            WorkerError::InvalidEntryId(_) => false,
        }
    }
}
