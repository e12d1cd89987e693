use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::aggregate::{CommitOutcome, LocationAggregate, UserAggregate};
use crate::checkin::{Checkin, LogEntry, LogEntryId, RawEntry};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("timed out waiting for the store")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("consumer group {0} does not exist")]
    MissingGroup(String),
    #[error("unexpected reply from the store: {0}")]
    Parse(String),
    #[error(transparent)]
    Redis(redis::RedisError),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else if err.code() == Some("NOGROUP") {
            StoreError::MissingGroup(err.detail().unwrap_or_default().to_owned())
        } else {
            StoreError::Redis(err)
        }
    }
}

impl StoreError {
    /// Whether retrying the same call later can succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout | StoreError::Unavailable(_) => true,
            StoreError::MissingGroup(_) | StoreError::Parse(_) => false,
            StoreError::Redis(err) => {
                err.is_io_error()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || matches!(
                        err.kind(),
                        redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
                    )
            }
        }
    }
}

/// Result of admitting a check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Appended to the log under this id.
    Accepted(LogEntryId),
    /// The dedup filter has (probably) seen this check-in before; nothing was appended.
    Duplicate,
}

/// Everything the pipeline needs from its store.
///
/// Each method is a single atomic step against the store. Implementations:
/// `RedisStore` for production and `MemoryStore` for tests.
#[async_trait]
pub trait CheckinStore: Send + Sync {
    /// Liveness check of the underlying connection.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Dedup filter contract: sets the bits and reports whether all of them were already set.
    async fn test_and_add(&self, positions: &[u64]) -> Result<bool, StoreError>;

    /// Dedup check plus log append as one unit. The entry is appended before its
    /// bits are set, so a failure can never mark an entry that was not logged.
    /// The log is trimmed to roughly `max_len` entries.
    async fn admit(
        &self,
        checkin: &Checkin,
        positions: &[u64],
        max_len: u64,
    ) -> Result<Admission, StoreError>;

    /// Administrative rebuild: forget every key the filter has seen.
    async fn rebuild_filter(&self) -> Result<(), StoreError>;

    /// Creates the consumer group at the start of the log, if missing.
    async fn ensure_group(&self, group: &str) -> Result<(), StoreError>;

    /// Drops the group, with its pending entries, and recreates it at the start of the log.
    async fn reset_group(&self, group: &str) -> Result<(), StoreError>;

    /// Claims one entry for `consumer`, in order of preference: an entry this
    /// consumer already holds, an entry another consumer has held for longer
    /// than `min_idle`, or a new entry, waiting up to `block` for one.
    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
        min_idle: Duration,
    ) -> Result<Option<RawEntry>, StoreError>;

    /// Applies the entry to its user and location aggregates and acknowledges it
    /// in the group, atomically. An entry that is no longer pending in the group
    /// is left alone and reported as `AlreadyProcessed`.
    async fn commit_and_ack(&self, group: &str, entry: &LogEntry)
        -> Result<CommitOutcome, StoreError>;

    /// Acknowledges an entry without touching any aggregate. Returns whether it was pending.
    async fn ack(&self, group: &str, id: &str) -> Result<bool, StoreError>;

    /// Single-reader mode: the first entry after `after`, waiting up to `block`.
    async fn read_after(
        &self,
        after: LogEntryId,
        block: Duration,
    ) -> Result<Option<RawEntry>, StoreError>;

    /// Single-reader mode: applies the entry and moves the checkpoint to it,
    /// atomically. Entries at or before the checkpoint are `AlreadyProcessed`.
    async fn commit_with_checkpoint(&self, entry: &LogEntry) -> Result<CommitOutcome, StoreError>;

    async fn checkpoint(&self) -> Result<Option<LogEntryId>, StoreError>;

    /// Moves the checkpoint forward to `id`; never moves it back.
    async fn set_checkpoint(&self, id: LogEntryId) -> Result<(), StoreError>;

    /// Entries whose timestamp is within `[start_ms, end_ms]`, oldest first, at most `count`.
    async fn range(
        &self,
        start_ms: u64,
        end_ms: u64,
        count: usize,
    ) -> Result<Vec<RawEntry>, StoreError>;

    async fn user(&self, user_id: u64) -> Result<UserAggregate, StoreError>;

    async fn location(&self, location_id: u64) -> Result<LocationAggregate, StoreError>;
}
