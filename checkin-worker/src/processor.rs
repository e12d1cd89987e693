use std::sync::Arc;
use std::time;

use checkin_common::aggregate::CommitOutcome;
use checkin_common::checkin::{LogEntry, LogEntryId};
use checkin_common::retry::RetryPolicy;
use checkin_common::store::CheckinStore;
use health::HealthHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::worker::{after_outcome, back_off, Outcome};

/// Single reader of the log, resuming from a durable checkpoint.
///
/// Only one processor may run against a log at a time; the checkpoint guard
/// makes a second one harmless but useless.
pub struct CheckpointProcessor {
    store: Arc<dyn CheckinStore>,
    block_timeout: time::Duration,
    simulated_work_max: time::Duration,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl CheckpointProcessor {
    pub fn new(store: Arc<dyn CheckinStore>, liveness: HealthHandle) -> Self {
        Self {
            store,
            block_timeout: time::Duration::from_secs(5),
            simulated_work_max: time::Duration::ZERO,
            retry_policy: RetryPolicy::default(),
            liveness,
        }
    }

    pub fn block_timeout(mut self, block_timeout: time::Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    pub fn simulated_work(mut self, max: time::Duration) -> Self {
        self.simulated_work_max = max;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Processes the entry right after the checkpoint, if one arrives in time.
    pub async fn run_once(&self) -> Result<Outcome, WorkerError> {
        let after = self.store.checkpoint().await?.unwrap_or(LogEntryId::ZERO);

        let Some(raw) = self.store.read_after(after, self.block_timeout).await? else {
            info!("waiting for more checkins...");
            return Ok(Outcome::Waiting);
        };

        let entry = match LogEntry::try_from(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                error!("skipping malformed entry {}: {}", raw.id, err);
                let id: LogEntryId = raw
                    .id
                    .parse()
                    .map_err(|_| WorkerError::InvalidEntryId(raw.id.clone()))?;
                self.store.set_checkpoint(id).await?;
                return Ok(Outcome::Malformed {
                    id: raw.id,
                    recorded: true,
                });
            }
        };

        match self.store.commit_with_checkpoint(&entry).await? {
            CommitOutcome::Applied(report) => {
                info!(
                    "processed checkin {}: location {} averages {} stars",
                    entry.id, entry.checkin.location_id, report.location.average_stars
                );
                Ok(Outcome::Applied(entry.id, report))
            }
            CommitOutcome::AlreadyProcessed => {
                warn!(
                    "checkin {} is at or before the checkpoint, another processor is running",
                    entry.id
                );
                Ok(Outcome::AlreadyProcessed(entry.id))
            }
        }
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        match self.store.checkpoint().await {
            Ok(Some(checkpoint)) => info!("resuming after checkpoint {checkpoint}"),
            Ok(None) => info!("no checkpoint, starting from the beginning of the log"),
            Err(err) => warn!("could not read the checkpoint yet: {}", err),
        }

        let mut attempt = 0;
        loop {
            self.liveness.report_healthy();

            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.run_once() => result,
            };

            match result {
                Ok(outcome) => {
                    attempt = 0;
                    after_outcome(&outcome, self.simulated_work_max).await;
                }
                Err(err) => {
                    metrics::counter!("checkin_worker_store_errors_total").increment(1);
                    if err.is_transient() {
                        warn!("transient error, retrying: {}", err);
                    } else {
                        error!("unexpected error, retrying: {}", err);
                    }

                    if !back_off(&self.retry_policy, attempt, &shutdown).await {
                        break;
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }

        info!("processor stopped");
    }
}
