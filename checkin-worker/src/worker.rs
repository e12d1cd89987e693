use std::sync::Arc;
use std::time;

use checkin_common::aggregate::{CommitOutcome, CommitReport};
use checkin_common::checkin::{LogEntry, LogEntryId};
use checkin_common::retry::RetryPolicy;
use checkin_common::store::{CheckinStore, StoreError};
use health::HealthHandle;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;

/// Where the worker is with the entry it holds, if any.
///
/// `Committed` and `Acked` are reached by the same store round trip: the
/// aggregate update and the acknowledgment run as one script. A worker that
/// stops in `Claimed` leaves the entry pending for redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claimed(LogEntryId),
    Committed(LogEntryId),
    Acked(LogEntryId),
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing arrived within the block timeout.
    Waiting,
    /// The entry was applied to its aggregates and recorded as processed.
    Applied(LogEntryId, CommitReport),
    /// The entry had already been recorded as processed by someone else; nothing changed.
    AlreadyProcessed(LogEntryId),
    /// The entry could not be parsed and was skipped without aggregation.
    /// `recorded` tells whether skipping it was recorded (acked or checkpointed).
    Malformed { id: String, recorded: bool },
}

impl Outcome {
    pub(crate) fn label(&self) -> Option<&'static str> {
        match self {
            Outcome::Waiting => None,
            Outcome::Applied(..) => Some("applied"),
            Outcome::AlreadyProcessed(_) => Some("already_processed"),
            Outcome::Malformed { .. } => Some("malformed"),
        }
    }
}

/// Shared by every consumer loop: records the outcome, then pauses when asked to
/// simulate work.
pub(crate) async fn after_outcome(outcome: &Outcome, simulated_work_max: time::Duration) {
    let Some(label) = outcome.label() else {
        return;
    };
    metrics::counter!("checkin_processed_total", "outcome" => label).increment(1);

    if matches!(outcome, Outcome::Applied(..)) && !simulated_work_max.is_zero() {
        let max_ms = (simulated_work_max.as_millis() as u64).max(1);
        let pause = rand::thread_rng().gen_range(1..=max_ms);
        debug!("simulating {pause}ms of work");
        tokio::time::sleep(time::Duration::from_millis(pause)).await;
    }
}

/// Sleeps for the backoff of `attempt`, or until shutdown. Returns false on shutdown.
pub(crate) async fn back_off(
    retry_policy: &RetryPolicy,
    attempt: u32,
    shutdown: &CancellationToken,
) -> bool {
    let backoff = retry_policy.time_until_next_retry(attempt);
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(backoff) => true,
    }
}

/// A competing consumer: claims entries from the group one at a time, applies
/// them to the aggregates and acknowledges them.
pub struct AggregationWorker {
    /// This consumer's name within the group. Must be unique among running workers.
    consumer: String,
    group: String,
    store: Arc<dyn CheckinStore>,
    /// How long a claim blocks waiting for a new entry.
    block_timeout: time::Duration,
    /// How long an entry must sit idle with another consumer before it is taken over.
    claim_min_idle: time::Duration,
    simulated_work_max: time::Duration,
    retry_policy: RetryPolicy,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
    state: WorkerState,
}

impl AggregationWorker {
    pub fn new(
        consumer: &str,
        group: &str,
        store: Arc<dyn CheckinStore>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            consumer: consumer.to_owned(),
            group: group.to_owned(),
            store,
            block_timeout: time::Duration::from_secs(5),
            claim_min_idle: time::Duration::from_secs(60),
            simulated_work_max: time::Duration::ZERO,
            retry_policy: RetryPolicy::default(),
            liveness,
            state: WorkerState::Idle,
        }
    }

    pub fn block_timeout(mut self, block_timeout: time::Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    pub fn claim_min_idle(mut self, claim_min_idle: time::Duration) -> Self {
        self.claim_min_idle = claim_min_idle;
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

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, next: WorkerState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Claims, parses, applies and acknowledges at most one entry.
    ///
    /// A store failure leaves the claimed entry pending; the next call claims
    /// it again before anything new.
    pub async fn run_once(&mut self) -> Result<Outcome, WorkerError> {
        let claimed = self
            .store
            .claim(
                &self.group,
                &self.consumer,
                self.block_timeout,
                self.claim_min_idle,
            )
            .await?;
        let Some(raw) = claimed else {
            info!("waiting for more checkins...");
            return Ok(Outcome::Waiting);
        };

        let entry = match LogEntry::try_from(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                error!("skipping malformed entry {}: {}", raw.id, err);
                let recorded = match self.store.ack(&self.group, &raw.id).await {
                    Ok(acked) => acked,
                    Err(err) => {
                        error!("failed to acknowledge malformed entry {}: {}", raw.id, err);
                        false
                    }
                };
                return Ok(Outcome::Malformed {
                    id: raw.id,
                    recorded,
                });
            }
        };

        self.transition(WorkerState::Claimed(entry.id));
        let committed = self.store.commit_and_ack(&self.group, &entry).await;
        let outcome = match committed {
            Ok(CommitOutcome::Applied(report)) => {
                self.transition(WorkerState::Committed(entry.id));
                self.transition(WorkerState::Acked(entry.id));
                info!(
                    "processed checkin {}: user {} now has {} checkins, location {} averages {} stars",
                    entry.id,
                    entry.checkin.user_id,
                    report.user_checkins,
                    entry.checkin.location_id,
                    report.location.average_stars
                );
                Outcome::Applied(entry.id, report)
            }
            Ok(CommitOutcome::AlreadyProcessed) => {
                warn!(
                    "checkin {} was already acknowledged in {}, leaving aggregates untouched",
                    entry.id, self.group
                );
                Outcome::AlreadyProcessed(entry.id)
            }
            Err(err) => {
                error!("failed to process checkin {}: {}", entry.id, err);
                self.transition(WorkerState::Idle);
                return Err(err.into());
            }
        };

        self.transition(WorkerState::Idle);
        Ok(outcome)
    }

    /// Runs until `shutdown` is cancelled. Only failing to set up the group is fatal.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        self.store.ensure_group(&self.group).await?;
        info!(
            "consumer {} joined group {}",
            self.consumer, self.group
        );

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
                Err(WorkerError::StoreError(StoreError::MissingGroup(_))) => {
                    warn!("consumer group {} disappeared, recreating it", self.group);
                    if let Err(err) = self.store.ensure_group(&self.group).await {
                        error!("failed to recreate consumer group {}: {}", self.group, err);
                    }
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

        info!("consumer {} stopped", self.consumer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkin_common::aggregate::LocationAggregate;
    use checkin_common::checkin::Checkin;
    use checkin_common::mock::MemoryStore;
    use health::HealthRegistry;

    const GROUP: &str = "checkinConsumers";

    fn checkin(user_id: i64, location_id: i64, star_rating: i64) -> Checkin {
        Checkin::from_parts(user_id, location_id, star_rating).unwrap()
    }

    async fn worker(store: &MemoryStore, consumer: &str) -> AggregationWorker {
        store.ensure_group(GROUP).await.unwrap();
        let liveness = HealthRegistry::new("liveness")
            .register(consumer, ::time::Duration::seconds(30));

        AggregationWorker::new(consumer, GROUP, Arc::new(store.clone()), liveness)
            .block_timeout(time::Duration::from_millis(10))
    }

    #[tokio::test]
    async fn waits_when_the_log_is_empty() {
        let store = MemoryStore::new();
        let mut worker = worker(&store, "a").await;

        assert_eq!(worker.run_once().await.unwrap(), Outcome::Waiting);
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn applies_and_acknowledges_an_entry() {
        let store = MemoryStore::new();
        let mut worker = worker(&store, "a").await;
        store.append_with_id(LogEntryId::new(1000, 0), &checkin(5, 2, 4));

        let outcome = worker.run_once().await.unwrap();

        let Outcome::Applied(id, report) = outcome else {
            panic!("expected the entry to be applied, got {outcome:?}");
        };
        assert_eq!(id, LogEntryId::new(1000, 0));
        assert!(report.recency_updated);
        assert_eq!(report.user_checkins, 1);
        assert_eq!(store.pending_count(GROUP), 0);
        assert_eq!(worker.state(), WorkerState::Idle);

        let user = store.user(5).await.unwrap();
        assert_eq!(user.last_checkin, Some(1000));
        assert_eq!(user.last_seen_at, Some(2));
    }

    #[tokio::test]
    async fn failed_commit_is_retried_from_own_pending() {
        let store = MemoryStore::new();
        let mut worker = worker(&store, "a").await;
        store.append_with_id(LogEntryId::new(1000, 0), &checkin(1, 1, 3));
        store.append_with_id(LogEntryId::new(2000, 0), &checkin(1, 1, 5));

        // The claim goes through, the commit does not.
        store.fail_next_commits(1);
        assert!(worker.run_once().await.is_err());
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(store.pending_count(GROUP), 1);

        // Own pending entries come back first, then new ones.
        let first = worker.run_once().await.unwrap();
        assert!(matches!(first, Outcome::Applied(id, _) if id == LogEntryId::new(1000, 0)));
        let second = worker.run_once().await.unwrap();
        assert!(matches!(second, Outcome::Applied(id, _) if id == LogEntryId::new(2000, 0)));

        assert_eq!(
            store.location(1).await.unwrap(),
            LocationAggregate {
                num_checkins: 2,
                num_stars: 8,
                average_stars: 4
            }
        );
    }

    #[tokio::test]
    async fn malformed_entries_are_acknowledged_without_aggregation() {
        let store = MemoryStore::new();
        let mut worker = worker(&store, "a").await;
        store.append_raw(&[("userId", "1"), ("locationId", "1")]);

        let outcome = worker.run_once().await.unwrap();

        assert!(matches!(outcome, Outcome::Malformed { recorded: true, .. }));
        assert_eq!(store.pending_count(GROUP), 0);
        assert_eq!(store.location(1).await.unwrap(), LocationAggregate::default());
    }

    #[tokio::test]
    async fn idle_entries_are_taken_over() {
        let store = MemoryStore::new();
        store.append_with_id(LogEntryId::new(1000, 0), &checkin(7, 7, 2));
        let mut patient = worker(&store, "patient").await;
        let mut rescuer = worker(&store, "rescuer")
            .await
            .claim_min_idle(time::Duration::ZERO);

        // "crashed" claims the entry and dies before committing it.
        store
            .claim(GROUP, "crashed", time::Duration::ZERO, time::Duration::from_secs(60))
            .await
            .unwrap()
            .expect("an entry to claim");

        // Not idle for long enough yet.
        assert_eq!(patient.run_once().await.unwrap(), Outcome::Waiting);

        let outcome = rescuer.run_once().await.unwrap();
        assert!(matches!(outcome, Outcome::Applied(id, _) if id == LogEntryId::new(1000, 0)));
        assert_eq!(store.location(7).await.unwrap().num_checkins, 1);
        assert_eq!(store.pending_count(GROUP), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = MemoryStore::new();
        let worker = worker(&store, "a").await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        worker.run(shutdown).await.unwrap();
    }
}
