use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::aggregate::{apply_entry, CommitOutcome, LocationAggregate, UserAggregate};
use crate::checkin::{Checkin, LogEntry, LogEntryId, RawEntry};
use crate::store::{Admission, CheckinStore, StoreError};

struct Pending {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct Group {
    last_delivered: LogEntryId,
    pending: BTreeMap<LogEntryId, Pending>,
}

#[derive(Default)]
struct State {
    filter: HashSet<u64>,
    log: BTreeMap<LogEntryId, Vec<(String, String)>>,
    last_id: LogEntryId,
    groups: HashMap<String, Group>,
    users: HashMap<u64, UserAggregate>,
    locations: HashMap<u64, LocationAggregate>,
    checkpoint: Option<LogEntryId>,
    failures: u32,
    commit_failures: u32,
}

impl State {
    fn next_id(&mut self) -> LogEntryId {
        let now = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
        self.last_id = if now > self.last_id.millis {
            LogEntryId::new(now, 0)
        } else {
            LogEntryId::new(self.last_id.millis, self.last_id.sequence + 1)
        };
        self.last_id
    }

    fn insert(&mut self, id: LogEntryId, fields: Vec<(String, String)>) {
        self.log.insert(id, fields);
        self.last_id = self.last_id.max(id);
    }

    fn raw(&self, id: LogEntryId) -> RawEntry {
        RawEntry {
            id: id.to_string(),
            fields: self.log.get(&id).cloned().unwrap_or_default(),
        }
    }

    fn group(&mut self, name: &str) -> Result<&mut Group, StoreError> {
        self.groups
            .get_mut(name)
            .ok_or_else(|| StoreError::MissingGroup(name.to_owned()))
    }

    fn claim_pending(
        &mut self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<RawEntry>, StoreError> {
        let now = Instant::now();
        let group = self.group(group)?;

        let own = group
            .pending
            .iter()
            .find(|(_, pending)| pending.consumer == consumer)
            .map(|(id, _)| *id);
        let claimed = own.or_else(|| {
            group
                .pending
                .iter()
                .find(|(_, pending)| now.duration_since(pending.delivered_at) >= min_idle)
                .map(|(id, _)| *id)
        });

        let Some(id) = claimed else {
            return Ok(None);
        };
        if let Some(pending) = group.pending.get_mut(&id) {
            pending.consumer = consumer.to_owned();
            pending.delivered_at = now;
        }
        Ok(Some(self.raw(id)))
    }

    fn deliver_new(&mut self, group: &str, consumer: &str) -> Result<Option<RawEntry>, StoreError> {
        let last_delivered = self.group(group)?.last_delivered;
        let next = self
            .log
            .range(last_delivered..)
            .map(|(id, _)| *id)
            .find(|id| *id > last_delivered);
        let Some(id) = next else {
            return Ok(None);
        };

        let group = self.group(group)?;
        group.last_delivered = id;
        group.pending.insert(
            id,
            Pending {
                consumer: consumer.to_owned(),
                delivered_at: Instant::now(),
            },
        );
        Ok(Some(self.raw(id)))
    }

    fn apply(&mut self, entry: &LogEntry) -> CommitOutcome {
        let user = self.users.entry(entry.checkin.user_id).or_default();
        let location = self.locations.entry(entry.checkin.location_id).or_default();
        CommitOutcome::Applied(apply_entry(entry, user, location))
    }
}

/// In-process store with the same contract as `RedisStore`, for tests.
///
/// The log is trimmed exactly to `max_len` rather than approximately.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_owned()))
    }

    /// Locks the state, failing instead if an injected failure is pending.
    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        let mut state = self.lock()?;
        if state.failures > 0 {
            state.failures -= 1;
            return Err(StoreError::Unavailable("injected failure".to_owned()));
        }
        Ok(state)
    }

    /// Makes the next `count` calls fail as if the store were unreachable.
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.failures = count;
        }
    }

    /// Makes the next `count` commits fail while everything else keeps working.
    pub fn fail_next_commits(&self, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.commit_failures = count;
        }
    }

    /// Locks the state for a commit, failing if an injected commit failure is pending.
    fn commit_state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        let mut state = self.state()?;
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(StoreError::Timeout);
        }
        Ok(state)
    }

    /// Appends a check-in under a chosen id, bypassing the filter.
    pub fn append_with_id(&self, id: LogEntryId, checkin: &Checkin) {
        let fields = checkin
            .fields()
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value))
            .collect();
        self.append_raw_with_id(id, fields);
    }

    /// Appends an arbitrary field list, valid or not.
    pub fn append_raw(&self, fields: &[(&str, &str)]) -> LogEntryId {
        let fields = fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        let Ok(mut state) = self.lock() else {
            return LogEntryId::ZERO;
        };
        let id = state.next_id();
        state.insert(id, fields);
        drop(state);
        self.appended.notify_waiters();
        id
    }

    fn append_raw_with_id(&self, id: LogEntryId, fields: Vec<(String, String)>) {
        if let Ok(mut state) = self.lock() {
            state.insert(id, fields);
        }
        self.appended.notify_waiters();
    }

    /// Number of entries in the log.
    pub fn len(&self) -> usize {
        self.lock().map(|state| state.log.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries delivered to the group and not yet acknowledged.
    pub fn pending_count(&self, group: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|state| state.groups.get(group).map(|group| group.pending.len()))
            .unwrap_or_default()
    }

    /// Runs `poll` until it yields something or `block` elapses, waking on every append.
    async fn wait_for<F>(&self, block: Duration, mut poll: F) -> Result<Option<RawEntry>, StoreError>
    where
        F: FnMut(&mut State) -> Result<Option<RawEntry>, StoreError> + Send,
    {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state()?;
                if let Some(entry) = poll(&mut *state)? {
                    return Ok(Some(entry));
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl CheckinStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.state().map(|_| ())
    }

    async fn test_and_add(&self, positions: &[u64]) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let newly_set = positions
            .iter()
            .filter(|position| state.filter.insert(**position))
            .count();
        Ok(newly_set == 0)
    }

    async fn admit(
        &self,
        checkin: &Checkin,
        positions: &[u64],
        max_len: u64,
    ) -> Result<Admission, StoreError> {
        let id = {
            let mut state = self.state()?;
            if positions.iter().all(|position| state.filter.contains(position)) {
                return Ok(Admission::Duplicate);
            }

            let id = state.next_id();
            let fields = checkin
                .fields()
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value))
                .collect();
            state.insert(id, fields);
            while state.log.len() as u64 > max_len {
                state.log.pop_first();
            }
            state.filter.extend(positions.iter().copied());
            id
        };

        self.appended.notify_waiters();
        Ok(Admission::Accepted(id))
    }

    async fn rebuild_filter(&self) -> Result<(), StoreError> {
        self.state()?.filter.clear();
        Ok(())
    }

    async fn ensure_group(&self, group: &str) -> Result<(), StoreError> {
        self.state()?.groups.entry(group.to_owned()).or_default();
        Ok(())
    }

    async fn reset_group(&self, group: &str) -> Result<(), StoreError> {
        self.state()?.groups.insert(group.to_owned(), Group::default());
        Ok(())
    }

    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
        min_idle: Duration,
    ) -> Result<Option<RawEntry>, StoreError> {
        let pending = self.state()?.claim_pending(group, consumer, min_idle)?;
        if pending.is_some() {
            return Ok(pending);
        }
        self.wait_for(block, |state| state.deliver_new(group, consumer))
            .await
    }

    async fn commit_and_ack(
        &self,
        group: &str,
        entry: &LogEntry,
    ) -> Result<CommitOutcome, StoreError> {
        let mut state = self.commit_state()?;
        if state.group(group)?.pending.remove(&entry.id).is_none() {
            return Ok(CommitOutcome::AlreadyProcessed);
        }
        Ok(state.apply(entry))
    }

    async fn ack(&self, group: &str, id: &str) -> Result<bool, StoreError> {
        let Ok(id) = id.parse::<LogEntryId>() else {
            return Ok(false);
        };
        let mut state = self.state()?;
        Ok(state.group(group)?.pending.remove(&id).is_some())
    }

    async fn read_after(
        &self,
        after: LogEntryId,
        block: Duration,
    ) -> Result<Option<RawEntry>, StoreError> {
        self.wait_for(block, |state| {
            let next = state
                .log
                .range(after..)
                .map(|(id, _)| *id)
                .find(|id| *id > after);
            Ok(next.map(|id| state.raw(id)))
        })
        .await
    }

    async fn commit_with_checkpoint(&self, entry: &LogEntry) -> Result<CommitOutcome, StoreError> {
        let mut state = self.commit_state()?;
        if state.checkpoint.is_some_and(|checkpoint| checkpoint >= entry.id) {
            return Ok(CommitOutcome::AlreadyProcessed);
        }
        state.checkpoint = Some(entry.id);
        Ok(state.apply(entry))
    }

    async fn checkpoint(&self) -> Result<Option<LogEntryId>, StoreError> {
        Ok(self.state()?.checkpoint)
    }

    async fn set_checkpoint(&self, id: LogEntryId) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if state.checkpoint.map_or(true, |checkpoint| id > checkpoint) {
            state.checkpoint = Some(id);
        }
        Ok(())
    }

    async fn range(
        &self,
        start_ms: u64,
        end_ms: u64,
        count: usize,
    ) -> Result<Vec<RawEntry>, StoreError> {
        let state = self.state()?;
        if start_ms > end_ms {
            return Ok(Vec::new());
        }
        Ok(state
            .log
            .range(LogEntryId::new(start_ms, 0)..=LogEntryId::new(end_ms, u64::MAX))
            .take(count)
            .map(|(id, _)| state.raw(*id))
            .collect())
    }

    async fn user(&self, user_id: u64) -> Result<UserAggregate, StoreError> {
        Ok(self
            .state()?
            .users
            .get(&user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn location(&self, location_id: u64) -> Result<LocationAggregate, StoreError> {
        Ok(self
            .state()?
            .locations
            .get(&location_id)
            .copied()
            .unwrap_or_default())
    }
}
