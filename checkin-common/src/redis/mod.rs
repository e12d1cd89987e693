use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{Connection, MultiplexedConnection};
use redis::{AsyncCommands, Cmd, Script, Value};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::aggregate::{CommitOutcome, LocationAggregate, UserAggregate};
use crate::checkin::{Checkin, LogEntry, LogEntryId, RawEntry};
use crate::keys::KeySpace;
use crate::store::{Admission, CheckinStore, StoreError};

mod reply;
mod scripts;

// Scripts and acks are a single round trip; anything slower means the store is in trouble.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

// Extra time granted to blocking reads on top of their server-side block.
const BLOCKING_GRACE: Duration = Duration::from_secs(1);

struct Scripts {
    test_and_add: Script,
    admit: Script,
    group_commit: Script,
    checkpoint_commit: Script,
    set_checkpoint: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            test_and_add: Script::new(scripts::TEST_AND_ADD),
            admit: Script::new(scripts::ADMIT),
            group_commit: Script::new(&scripts::group_commit()),
            checkpoint_commit: Script::new(&scripts::checkpoint_commit()),
            set_checkpoint: Script::new(&scripts::set_checkpoint()),
        }
    }
}

/// Redis-backed store. The log is a stream, the filter a bitmap, aggregates
/// are hashes, all under one `KeySpace`.
///
/// Short commands share one multiplexed connection. Blocking reads go through
/// a second, long-lived connection so they never hold up the shared one.
pub struct RedisStore {
    client: redis::Client,
    connection: MultiplexedConnection,
    /// Opened on first use, dropped after any failed read.
    blocking: Mutex<Option<Connection>>,
    keys: KeySpace,
    scripts: Scripts,
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::Timeout),
    }
}

fn parse_counter(fields: &HashMap<String, String>, name: &str) -> Result<Option<u64>, StoreError> {
    fields
        .get(name)
        .map(|value| {
            value
                .parse()
                .map_err(|_| StoreError::Parse(format!("{name} is not a counter: {value:?}")))
        })
        .transpose()
}

/// `BLOCK 0` waits forever, so a zero block leaves the option out and the read returns at once.
fn block_arg(cmd: &mut Cmd, block: Duration) {
    if !block.is_zero() {
        cmd.arg("BLOCK").arg(block.as_millis() as u64);
    }
}

fn read_new_cmd(log: &str, group: &str, consumer: &str, block: Duration) -> Cmd {
    let mut cmd = redis::cmd("XREADGROUP");
    cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(1);
    block_arg(&mut cmd, block);
    cmd.arg("STREAMS").arg(log).arg(">");
    cmd
}

fn read_after_cmd(log: &str, after: LogEntryId, block: Duration) -> Cmd {
    let mut cmd = redis::cmd("XREAD");
    cmd.arg("COUNT").arg(1);
    block_arg(&mut cmd, block);
    cmd.arg("STREAMS").arg(log).arg(after.to_string());
    cmd
}

impl RedisStore {
    pub async fn new(url: &str, keys: KeySpace) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = bounded(COMMAND_TIMEOUT, client.get_multiplexed_tokio_connection()).await?;

        Ok(Self {
            client,
            connection,
            blocking: Mutex::new(None),
            keys,
            scripts: Scripts::load(),
        })
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    async fn blocking_query(&self, cmd: Cmd, block: Duration) -> Result<Value, StoreError> {
        let mut slot = self.blocking.lock().await;
        let mut con = match slot.take() {
            Some(con) => con,
            None => {
                debug!("opening connection for blocking reads");
                bounded(COMMAND_TIMEOUT, self.client.get_async_connection()).await?
            }
        };

        let reply = bounded(block + BLOCKING_GRACE, cmd.query_async(&mut con)).await;
        // A read cut short may still have its reply in flight on this connection.
        if reply.is_ok() {
            *slot = Some(con);
        }
        reply
    }

    async fn pending_own(&self, group: &str, consumer: &str) -> Result<Option<RawEntry>, StoreError> {
        let mut con = self.connection.clone();
        let reply: Value = bounded(
            COMMAND_TIMEOUT,
            redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(group)
                .arg(consumer)
                .arg("COUNT")
                .arg(1)
                .arg("STREAMS")
                .arg(self.keys.checkins())
                .arg("0")
                .query_async(&mut con),
        )
        .await?;
        reply::first_read_entry(&reply)
    }

    async fn reclaim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<RawEntry>, StoreError> {
        let mut con = self.connection.clone();
        let reply: Value = bounded(
            COMMAND_TIMEOUT,
            redis::cmd("XAUTOCLAIM")
                .arg(self.keys.checkins())
                .arg(group)
                .arg(consumer)
                .arg(min_idle.as_millis() as u64)
                .arg("0-0")
                .arg("COUNT")
                .arg(1)
                .query_async(&mut con),
        )
        .await?;
        reply::first_claimed_entry(&reply)
    }

    async fn hash(&self, key: String) -> Result<HashMap<String, String>, StoreError> {
        let mut con = self.connection.clone();
        bounded(COMMAND_TIMEOUT, con.hgetall(key)).await
    }
}

#[async_trait]
impl CheckinStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut con = self.connection.clone();
        let _pong: String = bounded(COMMAND_TIMEOUT, redis::cmd("PING").query_async(&mut con)).await?;
        Ok(())
    }

    async fn test_and_add(&self, positions: &[u64]) -> Result<bool, StoreError> {
        let mut con = self.connection.clone();
        let mut invocation = self.scripts.test_and_add.key(self.keys.checkin_filter());
        invocation.arg(positions);
        bounded(COMMAND_TIMEOUT, invocation.invoke_async(&mut con)).await
    }

    async fn admit(
        &self,
        checkin: &Checkin,
        positions: &[u64],
        max_len: u64,
    ) -> Result<Admission, StoreError> {
        let mut con = self.connection.clone();
        let mut invocation = self.scripts.admit.key(self.keys.checkin_filter());
        invocation
            .key(self.keys.checkins())
            .arg(max_len)
            .arg(checkin.location_id)
            .arg(checkin.user_id)
            .arg(checkin.star_rating)
            .arg(positions);

        let id: Option<String> = bounded(COMMAND_TIMEOUT, invocation.invoke_async(&mut con)).await?;
        match id {
            Some(id) => {
                let id = id
                    .parse()
                    .map_err(|err: crate::checkin::InvalidEntryId| StoreError::Parse(err.to_string()))?;
                Ok(Admission::Accepted(id))
            }
            None => Ok(Admission::Duplicate),
        }
    }

    async fn rebuild_filter(&self) -> Result<(), StoreError> {
        let mut con = self.connection.clone();
        let _: i64 = bounded(COMMAND_TIMEOUT, con.del(self.keys.checkin_filter())).await?;
        Ok(())
    }

    async fn ensure_group(&self, group: &str) -> Result<(), StoreError> {
        let mut con = self.connection.clone();
        let created: Result<(), StoreError> = bounded(
            COMMAND_TIMEOUT,
            con.xgroup_create_mkstream(self.keys.checkins(), group, "0"),
        )
        .await;

        match created {
            Err(StoreError::Redis(err)) if err.code() == Some("BUSYGROUP") => {
                debug!("consumer group {group} already exists");
                Ok(())
            }
            other => other,
        }
    }

    async fn reset_group(&self, group: &str) -> Result<(), StoreError> {
        // DESTROY needs the stream to exist.
        self.ensure_group(group).await?;

        let mut con = self.connection.clone();
        let _: i64 = bounded(
            COMMAND_TIMEOUT,
            con.xgroup_destroy(self.keys.checkins(), group),
        )
        .await?;
        bounded(
            COMMAND_TIMEOUT,
            con.xgroup_create_mkstream(self.keys.checkins(), group, "0"),
        )
        .await
    }

    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
        min_idle: Duration,
    ) -> Result<Option<RawEntry>, StoreError> {
        if let Some(entry) = self.pending_own(group, consumer).await? {
            return Ok(Some(entry));
        }
        if let Some(entry) = self.reclaim_idle(group, consumer, min_idle).await? {
            return Ok(Some(entry));
        }

        let cmd = read_new_cmd(&self.keys.checkins(), group, consumer, block);
        let reply = self.blocking_query(cmd, block).await?;
        reply::first_read_entry(&reply)
    }

    async fn commit_and_ack(
        &self,
        group: &str,
        entry: &LogEntry,
    ) -> Result<CommitOutcome, StoreError> {
        let mut con = self.connection.clone();
        let mut invocation = self.scripts.group_commit.key(self.keys.checkins());
        invocation
            .key(self.keys.user(entry.checkin.user_id))
            .key(self.keys.location(entry.checkin.location_id))
            .arg(group)
            .arg(entry.id.to_string())
            .arg(entry.timestamp())
            .arg(entry.checkin.location_id)
            .arg(entry.checkin.star_rating);

        let reply: Vec<i64> = bounded(COMMAND_TIMEOUT, invocation.invoke_async(&mut con)).await?;
        reply::commit_outcome(&reply)
    }

    async fn ack(&self, group: &str, id: &str) -> Result<bool, StoreError> {
        let mut con = self.connection.clone();
        let acked: i64 = bounded(
            COMMAND_TIMEOUT,
            con.xack(self.keys.checkins(), group, &[id]),
        )
        .await?;
        Ok(acked == 1)
    }

    async fn read_after(
        &self,
        after: LogEntryId,
        block: Duration,
    ) -> Result<Option<RawEntry>, StoreError> {
        let cmd = read_after_cmd(&self.keys.checkins(), after, block);
        let reply = self.blocking_query(cmd, block).await?;
        reply::first_read_entry(&reply)
    }

    async fn commit_with_checkpoint(&self, entry: &LogEntry) -> Result<CommitOutcome, StoreError> {
        let mut con = self.connection.clone();
        let mut invocation = self.scripts.checkpoint_commit.key(self.keys.checkpoint());
        invocation
            .key(self.keys.user(entry.checkin.user_id))
            .key(self.keys.location(entry.checkin.location_id))
            .arg(entry.id.to_string())
            .arg(entry.timestamp())
            .arg(entry.checkin.location_id)
            .arg(entry.checkin.star_rating);

        let reply: Vec<i64> = bounded(COMMAND_TIMEOUT, invocation.invoke_async(&mut con)).await?;
        reply::commit_outcome(&reply)
    }

    async fn checkpoint(&self) -> Result<Option<LogEntryId>, StoreError> {
        let mut con = self.connection.clone();
        let id: Option<String> = bounded(COMMAND_TIMEOUT, con.get(self.keys.checkpoint())).await?;
        id.map(|id| id.parse().map_err(|err: crate::checkin::InvalidEntryId| StoreError::Parse(err.to_string())))
            .transpose()
    }

    async fn set_checkpoint(&self, id: LogEntryId) -> Result<(), StoreError> {
        let mut con = self.connection.clone();
        let mut invocation = self.scripts.set_checkpoint.key(self.keys.checkpoint());
        invocation.arg(id.to_string());
        let moved: i64 = bounded(COMMAND_TIMEOUT, invocation.invoke_async(&mut con)).await?;
        if moved == 0 {
            debug!("checkpoint already at or past {id}");
        }
        Ok(())
    }

    async fn range(
        &self,
        start_ms: u64,
        end_ms: u64,
        count: usize,
    ) -> Result<Vec<RawEntry>, StoreError> {
        let mut con = self.connection.clone();
        // A bare millisecond id means "-0" as a start and "-<max>" as an end.
        let reply: Value = bounded(
            COMMAND_TIMEOUT,
            redis::cmd("XRANGE")
                .arg(self.keys.checkins())
                .arg(start_ms)
                .arg(end_ms)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut con),
        )
        .await?;
        reply::entries(&reply)
    }

    async fn user(&self, user_id: u64) -> Result<UserAggregate, StoreError> {
        let fields = self.hash(self.keys.user(user_id)).await?;

        Ok(UserAggregate {
            last_checkin: parse_counter(&fields, "lastCheckin")?,
            last_seen_at: parse_counter(&fields, "lastSeenAt")?,
            num_checkins: parse_counter(&fields, "numCheckins")?.unwrap_or_default(),
        })
    }

    async fn location(&self, location_id: u64) -> Result<LocationAggregate, StoreError> {
        let fields = self.hash(self.keys.location(location_id)).await?;

        Ok(LocationAggregate {
            num_checkins: parse_counter(&fields, "numCheckins")?.unwrap_or_default(),
            num_stars: parse_counter(&fields, "numStars")?.unwrap_or_default(),
            average_stars: parse_counter(&fields, "averageStars")?.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(cmd: &Cmd) -> String {
        String::from_utf8_lossy(&cmd.get_packed_command()).into_owned()
    }

    #[test]
    fn zero_block_reads_return_at_once() {
        let new = read_new_cmd("ncc:checkins", "g", "c", Duration::ZERO);
        assert!(!packed(&new).contains("BLOCK"));

        let after = read_after_cmd("ncc:checkins", LogEntryId::ZERO, Duration::ZERO);
        assert!(!packed(&after).contains("BLOCK"));
    }

    #[test]
    fn blocking_reads_pass_the_block_in_millis() {
        let new = read_new_cmd("ncc:checkins", "g", "c", Duration::from_millis(1500));
        let wire = packed(&new);
        assert!(wire.contains("BLOCK\r\n$4\r\n1500\r\n"));
        assert!(wire.ends_with(">\r\n"));

        let after = read_after_cmd("ncc:checkins", LogEntryId::new(7, 1), Duration::from_secs(5));
        assert!(packed_contains(&after, "5000"));
        assert!(packed_contains(&after, "7-1"));
    }

    fn packed_contains(cmd: &Cmd, arg: &str) -> bool {
        packed(cmd).contains(&format!("\r\n{arg}\r\n"))
    }
}
