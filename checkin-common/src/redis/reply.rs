//! Decoding of raw stream replies.
//!
//! Stream replies are parsed by hand rather than through the typed `streams`
//! helpers: entries whose body was trimmed while still pending come back with
//! a nil field list, and those must surface as malformed entries instead of
//! failing the whole reply.

use redis::Value;

use crate::aggregate::{CommitOutcome, CommitReport, LocationAggregate};
use crate::checkin::RawEntry;
use crate::store::StoreError;

fn unexpected(what: &str, value: &Value) -> StoreError {
    StoreError::Parse(format!("expected {what}, got {value:?}"))
}

fn string(value: &Value) -> Result<String, StoreError> {
    match value {
        Value::Data(bytes) => String::from_utf8(bytes.clone())
            .map_err(|err| StoreError::Parse(err.to_string())),
        Value::Status(status) => Ok(status.clone()),
        Value::Int(int) => Ok(int.to_string()),
        other => Err(unexpected("a string", other)),
    }
}

/// `[id, [name, value, ...] | nil]`
pub fn entry(value: &Value) -> Result<RawEntry, StoreError> {
    let Value::Bulk(parts) = value else {
        return Err(unexpected("an entry", value));
    };
    let (id, fields) = match parts.as_slice() {
        [id, fields] => (string(id)?, fields),
        _ => return Err(unexpected("an entry", value)),
    };

    let fields = match fields {
        Value::Nil => Vec::new(),
        Value::Bulk(flat) => {
            if flat.len() % 2 != 0 {
                return Err(unexpected("name/value pairs", fields));
            }
            flat.chunks(2)
                .map(|pair| Ok((string(&pair[0])?, string(&pair[1])?)))
                .collect::<Result<Vec<_>, StoreError>>()?
        }
        other => return Err(unexpected("entry fields", other)),
    };

    Ok(RawEntry { id, fields })
}

/// A list of entries, as returned by XRANGE.
pub fn entries(value: &Value) -> Result<Vec<RawEntry>, StoreError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(items) => items.iter().map(entry).collect(),
        other => Err(unexpected("a list of entries", other)),
    }
}

/// XREAD/XREADGROUP for a single stream: nil on timeout, else `[[key, [entry...]]]`.
pub fn first_read_entry(value: &Value) -> Result<Option<RawEntry>, StoreError> {
    let streams = match value {
        Value::Nil => return Ok(None),
        Value::Bulk(streams) => streams,
        other => return Err(unexpected("a read reply", other)),
    };

    match streams.first() {
        None => Ok(None),
        Some(Value::Bulk(stream)) if stream.len() == 2 => {
            Ok(entries(&stream[1])?.into_iter().next())
        }
        Some(other) => Err(unexpected("a stream reply", other)),
    }
}

/// XAUTOCLAIM: `[next-cursor, [entry...], (deleted ids)]`.
pub fn first_claimed_entry(value: &Value) -> Result<Option<RawEntry>, StoreError> {
    match value {
        Value::Bulk(parts) if parts.len() >= 2 => Ok(entries(&parts[1])?.into_iter().next()),
        other => Err(unexpected("an autoclaim reply", other)),
    }
}

/// Reply of the commit scripts, see `scripts`.
pub fn commit_outcome(values: &[i64]) -> Result<CommitOutcome, StoreError> {
    let non_negative = |value: i64| {
        u64::try_from(value).map_err(|_| StoreError::Parse(format!("negative counter {value}")))
    };

    match values {
        [0] => Ok(CommitOutcome::AlreadyProcessed),
        [1, recency, user_checkins, num_checkins, num_stars, average_stars] => {
            Ok(CommitOutcome::Applied(CommitReport {
                recency_updated: *recency == 1,
                user_checkins: non_negative(*user_checkins)?,
                location: LocationAggregate {
                    num_checkins: non_negative(*num_checkins)?,
                    num_stars: non_negative(*num_stars)?,
                    average_stars: non_negative(*average_stars)?,
                },
            }))
        }
        other => Err(StoreError::Parse(format!(
            "unexpected commit reply {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn raw_entry(id: &str, fields: &[&str]) -> Value {
        Value::Bulk(vec![
            data(id),
            Value::Bulk(fields.iter().map(|f| data(f)).collect()),
        ])
    }

    #[test]
    fn decodes_a_read_reply() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("ncc:checkins"),
            Value::Bulk(vec![raw_entry(
                "1609603711960-0",
                &["locationId", "181", "userId", "455", "starRating", "5"],
            )]),
        ])]);

        let entry = first_read_entry(&reply).unwrap().unwrap();
        assert_eq!(entry.id, "1609603711960-0");
        assert_eq!(
            entry.fields,
            vec![
                ("locationId".to_owned(), "181".to_owned()),
                ("userId".to_owned(), "455".to_owned()),
                ("starRating".to_owned(), "5".to_owned()),
            ]
        );
    }

    #[test]
    fn read_timeout_is_none() {
        assert_eq!(first_read_entry(&Value::Nil).unwrap(), None);
    }

    #[test]
    fn trimmed_pending_entry_has_no_fields() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("ncc:checkins"),
            Value::Bulk(vec![Value::Bulk(vec![data("1-0"), Value::Nil])]),
        ])]);

        let entry = first_read_entry(&reply).unwrap().unwrap();
        assert_eq!(entry.id, "1-0");
        assert!(entry.fields.is_empty());
    }

    #[test]
    fn decodes_an_autoclaim_reply() {
        let reply = Value::Bulk(vec![
            data("0-0"),
            Value::Bulk(vec![raw_entry("5-1", &["userId", "1"])]),
            Value::Bulk(vec![]),
        ]);

        let entry = first_claimed_entry(&reply).unwrap().unwrap();
        assert_eq!(entry.id, "5-1");

        let empty = Value::Bulk(vec![data("0-0"), Value::Bulk(vec![])]);
        assert_eq!(first_claimed_entry(&empty).unwrap(), None);
    }

    #[test]
    fn odd_field_lists_are_rejected() {
        assert!(entry(&raw_entry("1-0", &["userId"])).is_err());
    }

    #[test]
    fn decodes_commit_replies() {
        assert_eq!(
            commit_outcome(&[0]).unwrap(),
            CommitOutcome::AlreadyProcessed
        );
        assert_eq!(
            commit_outcome(&[1, 1, 3, 2, 4, 2]).unwrap(),
            CommitOutcome::Applied(CommitReport {
                recency_updated: true,
                user_checkins: 3,
                location: LocationAggregate {
                    num_checkins: 2,
                    num_stars: 4,
                    average_stars: 2,
                },
            })
        );
        assert!(commit_outcome(&[1, 2]).is_err());
    }
}
