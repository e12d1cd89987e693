use std::sync::Arc;

use checkin_common::checkin::{Checkin, Field, LogEntry, LogEntryId};
use checkin_common::filter::DedupFilter;
use checkin_common::store::{Admission, CheckinStore};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::api::{CheckinError, CheckinRecord, ErrorItem, ValueLocation};

/// The range endpoint never returns more than this many entries.
pub const MAX_RANGE_ENTRIES: usize = 1000;

const RANGE_ORDER_MSG: &str = "startTime must be less than or equal to endTime.";

/// Decimal integer literal: optional sign, then digits. Leading zeros are fine.
fn parse_int_literal(s: &str) -> Option<i64> {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    let well_formed = !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit());

    if well_formed {
        s.parse().ok()
    } else {
        None
    }
}

/// Integer value of a JSON field: a number without a fractional part, or a
/// string holding one.
fn parse_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => parse_int_literal(s),
        _ => None,
    }
}

/// Validates a submitted body, reporting every invalid field at once.
pub fn validate(body: &Value) -> Result<Checkin, CheckinError> {
    let Value::Object(fields) = body else {
        return Err(CheckinError::Validation(vec![ErrorItem::invalid(
            ValueLocation::Body,
            "",
            Some(body.clone()),
        )]));
    };

    let mut errors = Vec::new();
    let mut value_of = |field: Field| {
        let raw = fields.get(field.name());
        let value = raw.and_then(parse_int).filter(|value| field.accepts(*value));
        if value.is_none() {
            errors.push(ErrorItem::invalid(ValueLocation::Body, field.name(), raw.cloned()));
        }
        value.unwrap_or_default()
    };

    let user_id = value_of(Field::UserId);
    let location_id = value_of(Field::LocationId);
    let star_rating = value_of(Field::StarRating);

    if !errors.is_empty() {
        return Err(CheckinError::Validation(errors));
    }

    Checkin::from_parts(user_id, location_id, star_rating).map_err(|invalid| {
        CheckinError::Validation(
            invalid
                .into_iter()
                .map(|field| {
                    let value = fields.get(field.name()).cloned();
                    ErrorItem::invalid(ValueLocation::Body, field.name(), value)
                })
                .collect(),
        )
    })
}

/// Validates the bounds of a range query, in milliseconds.
pub fn validate_range(start_time: &str, end_time: &str) -> Result<(u64, u64), CheckinError> {
    let parse = |s: &str| parse_int_literal(s).and_then(|value| u64::try_from(value).ok());
    let bounds = [("startTime", start_time), ("endTime", end_time)];

    let mut errors: Vec<ErrorItem> = bounds
        .iter()
        .filter(|(_, raw)| parse(*raw).is_none())
        .map(|(param, raw)| {
            ErrorItem::invalid(ValueLocation::Params, param, Some(Value::String(raw.to_string())))
        })
        .collect();

    match (parse(start_time), parse(end_time)) {
        (Some(start), Some(end)) if start <= end => return Ok((start, end)),
        (Some(_), Some(_)) => errors.extend(bounds.iter().map(|(param, raw)| {
            ErrorItem::new(
                ValueLocation::Params,
                param,
                Some(Value::String(raw.to_string())),
                RANGE_ORDER_MSG,
            )
        })),
        _ => {}
    }

    Err(CheckinError::Validation(errors))
}

/// Admission side of the pipeline: validation, dedup and append.
pub struct Gateway {
    store: Arc<dyn CheckinStore>,
    filter: DedupFilter,
    max_log_length: u64,
}

impl Gateway {
    pub fn new(store: Arc<dyn CheckinStore>, filter: DedupFilter, max_log_length: u64) -> Self {
        Self {
            store,
            filter,
            max_log_length,
        }
    }

    /// Admits one check-in. The dedup decision and the append have both
    /// completed by the time this returns `Ok`.
    pub async fn submit(&self, body: &Value) -> Result<LogEntryId, CheckinError> {
        let checkin = validate(body)?;
        let positions = self.filter.positions(&checkin.dedup_key());

        let admission = self
            .store
            .admit(&checkin, &positions, self.max_log_length)
            .await
            .map_err(|err| {
                error!("failed to admit check-in {}: {}", checkin.dedup_key(), err);
                err
            })?;

        match admission {
            Admission::Accepted(id) => {
                debug!("received check-in, added to log as {id}");
                Ok(id)
            }
            Admission::Duplicate => {
                debug!("rejected duplicate check-in {}", checkin.dedup_key());
                Err(CheckinError::Duplicate(body.clone()))
            }
        }
    }

    /// Log entries whose timestamp falls within the given bounds, oldest first.
    pub async fn range(
        &self,
        start_time: &str,
        end_time: &str,
    ) -> Result<Vec<CheckinRecord>, CheckinError> {
        let (start, end) = validate_range(start_time, end_time)?;
        let entries = self.store.range(start, end, MAX_RANGE_ENTRIES).await?;

        Ok(entries
            .iter()
            .filter_map(|raw| match LogEntry::try_from(raw) {
                Ok(entry) => Some(CheckinRecord::from(&entry)),
                Err(err) => {
                    warn!("skipping malformed log entry {}: {}", raw.id, err);
                    None
                }
            })
            .collect())
    }
}
