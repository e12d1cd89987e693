use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_STAR_RATING: i64 = 5;

/// The three fields a check-in carries, in the order they are written to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    LocationId,
    UserId,
    StarRating,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::LocationId, Field::UserId, Field::StarRating];

    pub fn name(self) -> &'static str {
        match self {
            Field::LocationId => "locationId",
            Field::UserId => "userId",
            Field::StarRating => "starRating",
        }
    }

    pub fn from_name(name: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|field| field.name() == name)
    }

    /// Whether `value` is in range for this field.
    pub fn accepts(self, value: i64) -> bool {
        match self {
            Field::LocationId | Field::UserId => value >= 1,
            Field::StarRating => (0..=MAX_STAR_RATING).contains(&value),
        }
    }
}

/// A user visiting a location and rating it. Immutable once appended to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkin {
    pub user_id: u64,
    pub location_id: u64,
    pub star_rating: u8,
}

impl Checkin {
    /// Builds a check-in from raw integers, reporting every field that is out of range.
    pub fn from_parts(user_id: i64, location_id: i64, star_rating: i64) -> Result<Self, Vec<Field>> {
        let invalid: Vec<Field> = [
            (Field::UserId, user_id),
            (Field::LocationId, location_id),
            (Field::StarRating, star_rating),
        ]
        .into_iter()
        .filter(|(field, value)| !field.accepts(*value))
        .map(|(field, _)| field)
        .collect();

        if !invalid.is_empty() {
            return Err(invalid);
        }

        // Ranges were checked above, so the casts are lossless.
        Ok(Checkin {
            user_id: user_id as u64,
            location_id: location_id as u64,
            star_rating: star_rating as u8,
        })
    }

    /// Natural key used by the dedup filter: `userId:locationId:starRating`.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.user_id, self.location_id, self.star_rating)
    }

    pub fn value(&self, field: Field) -> u64 {
        match field {
            Field::LocationId => self.location_id,
            Field::UserId => self.user_id,
            Field::StarRating => u64::from(self.star_rating),
        }
    }

    /// Flat name/value pairs as stored in a log entry.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        Field::ALL
            .into_iter()
            .map(|field| (field.name(), self.value(field).to_string()))
            .collect()
    }
}

/// Log-assigned entry id, `<millis-timestamp>-<sequence>`. Ordering follows the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogEntryId {
    pub millis: u64,
    pub sequence: u64,
}

impl LogEntryId {
    pub const ZERO: LogEntryId = LogEntryId {
        millis: 0,
        sequence: 0,
    };

    pub fn new(millis: u64, sequence: u64) -> Self {
        Self { millis, sequence }
    }

    /// Milliseconds since the epoch at which the log accepted the entry.
    pub fn timestamp(&self) -> u64 {
        self.millis
    }
}

impl fmt::Display for LogEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.sequence)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid log entry id: {0}")]
pub struct InvalidEntryId(pub String);

impl FromStr for LogEntryId {
    type Err = InvalidEntryId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidEntryId(s.to_owned());
        let (millis, sequence) = s.split_once('-').ok_or_else(invalid)?;

        Ok(LogEntryId {
            millis: millis.parse().map_err(|_| invalid())?,
            sequence: sequence.parse().map_err(|_| invalid())?,
        })
    }
}

/// An entry as it comes off the wire: the assigned id and the flat field list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedEntry {
    #[error(transparent)]
    InvalidId(#[from] InvalidEntryId),
    #[error("entry has no {0} field")]
    MissingField(&'static str),
    #[error("entry has an unexpected field {0}")]
    UnexpectedField(String),
    #[error("entry repeats the {0} field")]
    DuplicateField(&'static str),
    #[error("entry has an invalid {field} value: {value:?}")]
    InvalidValue { field: &'static str, value: String },
}

/// A parsed log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub id: LogEntryId,
    pub checkin: Checkin,
}

impl LogEntry {
    pub fn timestamp(&self) -> u64 {
        self.id.timestamp()
    }
}

impl TryFrom<&RawEntry> for LogEntry {
    type Error = MalformedEntry;

    /// Requires exactly the three check-in fields, in any order.
    fn try_from(raw: &RawEntry) -> Result<Self, Self::Error> {
        let id: LogEntryId = raw.id.parse()?;
        let mut values: [Option<i64>; 3] = [None; 3];

        for (name, value) in &raw.fields {
            let field =
                Field::from_name(name).ok_or_else(|| MalformedEntry::UnexpectedField(name.clone()))?;
            let slot = &mut values[field as usize];
            if slot.is_some() {
                return Err(MalformedEntry::DuplicateField(field.name()));
            }
            let parsed = value.parse().map_err(|_| MalformedEntry::InvalidValue {
                field: field.name(),
                value: value.clone(),
            })?;
            *slot = Some(parsed);
        }

        let get = |field: Field| values[field as usize].ok_or(MalformedEntry::MissingField(field.name()));
        let (user_id, location_id, star_rating) =
            (get(Field::UserId)?, get(Field::LocationId)?, get(Field::StarRating)?);

        let checkin = Checkin::from_parts(user_id, location_id, star_rating).map_err(|invalid| {
            let field = invalid[0];
            MalformedEntry::InvalidValue {
                field: field.name(),
                value: values[field as usize].unwrap_or_default().to_string(),
            }
        })?;

        Ok(LogEntry { id, checkin })
    }
}
