use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use checkin_common::checkin::LogEntry;
use checkin_common::store::StoreError;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const INVALID_VALUE: &str = "Invalid value";

/// Where a rejected value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueLocation {
    Body,
    Params,
}

/// One entry of an error response, in the shape API clients already parse.
/// `value` is left out when the field was not sent at all.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub msg: String,
    pub param: String,
    pub location: ValueLocation,
}

impl ErrorItem {
    pub fn new(location: ValueLocation, param: &str, value: Option<Value>, msg: &str) -> Self {
        Self {
            value,
            msg: msg.to_owned(),
            param: param.to_owned(),
            location,
        }
    }

    pub fn invalid(location: ValueLocation, param: &str, value: Option<Value>) -> Self {
        Self::new(location, param, value, INVALID_VALUE)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    errors: Vec<ErrorItem>,
}

#[derive(Error, Debug)]
pub enum CheckinError {
    #[error("request failed validation on {} value(s)", .0.len())]
    Validation(Vec<ErrorItem>),
    #[error("check-in was already submitted")]
    Duplicate(Value),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl CheckinError {
    /// Label for the rejection counter.
    pub fn reason(&self) -> &'static str {
        match self {
            CheckinError::Validation(_) => "invalid",
            CheckinError::Duplicate(_) => "duplicate",
            CheckinError::StoreUnavailable(_) => "unavailable",
        }
    }
}

impl IntoResponse for CheckinError {
    fn into_response(self) -> Response {
        let (status, errors) = match self {
            CheckinError::Validation(errors) => (StatusCode::BAD_REQUEST, errors),
            CheckinError::Duplicate(body) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                vec![ErrorItem::new(
                    ValueLocation::Body,
                    "",
                    Some(body),
                    "Duplicate checkin",
                )],
            ),
            CheckinError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                vec![ErrorItem::new(
                    ValueLocation::Body,
                    "",
                    None,
                    "Service unavailable, please retry",
                )],
            ),
        };

        (status, Json(ErrorBody { errors })).into_response()
    }
}

/// A log entry as returned by the range endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinRecord {
    pub id: String,
    pub timestamp: u64,
    pub user_id: u64,
    pub location_id: u64,
    pub star_rating: u8,
}

impl From<&LogEntry> for CheckinRecord {
    fn from(entry: &LogEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            timestamp: entry.timestamp(),
            user_id: entry.checkin.user_id,
            location_id: entry.checkin.location_id,
            star_rating: entry.checkin.star_rating,
        }
    }
}
