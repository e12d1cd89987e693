use std::sync::Arc;

use assert_json_diff::assert_json_eq;
use axum::{
    body::Body,
    http::{self, Request, StatusCode},
    Router,
};
use checkin_capture::gateway::Gateway;
use checkin_capture::router::router;
use checkin_common::checkin::{Checkin, LogEntryId};
use checkin_common::filter::DedupFilter;
use checkin_common::mock::MemoryStore;
use health::HealthRegistry;
use http_body_util::BodyExt; // for `collect`
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

fn app(store: &MemoryStore) -> Router {
    let filter = DedupFilter::new(1_000_000, 0.0001).expect("valid filter settings");
    let gateway = Arc::new(Gateway::new(Arc::new(store.clone()), filter, 10_000));

    router(gateway, HealthRegistry::new("readiness"), false).expect("router without metrics")
}

async fn post_checkin(app: &Router, body: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(http::Method::POST)
                .uri("/api/checkin")
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_owned()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn accepts_then_rejects_a_duplicate() {
    let store = MemoryStore::new();
    let app = app(&store);
    let body = r#"{"userId": 1, "locationId": 1, "starRating": 5}"#;

    let (status, json) = post_checkin(&app, body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json, Value::Null);

    let (status, json) = post_checkin(&app, body).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_json_eq!(
        json,
        json!({
            "errors": [{
                "value": {"userId": 1, "locationId": 1, "starRating": 5},
                "msg": "Duplicate checkin",
                "param": "",
                "location": "body"
            }]
        })
    );

    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn different_rating_is_not_a_duplicate() {
    let store = MemoryStore::new();
    let app = app(&store);

    let (first, _) = post_checkin(&app, r#"{"userId": 5, "locationId": 2, "starRating": 0}"#).await;
    let (second, _) =
        post_checkin(&app, r#"{"userId": 5, "locationId": 2, "starRating": 4}"#).await;

    assert_eq!(first, StatusCode::ACCEPTED);
    assert_eq!(second, StatusCode::ACCEPTED);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn invalid_rating_is_named() {
    let store = MemoryStore::new();
    let app = app(&store);

    let (status, json) =
        post_checkin(&app, r#"{"userId": 1, "locationId": 1, "starRating": 7}"#).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_eq!(
        json,
        json!({
            "errors": [{
                "value": 7,
                "msg": "Invalid value",
                "param": "starRating",
                "location": "body"
            }]
        })
    );
    assert!(store.is_empty());
}

#[tokio::test]
async fn every_invalid_field_is_listed() {
    let store = MemoryStore::new();
    let app = app(&store);

    let (status, json) = post_checkin(&app, r#"{"userId": "abc", "starRating": -1}"#).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_eq!(
        json,
        json!({
            "errors": [
                {"value": "abc", "msg": "Invalid value", "param": "userId", "location": "body"},
                {"msg": "Invalid value", "param": "locationId", "location": "body"},
                {"value": -1, "msg": "Invalid value", "param": "starRating", "location": "body"}
            ]
        })
    );
}

#[tokio::test]
async fn leading_zeros_are_accepted_and_explicit_nulls_echoed() {
    let store = MemoryStore::new();
    let app = app(&store);

    let (status, _) =
        post_checkin(&app, r#"{"userId": "007", "locationId": "01", "starRating": "05"}"#).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = post_checkin(&app, r#"{"userId": 7, "locationId": 1, "starRating": 5}"#).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, json) =
        post_checkin(&app, r#"{"userId": null, "locationId": 1, "starRating": 5}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_eq!(
        json,
        json!({
            "errors": [
                {"value": null, "msg": "Invalid value", "param": "userId", "location": "body"}
            ]
        })
    );
}

#[tokio::test]
async fn body_must_be_a_json_object() {
    let store = MemoryStore::new();
    let app = app(&store);

    let (status, json) = post_checkin(&app, "not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_eq!(
        json,
        json!({"errors": [{"msg": "Invalid value", "param": "", "location": "body"}]})
    );

    let (status, _) = post_checkin(&app, "[1, 1, 5]").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unavailable_store_is_a_503() {
    let store = MemoryStore::new();
    let app = app(&store);
    store.fail_next(1);

    let (status, _) = post_checkin(&app, r#"{"userId": 3, "locationId": 3, "starRating": 3}"#).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // Nothing was marked as seen, so a retry goes through.
    let (status, _) = post_checkin(&app, r#"{"userId": 3, "locationId": 3, "starRating": 3}"#).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn range_returns_entries_within_bounds() {
    let store = MemoryStore::new();
    let app = app(&store);
    for (sequence, millis) in [1000, 1250, 1500, 1501, 2000].into_iter().enumerate() {
        store.append_with_id(
            LogEntryId::new(millis, sequence as u64),
            &Checkin::from_parts(9, 4, 3).expect("valid check-in"),
        );
    }

    let (status, json) = get(&app, "/api/checkins/1000/1500").await;
    assert_eq!(status, StatusCode::OK);

    let ids: Vec<&str> = json
        .as_array()
        .expect("an array of check-ins")
        .iter()
        .map(|entry| entry["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["1000-0", "1250-1", "1500-2"]);

    assert_json_eq!(
        json[0],
        json!({"id": "1000-0", "timestamp": 1000, "userId": 9, "locationId": 4, "starRating": 3})
    );
}

#[tokio::test]
async fn range_is_capped() {
    let store = MemoryStore::new();
    let app = app(&store);
    let checkin = Checkin::from_parts(1, 1, 1).expect("valid check-in");
    for sequence in 0..1200 {
        store.append_with_id(LogEntryId::new(5000, sequence), &checkin);
    }

    let (status, json) = get(&app, "/api/checkins/0/10000").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().map(Vec::len), Some(1000));
}

#[tokio::test]
async fn range_bounds_are_validated() {
    let store = MemoryStore::new();
    let app = app(&store);

    let (status, json) = get(&app, "/api/checkins/2000/1000").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_eq!(
        json,
        json!({
            "errors": [
                {
                    "value": "2000",
                    "msg": "startTime must be less than or equal to endTime.",
                    "param": "startTime",
                    "location": "params"
                },
                {
                    "value": "1000",
                    "msg": "startTime must be less than or equal to endTime.",
                    "param": "endTime",
                    "location": "params"
                }
            ]
        })
    );

    let (status, _) = get(&app, "/api/checkins/abc/1000").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn index_and_liveness_answer() {
    let store = MemoryStore::new();
    let app = app(&store);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"checkin-capture");

    let response = app
        .oneshot(Request::builder().uri("/_liveness").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// The only test here that installs the global metrics recorder.
#[tokio::test]
async fn requests_are_counted_by_route_pattern() {
    let store = MemoryStore::new();
    let filter = DedupFilter::new(1_000, 0.01).expect("valid filter settings");
    let gateway = Arc::new(Gateway::new(Arc::new(store.clone()), filter, 100));
    let app = router(gateway, HealthRegistry::new("readiness"), true).expect("router with metrics");

    let (status, _) = get(&app, "/api/checkins/1000/2000").await;
    assert_eq!(status, StatusCode::OK);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let rendered = String::from_utf8(body.to_vec()).unwrap();

    assert!(rendered.contains(r#"route="/api/checkins/:start_time/:end_time""#));
    assert!(!rendered.contains("1000/2000"));
}
