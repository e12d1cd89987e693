use std::future::ready;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use checkin_common::metrics::{setup_metrics_recorder, track_metrics};
use health::HealthRegistry;
use metrics_exporter_prometheus::BuildError;
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::api::{CheckinError, CheckinRecord, ErrorItem, ValueLocation};
use crate::gateway::Gateway;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

async fn index() -> &'static str {
    "checkin-capture"
}

pub async fn checkin(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, CheckinError> {
    metrics::counter!("checkin_received_total").increment(1);

    let result = match serde_json::from_slice::<Value>(&body) {
        Ok(body) => state.gateway.submit(&body).await,
        Err(_) => Err(CheckinError::Validation(vec![ErrorItem::invalid(
            ValueLocation::Body,
            "",
            None,
        )])),
    };

    match result {
        Ok(_) => {
            metrics::counter!("checkin_accepted_total").increment(1);
            Ok(StatusCode::ACCEPTED)
        }
        Err(err) => {
            metrics::counter!("checkin_rejected_total", "reason" => err.reason()).increment(1);
            Err(err)
        }
    }
}

pub async fn checkins(
    State(state): State<AppState>,
    Path((start_time, end_time)): Path<(String, String)>,
) -> Result<Json<Vec<CheckinRecord>>, CheckinError> {
    Ok(Json(state.gateway.range(&start_time, &end_time).await?))
}

/// `readiness` tracks the store; liveness only needs the process to answer.
pub fn router(
    gateway: Arc<Gateway>,
    readiness: HealthRegistry,
    metrics: bool,
) -> Result<Router, BuildError> {
    let state = AppState { gateway };

    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route(
            "/_readiness",
            get(move || ready(readiness.get_status())),
        )
        .route("/api/checkin", post(checkin))
        .route("/api/checkins/:start_time/:end_time", get(checkins))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Installing a global recorder when used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder()?;

        Ok(router.route("/metrics", get(move || ready(recorder_handle.render()))))
    } else {
        Ok(router)
    }
}
