use crate::db_types::{CallRecord, ScheduledCall};
use crate::dispatch::DispatchReport;
use crate::engine::IngestOutcome;
use crate::error::AppError;
use crate::types::{AppState, ExecuteParams, PlaceCallBody};
use crate::vapi_types::SECRET_HEADER;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

/// Platform webhook.  Pre-call requests get the body the platform expects; everything else an
/// acknowledgement.
pub async fn vapi_webhook(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    match app_state.engine.ingest_push(&body, presented).await? {
        IngestOutcome::PreCall(response) => Ok(Json(response)),
        IngestOutcome::Merged(record) => {
            debug!(call_id = %record.external_id, status = %record.status, "webhook processed");
            Ok(Json(json!({ "status": "ok" })))
        }
    }
}

pub async fn place_call(
    State(app_state): State<Arc<AppState>>,
    Json(body): Json<PlaceCallBody>,
) -> Result<(StatusCode, Json<CallRecord>), AppError> {
    let record = app_state
        .engine
        .place_call(
            body.owner,
            &body.assistant_id,
            &body.phone_number_id,
            &body.customer_number,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn refresh_call(
    State(app_state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<Json<CallRecord>, AppError> {
    Ok(Json(app_state.engine.refresh(&call_id).await?))
}

pub async fn execute_scheduled(
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<ExecuteParams>,
) -> Result<Json<DispatchReport>, AppError> {
    let report = app_state
        .engine
        .run_due(OffsetDateTime::now_utc(), params.owner)
        .await?;
    info!(executed = report.executed, failed = report.failed, "manual dispatch run");
    Ok(Json(report))
}

pub async fn cancel_scheduled(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScheduledCall>, AppError> {
    Ok(Json(app_state.engine.cancel_scheduled(id).await?))
}

pub async fn health() -> &'static str {
    "ok"
}
