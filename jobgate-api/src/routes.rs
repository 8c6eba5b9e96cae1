//! Route handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use jobgate::migrate::current_revision;
use jobgate::queue::{AttemptRecord, RequeueOutcome, StateCounts};
use jobgate::{Enqueued, NewUnit, UnitFilter, UnitId, UnitState, WorkStore, WorkUnit};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::server::ApiState;

const MAX_LIST_LIMIT: u32 = 500;

/// Body of `POST /v1/units`.
#[derive(Debug, Deserialize)]
pub struct CreateUnit {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    pub max_attempts: Option<u32>,
    pub dedupe_key: Option<String>,
    /// Seconds before the unit becomes claimable.
    #[serde(default)]
    pub delay_secs: u64,
}

impl CreateUnit {
    fn into_new_unit(self) -> ApiResult<NewUnit> {
        let kind = self.kind.trim();
        if kind.is_empty() {
            return Err(ApiError::bad_request("kind must not be empty"));
        }
        let mut unit = NewUnit::new(kind, self.payload).delay(Duration::from_secs(self.delay_secs));
        if let Some(n) = self.max_attempts {
            if n == 0 {
                return Err(ApiError::bad_request("max_attempts must be at least 1"));
            }
            unit = unit.max_attempts(n);
        }
        if let Some(key) = self.dedupe_key.filter(|k| !k.is_empty()) {
            unit = unit.dedupe_key(key);
        }
        Ok(unit)
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    state: Option<String>,
    kind: Option<String>,
    limit: Option<u32>,
}

pub(crate) async fn index() -> Json<Value> {
    Json(json!({
        "message": "jobgate API",
        "status": "active",
    }))
}

pub(crate) async fn health(State(state): State<Arc<ApiState>>) -> Response {
    match current_revision(state.store.pool()).await {
        Ok(revision) => Json(json!({
            "status": "ok",
            "revision": revision.map(|r| r.to_string()),
            "expected_revision": state.expected_revision.as_ref().map(|r| r.to_string()),
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "health check could not reach the store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unavailable",
                    "error": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

pub(crate) async fn stats(State(state): State<Arc<ApiState>>) -> ApiResult<Json<StateCounts>> {
    Ok(Json(state.store.stats().await?))
}

pub(crate) async fn create_unit(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<CreateUnit>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Enqueued>)> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let unit = body.into_new_unit()?;
    let kind = unit.kind.clone();

    let enqueued = state.store.enqueue(unit).await?;
    let status = if enqueued.is_created() {
        tracing::info!(unit_id = %enqueued.id(), kind = %kind, "unit enqueued");
        StatusCode::CREATED
    } else {
        tracing::debug!(unit_id = %enqueued.id(), kind = %kind, "duplicate enqueue");
        StatusCode::OK
    };
    Ok((status, Json(enqueued)))
}

pub(crate) async fn list_units(
    State(state): State<Arc<ApiState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<WorkUnit>>> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let mut filter = UnitFilter::default();
    if let Some(s) = query.state.as_deref().filter(|s| !s.is_empty()) {
        filter.state = Some(
            s.parse::<UnitState>()
                .map_err(|_| ApiError::bad_request(format!("unknown state {s:?}")))?,
        );
    }
    filter.kind = query.kind.filter(|k| !k.is_empty());
    if let Some(limit) = query.limit {
        filter.limit = limit.clamp(1, MAX_LIST_LIMIT);
    }

    Ok(Json(state.store.list(&filter).await?))
}

pub(crate) async fn get_unit(
    State(state): State<Arc<ApiState>>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<WorkUnit>> {
    let id = unit_id(id)?;
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unit {id} not found")))
}

pub(crate) async fn unit_attempts(
    State(state): State<Arc<ApiState>>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Vec<AttemptRecord>>> {
    let id = unit_id(id)?;
    if state.store.get(id).await?.is_none() {
        return Err(ApiError::not_found(format!("unit {id} not found")));
    }
    Ok(Json(state.store.attempts(id).await?))
}

pub(crate) async fn requeue_unit(
    State(state): State<Arc<ApiState>>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let id = unit_id(id)?;
    match state.store.requeue(id).await? {
        RequeueOutcome::Requeued => {
            tracing::info!(unit_id = %id, "unit requeued");
            Ok(Json(json!({ "status": "requeued", "id": id })))
        }
        RequeueOutcome::NotFound => Err(ApiError::not_found(format!("unit {id} not found"))),
        RequeueOutcome::NotFailed(current) => Err(ApiError::conflict(format!(
            "unit {id} is {current}; only failed units can be requeued"
        ))),
        RequeueOutcome::DuplicateOutstanding => Err(ApiError::conflict(format!(
            "another outstanding unit shares the dedupe key of unit {id}"
        ))),
    }
}

fn unit_id(path: Result<Path<i64>, PathRejection>) -> ApiResult<UnitId> {
    let Path(id) = path.map_err(|e| ApiError::bad_request(e.body_text()))?;
    Ok(UnitId(id))
}
