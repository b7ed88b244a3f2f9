//! Operator endpoints acting on any registered aggregate type.

use axum::Json;
use axum::extract::{Path, State};
use common::AggregateId;
use event_store::Version;
use processing::CommandService;
use serde::Serialize;

use crate::error::ApiError;

#[derive(Serialize)]
pub struct RebuildResponse {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub version: Version,
}

/// POST /aggregates/{aggregate_type}/{id}/rebuild: drops the cached
/// instance and replays it from the event store.
#[tracing::instrument(skip(service))]
pub async fn rebuild(
    State(service): State<CommandService>,
    Path((aggregate_type, id)): Path<(String, String)>,
) -> Result<Json<RebuildResponse>, ApiError> {
    let aggregate_id = AggregateId::from(id.as_str());
    let version = service
        .rebuild(&aggregate_type, &aggregate_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{aggregate_type} {id} not found")))?;

    tracing::info!(%version, "aggregate rebuilt on request");
    Ok(Json(RebuildResponse {
        aggregate_type,
        aggregate_id: id,
        version,
    }))
}
