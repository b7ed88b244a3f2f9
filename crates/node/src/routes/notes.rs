//! Note command and query endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{AggregateId, CommandId};
use domain::{Aggregate, Command, CommandEnvelope};
use event_store::Version;
use processing::{CommandOutcome, CommandService};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::note::{ChangeNoteTitle, CreateNote, Note};

// -- Request types --

/// A caller-chosen `command_id` makes resubmission idempotent.
#[derive(Deserialize)]
pub struct CreateNoteRequest {
    pub command_id: Option<String>,
    pub note_id: Option<String>,
    pub title: String,
}

#[derive(Deserialize)]
pub struct ChangeTitleRequest {
    pub command_id: Option<String>,
    pub title: String,
}

// -- Response types --

#[derive(Serialize)]
pub struct NoteResponse {
    pub id: String,
    pub version: Version,
    pub title: String,
}

// -- Handlers --

/// POST /notes
#[tracing::instrument(skip(service, req))]
pub async fn create(
    State(service): State<CommandService>,
    Json(req): Json<CreateNoteRequest>,
) -> Result<(StatusCode, Json<CommandOutcome>), ApiError> {
    let command = CreateNote {
        note_id: req
            .note_id
            .unwrap_or_else(|| AggregateId::new().into_inner()),
        title: req.title,
    };
    let outcome = execute(&service, &command, req.command_id).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// PUT /notes/{id}/title
#[tracing::instrument(skip(service, req))]
pub async fn change_title(
    State(service): State<CommandService>,
    Path(id): Path<String>,
    Json(req): Json<ChangeTitleRequest>,
) -> Result<Json<CommandOutcome>, ApiError> {
    let command = ChangeNoteTitle {
        note_id: id,
        title: req.title,
    };
    let outcome = execute(&service, &command, req.command_id).await?;
    Ok(Json(outcome))
}

/// GET /notes/{id}
#[tracing::instrument(skip(service))]
pub async fn get(
    State(service): State<CommandService>,
    Path(id): Path<String>,
) -> Result<Json<NoteResponse>, ApiError> {
    let view = service
        .aggregate(Note::aggregate_type(), &AggregateId::from(id.as_str()))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Note {id} not found")))?;

    let note: Note = serde_json::from_value(view.state)
        .map_err(|e| ApiError::Internal(format!("Unreadable note {id}: {e}")))?;

    Ok(Json(NoteResponse {
        id,
        version: view.version,
        title: note.title,
    }))
}

async fn execute<C: Command>(
    service: &CommandService,
    command: &C,
    command_id: Option<String>,
) -> Result<CommandOutcome, ApiError> {
    let mut envelope =
        CommandEnvelope::new(command).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if let Some(command_id) = command_id {
        envelope = envelope.with_command_id(CommandId::from(command_id));
    }
    Ok(service.execute(envelope).await?)
}
