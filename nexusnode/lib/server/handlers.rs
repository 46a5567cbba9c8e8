//! HTTP request handlers for the REST API.
//!
//! Every handler resolves the instance through the caller first, so instances owned by someone
//! else look exactly like instances that do not exist.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

use super::{
    data::{
        ActionRequest, ErrorResponse, ErrorType, InstanceAction, ReadQuery, RenameRequest,
        UpdateStartupRequest, WriteQuery,
    },
    state::ServerState,
};
use crate::{
    models::{Caller, Instance, NodeKind, ServerResource, SessionInfo, WorkspaceNode},
    registry::NewInstance,
    NexusError,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Result type of every handler.
pub type ApiResult<T> = Result<T, ErrorResponse>;

//--------------------------------------------------------------------------------------------------
// Functions: Instances
//--------------------------------------------------------------------------------------------------

/// Handler for `POST /instances`
pub async fn create_instance(
    State(state): State<ServerState>,
    caller: Caller,
    Json(new): Json<NewInstance>,
) -> ApiResult<(StatusCode, Json<Instance>)> {
    let instance = state
        .host()
        .get_registry()
        .create(&caller.identity, new)
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

/// Handler for `GET /instances`
pub async fn list_instances(
    State(state): State<ServerState>,
    caller: Caller,
) -> Json<Vec<Instance>> {
    Json(
        state
            .host()
            .get_registry()
            .list_for(&caller.identity, caller.is_admin),
    )
}

/// Handler for `GET /instances/{id}`
pub async fn get_instance(
    State(state): State<ServerState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(state.host().instance_for(&caller, &id)?))
}

/// Handler for `DELETE /instances/{id}`
pub async fn delete_instance(
    State(state): State<ServerState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Instance>> {
    state.host().instance_for(&caller, &id)?;
    Ok(Json(state.host().get_registry().delete(&id).await?))
}

/// Handler for `POST /instances/{id}/action`
pub async fn instance_action(
    State(state): State<ServerState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(request): Json<ActionRequest>,
) -> ApiResult<Json<Instance>> {
    state.host().instance_for(&caller, &id)?;
    let supervisor = state.host().get_supervisor();

    let instance = match request.action {
        InstanceAction::Start => supervisor.start(&id).await?,
        InstanceAction::Stop => supervisor.stop(&id).await?,
        InstanceAction::Restart => supervisor.restart(&id).await?,
        InstanceAction::Suspend | InstanceAction::Unsuspend if !caller.is_admin => {
            return Err(NexusError::PermissionDenied(
                "only admins can suspend or unsuspend instances".to_string(),
            )
            .into());
        }
        InstanceAction::Suspend => supervisor.suspend(&id).await?,
        InstanceAction::Unsuspend => supervisor.unsuspend(&id).await?,
    };

    tracing::info!(instance_id = %id, caller = %caller.identity, action = ?request.action, status = %instance.status, "instance action");
    Ok(Json(instance))
}

/// Handler for `PATCH /instances/{id}/limits`
pub async fn update_limits(
    State(state): State<ServerState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(limits): Json<ServerResource>,
) -> ApiResult<Json<Instance>> {
    state.host().instance_for(&caller, &id)?;
    Ok(Json(
        state.host().get_registry().update_limits(&id, limits).await?,
    ))
}

/// Handler for `PATCH /instances/{id}/startup`
pub async fn update_startup(
    State(state): State<ServerState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(request): Json<UpdateStartupRequest>,
) -> ApiResult<Json<Instance>> {
    state.host().instance_for(&caller, &id)?;
    Ok(Json(
        state
            .host()
            .get_registry()
            .update_startup(&id, request.startup_command, request.entrypoint)
            .await?,
    ))
}

//--------------------------------------------------------------------------------------------------
// Functions: Sessions
//--------------------------------------------------------------------------------------------------

/// Handler for `GET /instances/{id}/sessions`
pub async fn list_sessions(
    State(state): State<ServerState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<SessionInfo>>> {
    state.host().instance_for(&caller, &id)?;
    Ok(Json(state.host().get_multiplexer().sessions(&id)))
}

/// Handler for `DELETE /sessions/{session_id}`
pub async fn detach_session(
    State(state): State<ServerState>,
    caller: Caller,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<SessionInfo>> {
    let multiplexer = state.host().get_multiplexer();
    let info = multiplexer
        .session(session_id)
        .ok_or_else(|| NexusError::SessionNotFound(session_id.to_string()))?;

    state
        .host()
        .instance_for(&caller, &info.instance_id)
        .map_err(|_| NexusError::SessionNotFound(session_id.to_string()))?;

    Ok(Json(multiplexer.detach(session_id)?))
}

//--------------------------------------------------------------------------------------------------
// Functions: Workspace
//--------------------------------------------------------------------------------------------------

/// Handler for `GET /workspace/{id}`
pub async fn list_workspace_root(
    State(state): State<ServerState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<WorkspaceNode>>> {
    state.host().instance_for(&caller, &id)?;
    Ok(Json(state.host().workspaces().list(&id, "/").await?))
}

/// Handler for `GET /workspace/{id}/{*path}`
///
/// Files are returned as raw bytes and directories as a listing. `?stat=true` returns the
/// node's metadata instead.
pub async fn read_workspace(
    State(state): State<ServerState>,
    caller: Caller,
    Path((id, path)): Path<(String, String)>,
    Query(query): Query<ReadQuery>,
) -> ApiResult<Response> {
    state.host().instance_for(&caller, &id)?;
    let workspaces = state.host().workspaces();

    let node = workspaces.stat(&id, &path).await?;
    if query.stat {
        return Ok(Json(node).into_response());
    }

    match node.kind {
        NodeKind::Directory => Ok(Json(workspaces.list(&id, &node.path).await?).into_response()),
        NodeKind::File => {
            let content = workspaces.read(&id, &node.path).await?;
            Ok((
                [(header::CONTENT_TYPE, "application/octet-stream")],
                content,
            )
                .into_response())
        }
    }
}

/// Handler for `PUT /workspace/{id}/{*path}`
///
/// Writes the body to a file, or creates a directory with `?kind=directory`.
pub async fn write_workspace(
    State(state): State<ServerState>,
    caller: Caller,
    Path((id, path)): Path<(String, String)>,
    Query(query): Query<WriteQuery>,
    body: Bytes,
) -> ApiResult<Json<WorkspaceNode>> {
    state.host().instance_for(&caller, &id)?;
    let workspaces = state.host().workspaces();

    let node = match query.kind {
        Some(NodeKind::Directory) => workspaces.create_dir(&id, &path).await?,
        Some(NodeKind::File) | None => workspaces.write(&id, &path, &body).await?,
    };

    Ok(Json(node))
}

/// Handler for `DELETE /workspace/{id}/{*path}`
pub async fn delete_workspace(
    State(state): State<ServerState>,
    caller: Caller,
    Path((id, path)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.host().instance_for(&caller, &id)?;
    state.host().workspaces().delete(&id, &path).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `POST /workspace/{id}/{*path}/rename`
pub async fn rename_workspace(
    State(state): State<ServerState>,
    caller: Caller,
    Path((id, path)): Path<(String, String)>,
    Json(request): Json<RenameRequest>,
) -> ApiResult<Json<WorkspaceNode>> {
    let Some(from) = path.strip_suffix("/rename") else {
        return Err(ErrorResponse::new(
            StatusCode::NOT_FOUND.as_u16(),
            format!("no workspace operation at {}", path),
            ErrorType::NotFound,
        ));
    };

    state.host().instance_for(&caller, &id)?;
    Ok(Json(
        state
            .host()
            .workspaces()
            .rename(&id, from, &request.to)
            .await?,
    ))
}
