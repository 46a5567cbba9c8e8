//! Route definitions for the HTTP server.

use axum::{
    routing::{delete, get, patch, post},
    Router,
};

use super::{handlers, state::ServerState, ws};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Creates a router with every API endpoint configured
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route(
            "/instances",
            post(handlers::create_instance).get(handlers::list_instances),
        )
        .route(
            "/instances/{id}",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .route("/instances/{id}/action", post(handlers::instance_action))
        .route("/instances/{id}/limits", patch(handlers::update_limits))
        .route("/instances/{id}/startup", patch(handlers::update_startup))
        .route("/instances/{id}/sessions", get(handlers::list_sessions))
        .route("/instances/{id}/logs", get(ws::log_tail))
        .route("/instances/{id}/shell", get(ws::shell))
        .route("/sessions/{session_id}", delete(handlers::detach_session))
        .route("/workspace/{id}", get(handlers::list_workspace_root))
        .route(
            "/workspace/{id}/{*path}",
            get(handlers::read_workspace)
                .put(handlers::write_workspace)
                .delete(handlers::delete_workspace)
                .post(handlers::rename_workspace),
        )
        .with_state(state)
}
