use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    models::{NodeKind, SessionInfo},
    NexusError,
};

//--------------------------------------------------------------------------------------------------
// Types: Requests
//--------------------------------------------------------------------------------------------------

/// Request body for `POST /instances/{id}/action`.
#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    /// The lifecycle action to perform.
    pub action: InstanceAction,
}

/// Lifecycle actions. Suspend and unsuspend are reserved for admins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceAction {
    /// Launch the sandbox.
    Start,

    /// Stop the sandbox.
    Stop,

    /// Stop, then start.
    Restart,

    /// Force-stop and lock the instance.
    Suspend,

    /// Unlock a suspended instance.
    Unsuspend,
}

/// Request body for `PATCH /instances/{id}/startup`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStartupRequest {
    /// New startup command, if changing.
    pub startup_command: Option<String>,

    /// New entrypoint, if changing.
    pub entrypoint: Option<String>,
}

/// Request body for `POST /workspace/{id}/{path}/rename`.
#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    /// The new path.
    pub to: String,
}

/// Query of `GET /workspace/{id}/{path}`.
#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    /// Return metadata instead of content.
    #[serde(default)]
    pub stat: bool,
}

/// Query of `PUT /workspace/{id}/{path}`.
#[derive(Debug, Default, Deserialize)]
pub struct WriteQuery {
    /// What to create. Defaults to a file whose content is the request body.
    pub kind: Option<NodeKind>,
}

//--------------------------------------------------------------------------------------------------
// Types: Streaming
//--------------------------------------------------------------------------------------------------

/// Control messages sent as text over session websockets, next to the session frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ControlMessage {
    /// First message of every session.
    Session(SessionInfo),
}

//--------------------------------------------------------------------------------------------------
// Types: Error Response
//--------------------------------------------------------------------------------------------------

/// Standard error response format
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub code: u16,

    /// Error message
    pub message: String,

    /// Error type for categorizing errors
    pub error_type: ErrorType,

    /// Optional additional details about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Types of errors that can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Invalid request parameters or body
    ValidationError,

    /// No caller identity was supplied
    Unauthorized,

    /// The caller may not perform the operation
    Forbidden,

    /// Resource not found
    NotFound,

    /// The instance is in the wrong lifecycle state
    InvalidState,

    /// Another operation is in flight, or the target already exists
    Conflict,

    /// The entrypoint is missing from the workspace
    EntrypointError,

    /// No ports or other host resources left
    ResourceExhausted,

    /// The sandbox could not be launched
    SandboxError,

    /// Internal server errors
    InternalError,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: u16, message: String, error_type: ErrorType) -> Self {
        Self {
            code,
            message,
            error_type,
            details: None,
        }
    }

    /// Add details to the error response, ignoring details for 500-level errors
    pub fn with_details(mut self, details: String) -> Self {
        if self.code < 500 {
            self.details = Some(details);
        }
        self
    }

    /// The response for a request without caller identity.
    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED.as_u16(),
            "missing caller identity".to_string(),
            ErrorType::Unauthorized,
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<NexusError> for ErrorResponse {
    fn from(error: NexusError) -> Self {
        let (status, error_type) = match &error {
            NexusError::InstanceNotFound(_)
            | NexusError::PathNotFound(_)
            | NexusError::SessionNotFound(_) => (StatusCode::NOT_FOUND, ErrorType::NotFound),
            NexusError::InvalidState { .. } => (StatusCode::CONFLICT, ErrorType::InvalidState),
            NexusError::ConflictingOperation(_) | NexusError::AlreadyExists(_) => {
                (StatusCode::CONFLICT, ErrorType::Conflict)
            }
            NexusError::EntrypointMissing(_) | NexusError::EntrypointLost(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, ErrorType::EntrypointError)
            }
            NexusError::InvalidPath(_) | NexusError::InvalidArgument(_) => {
                (StatusCode::BAD_REQUEST, ErrorType::ValidationError)
            }
            NexusError::PermissionDenied(_) => (StatusCode::FORBIDDEN, ErrorType::Forbidden),
            NexusError::ResourceExhausted(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, ErrorType::ResourceExhausted)
            }
            NexusError::SandboxFailure(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorType::SandboxError)
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, ErrorType::InternalError),
        };

        if status.is_server_error() {
            tracing::error!(error = %error, "request failed");
        }

        ErrorResponse::new(status.as_u16(), error.to_string(), error_type)
            .with_details(format!("{:?}", error))
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceStatus;

    #[test]
    fn test_error_mapping() {
        let response = ErrorResponse::from(NexusError::invalid_state(
            "start",
            InstanceStatus::Suspended,
        ));
        assert_eq!(response.code, 409);
        assert_eq!(response.error_type, ErrorType::InvalidState);
        assert_eq!(
            response.message,
            "cannot start an instance that is suspended"
        );
        assert!(response.details.is_some());

        let response = ErrorResponse::from(NexusError::EntrypointMissing("/index.js".into()));
        assert_eq!(response.code, 422);

        let response = ErrorResponse::from(NexusError::SandboxFailure("boom".into()));
        assert_eq!(response.code, 500);
        assert!(response.details.is_none());
    }

    #[test]
    fn test_action_names() -> anyhow::Result<()> {
        let request: ActionRequest = serde_json::from_str(r#"{"action":"unsuspend"}"#)?;
        assert_eq!(request.action, InstanceAction::Unsuspend);
        assert!(serde_json::from_str::<ActionRequest>(r#"{"action":"pause"}"#).is_err());
        Ok(())
    }
}
