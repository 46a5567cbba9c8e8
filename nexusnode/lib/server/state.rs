//! Server state management.

use axum::{extract::FromRequestParts, http::request::Parts};

use super::data::ErrorResponse;
use crate::{host::NodeHost, models::Caller};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Header carrying the verified identity of the caller.
pub const CALLER_HEADER: &str = "x-nexus-user";

/// Header that marks the caller as an admin when set to `true` or `1`.
pub const ADMIN_HEADER: &str = "x-nexus-admin";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Shared server state, cloned into every handler.
#[derive(Clone)]
pub struct ServerState {
    host: NodeHost,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServerState {
    /// Creates the state around an opened host.
    pub fn new(host: NodeHost) -> Self {
        Self { host }
    }

    /// The node host.
    pub fn host(&self) -> &NodeHost {
        &self.host
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ErrorResponse;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let identity = parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(ErrorResponse::unauthorized)?;

        let is_admin = parts
            .headers
            .get(ADMIN_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| matches!(value.trim(), "true" | "1"));

        Ok(Caller {
            identity: identity.to_string(),
            is_admin,
        })
    }
}
