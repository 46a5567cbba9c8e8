use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

use crate::models::InstanceStatus;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a nexusnode-related operation.
pub type NexusResult<T> = Result<T, NexusError>;

/// An error that occurred while managing instances, workspaces or sessions.
#[derive(Debug, Error)]
pub enum NexusError {
    /// The instance does not exist, or is not visible to the caller.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The workspace path does not exist.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// The session does not exist or has already been detached.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The operation is not valid for the instance's current lifecycle state.
    #[error("cannot {action} an instance that is {status}")]
    InvalidState {
        /// The attempted operation
        action: String,

        /// The state the instance was in
        status: InstanceStatus,
    },

    /// No more network ports or other host resources are available.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The entrypoint file could not be found in the workspace at start time.
    #[error("entrypoint missing from workspace: {0}")]
    EntrypointMissing(String),

    /// The entrypoint file disappeared while the instance was running.
    #[error("entrypoint lost while running: {0}")]
    EntrypointLost(String),

    /// Another lifecycle operation is already in flight for the instance.
    #[error("another operation is already in progress for instance {0}")]
    ConflictingOperation(String),

    /// The sandbox process could not be created or died before becoming ready.
    #[error("sandbox failure: {0}")]
    SandboxFailure(String),

    /// A workspace node already exists at the path.
    #[error("path already exists: {0}")]
    AlreadyExists(String),

    /// The workspace path is malformed or not allowed for the operation.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A request argument is malformed or out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller is not allowed to perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from the registry database.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error that occurred while migrating the registry database.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A (de)serialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The host configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// The host configuration could not be serialized.
    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// An error from the shared utilities.
    #[error(transparent)]
    Utils(#[from] nexusutils::NexusutilsError),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NexusError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> NexusError {
        NexusError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Creates an [`NexusError::InvalidState`] for `action` attempted while in `status`.
    pub fn invalid_state(action: impl Into<String>, status: InstanceStatus) -> NexusError {
        NexusError::InvalidState {
            action: action.into(),
            status,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `NexusResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> NexusResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
