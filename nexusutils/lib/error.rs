//! Errors raised by the nexusutils helpers: workspace path handling, rotating console logs,
//! pseudo terminals and process signalling.

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a nexusutils helper.
pub type NexusutilsResult<T> = Result<T, NexusutilsError>;

/// An error raised by one of the nexusutils helpers.
///
/// Callers in nexusnode map these onto their own error type, so the variants stay coarse.
#[derive(pretty_error_debug::Debug, Error)]
pub enum NexusutilsError {
    /// A workspace path was malformed or climbed above the workspace root.
    #[error("invalid workspace path: {0}")]
    PathValidation(String),

    /// Reading or writing a console log, or setting up a terminal, failed.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Opening a pseudo terminal or signalling a process group was refused by the kernel.
    #[error("system call failed: {0}")]
    Errno(#[from] nix::errno::Errno),
}
