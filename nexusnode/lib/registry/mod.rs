//! The catalog of hosted instances.
//!
//! The registry is the single source of truth for instance metadata. It keeps every record in
//! memory for fast reads and writes each change through to SQLite, so records and port
//! allocations survive a restart of the daemon.

mod db;
mod locks;
mod ports;
mod registry;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use db::*;
pub use locks::*;
pub use ports::*;
pub use registry::*;
