//! Process and terminal primitives shared by the node runtime.

mod pty;
mod signal;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use pty::*;
pub use signal::*;
