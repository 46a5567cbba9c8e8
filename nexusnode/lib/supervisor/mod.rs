//! The instance lifecycle: launching, watching and tearing down sandboxes.

mod sandbox;
mod supervisor;
mod watch;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use sandbox::*;
pub use supervisor::*;
pub use watch::*;
