//! Host configuration for the nexusnode daemon.

mod defaults;
mod host;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use host::*;
