//! Command line interface of the `nexusnode` binary.

mod args;
mod logging;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::*;
pub use logging::*;
