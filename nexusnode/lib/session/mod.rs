//! Log tails and interactive shells attached to running instances.
//!
//! Each instance has one producer per channel. Sessions are fan-out subscribers with their own
//! bounded buffers, so a slow viewer never holds back the instance or other viewers.

mod hub;
mod multiplexer;
mod shell;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use hub::*;
pub use multiplexer::*;
pub use shell::*;
