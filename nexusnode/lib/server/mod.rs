//! The HTTP and WebSocket management API.
//!
//! Callers are identified by headers set by an authenticating proxy in front of the node. The
//! server trusts them as given.

mod data;
mod handlers;
mod routes;
mod server;
mod state;
mod ws;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use data::*;
pub use handlers::*;
pub use routes::*;
pub use server::*;
pub use state::*;
pub use ws::*;
