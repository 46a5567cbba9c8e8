//! `nexusnode` hosts bot instances in isolated, resource-limited sandboxes.
//!
//! # Overview
//!
//! A node keeps a catalog of instances, each with its own workspace directory, port and quota.
//! Owners start and stop their instances, edit workspace files and attach to live consoles and
//! shells over websockets. Admins can suspend instances to lock them out.
//!
//! # Architecture
//!
//! - **Registry**: the persisted instance catalog, port pool and per-instance operation locks
//! - **Workspace**: a confined file tree per instance
//! - **Limiter**: turns quotas into rlimits and cgroups and samples usage
//! - **Supervisor**: the lifecycle state machine and sandbox processes
//! - **Session**: console fan-out, log tails and shared interactive shells
//! - **Server**: the REST and websocket API
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use nexusnode::{
//!     config::HostConfig,
//!     host::NodeHost,
//!     registry::NewInstance,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HostConfig::load("/srv/nexusnode").await?;
//!     let host = NodeHost::open(config).await?;
//!
//!     let instance = host
//!         .get_registry()
//!         .create(
//!             "alice",
//!             NewInstance::builder()
//!                 .name("echo-bot")
//!                 .startup_command("node index.js")
//!                 .entrypoint("/index.js")
//!                 .build(),
//!         )
//!         .await?;
//!
//!     host.workspaces()
//!         .write(instance.get_id(), "/index.js", b"console.log('hello')")
//!         .await?;
//!     host.get_supervisor().start(instance.get_id()).await?;
//!
//!     host.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod host;
pub mod limiter;
pub mod models;
pub mod registry;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod workspace;

pub use error::*;
