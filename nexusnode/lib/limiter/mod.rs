//! Translation of declared quotas into OS-level constraints, and usage sampling.
//!
//! The limiter only observes and reports. Acting on a breach is the supervisor's job.

mod cgroup;
mod constraint;
mod limiter;
mod rlimit;
mod sample;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cgroup::*;
pub use constraint::*;
pub use limiter::*;
pub use rlimit::*;
pub use sample::*;
