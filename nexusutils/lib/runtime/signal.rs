use nix::{
    errno::Errno,
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};

use crate::NexusutilsResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sends a signal to every process in the process group led by `pgid`.
///
/// Returns `false` if the group no longer exists.
pub fn signal_group(pgid: u32, signal: Signal) -> NexusutilsResult<bool> {
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Sends a signal to a single process.
///
/// Returns `false` if the process no longer exists.
pub fn signal_process(pid: u32, signal: Signal) -> NexusutilsResult<bool> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Checks if a process with the given PID is still alive.
pub fn is_process_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
