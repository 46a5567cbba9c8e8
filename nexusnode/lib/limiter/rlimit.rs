use std::{fmt, io};

use getset::Getters;
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The Linux resource limits a sandbox can be given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum RlimitResource {
    /// Maximum size of files created by the process
    RLIMIT_FSIZE,

    /// Maximum size of core dumps
    RLIMIT_CORE,

    /// Maximum number of open file descriptors
    RLIMIT_NOFILE,

    /// Maximum number of processes
    RLIMIT_NPROC,
}

/// A resource limit applied to a sandbox before it executes.
///
/// The soft limit is what the kernel enforces. The hard limit is the ceiling the process may
/// raise its soft limit to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Getters, Serialize, Deserialize)]
#[getset(get = "pub with_prefix")]
pub struct Rlimit {
    /// The resource to limit.
    resource: RlimitResource,

    /// The soft limit of the resource.
    soft: u64,

    /// The hard limit of the resource.
    hard: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RlimitResource {
    fn as_raw(&self) -> libc::c_int {
        let raw = match self {
            RlimitResource::RLIMIT_FSIZE => libc::RLIMIT_FSIZE,
            RlimitResource::RLIMIT_CORE => libc::RLIMIT_CORE,
            RlimitResource::RLIMIT_NOFILE => libc::RLIMIT_NOFILE,
            RlimitResource::RLIMIT_NPROC => libc::RLIMIT_NPROC,
        };
        raw as libc::c_int
    }
}

impl Rlimit {
    /// Creates a limit with separate soft and hard values.
    pub fn new(resource: RlimitResource, soft: u64, hard: u64) -> Self {
        Self {
            resource,
            soft,
            hard,
        }
    }

    /// Creates a limit whose soft and hard values are the same.
    pub fn fixed(resource: RlimitResource, value: u64) -> Self {
        Self::new(resource, value, value)
    }

    /// Applies the limit to the calling process.
    ///
    /// Only performs a single system call, so it may run between fork and exec.
    pub fn apply(&self) -> io::Result<()> {
        let limit = libc::rlimit {
            rlim_cur: self.soft as libc::rlim_t,
            rlim_max: self.hard as libc::rlim_t,
        };

        if unsafe { libc::setrlimit(self.resource.as_raw() as _, &limit) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Applies every limit in order, stopping at the first failure.
pub fn apply_rlimits(rlimits: &[Rlimit]) -> io::Result<()> {
    for rlimit in rlimits {
        rlimit.apply()?;
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for RlimitResource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RlimitResource::RLIMIT_FSIZE => "RLIMIT_FSIZE",
            RlimitResource::RLIMIT_CORE => "RLIMIT_CORE",
            RlimitResource::RLIMIT_NOFILE => "RLIMIT_NOFILE",
            RlimitResource::RLIMIT_NPROC => "RLIMIT_NPROC",
        };
        write!(f, "{}", name)
    }
}

impl fmt::Display for Rlimit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}:{}", self.resource, self.soft, self.hard)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
