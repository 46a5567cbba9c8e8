use std::fmt;

use getset::Getters;

use super::{Rlimit, RlimitResource};
use crate::models::ServerResource;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The cgroup CPU accounting period in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

/// Open file limit given to every sandbox.
pub const SANDBOX_NOFILE_LIMIT: u64 = 4096;

const MIB: u64 = 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The enforceable form of an instance's declared quota.
#[derive(Debug, Clone, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SandboxConstraint {
    /// CPU bandwidth, if limited.
    cpu: Option<CpuQuota>,

    /// Memory ceiling in bytes, if limited.
    memory_max_bytes: Option<u64>,

    /// Disk quota in bytes, if limited.
    disk_quota_bytes: Option<u64>,

    /// Limits applied in the sandbox before exec.
    rlimits: Vec<Rlimit>,
}

/// A cgroup v2 `cpu.max` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuQuota {
    /// Microseconds of CPU time allowed per period.
    pub quota_us: u64,

    /// Length of the period in microseconds.
    pub period_us: u64,
}

/// A quota the sandbox has exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    /// Resident memory is above the ceiling.
    Memory {
        /// Sampled usage in MiB.
        used_mb: u64,

        /// Ceiling in MiB.
        limit_mb: u64,
    },

    /// The workspace is larger than the disk quota.
    Disk {
        /// Sampled workspace size in MiB.
        used_mb: u64,

        /// Quota in MiB.
        limit_mb: u64,
    },
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Maps a declared quota onto cgroup values and rlimits. A zero amount is left unlimited.
pub fn build_constraint(limits: &ServerResource) -> SandboxConstraint {
    let cpu = (limits.cpu_cores > 0.0).then(|| CpuQuota {
        quota_us: ((limits.cpu_cores * CPU_PERIOD_US as f64).round() as u64).max(1000),
        period_us: CPU_PERIOD_US,
    });

    let memory_max_bytes = limits.ram_bytes();
    let disk_quota_bytes = limits.disk_bytes();

    let mut rlimits = vec![
        Rlimit::fixed(RlimitResource::RLIMIT_CORE, 0),
        Rlimit::fixed(RlimitResource::RLIMIT_NOFILE, SANDBOX_NOFILE_LIMIT),
    ];
    if let Some(bytes) = disk_quota_bytes {
        rlimits.push(Rlimit::fixed(RlimitResource::RLIMIT_FSIZE, bytes));
    }

    SandboxConstraint {
        cpu,
        memory_max_bytes,
        disk_quota_bytes,
        rlimits,
    }
}

/// Reports a memory or disk breach. CPU is throttled by the kernel and never reported.
pub fn check_breach(usage: &ServerResource, constraint: &SandboxConstraint) -> Option<Breach> {
    if let Some(limit_bytes) = constraint.memory_max_bytes {
        let limit_mb = limit_bytes / MIB;
        if usage.ram_mb > limit_mb {
            return Some(Breach::Memory {
                used_mb: usage.ram_mb,
                limit_mb,
            });
        }
    }

    if let Some(limit_bytes) = constraint.disk_quota_bytes {
        let used_bytes = usage.disk_bytes().unwrap_or(0);
        if used_bytes > limit_bytes {
            return Some(Breach::Disk {
                used_mb: used_bytes / MIB,
                limit_mb: limit_bytes / MIB,
            });
        }
    }

    None
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for CpuQuota {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.quota_us, self.period_us)
    }
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Breach::Memory { used_mb, limit_mb } => write!(
                f,
                "memory limit exceeded: using {} MB of {} MB",
                used_mb, limit_mb
            ),
            Breach::Disk { used_mb, limit_mb } => write!(
                f,
                "disk quota exceeded: workspace holds {} MB of {} MB",
                used_mb, limit_mb
            ),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
