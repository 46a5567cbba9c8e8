//! Best-effort cgroup v2 placement of sandboxes.
//!
//! If cgroup v2 is not mounted, or the daemon may not write to it, sandboxes run with rlimits
//! only and a warning is logged.

use std::{
    ffi::{CStr, CString},
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{fs, io::AsyncWriteExt};

use super::{apply_rlimits, Rlimit, SandboxConstraint};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often removal of a cgroup is retried while its killed members are exiting.
const REMOVE_ATTEMPTS: u32 = 20;

const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(50);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A cgroup created for one instance. The sandbox and the instance's shell both live in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupHandle {
    path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CgroupHandle {
    /// The cgroup directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `cgroup.procs` path as a C string, for joining from a child before exec.
    pub fn procs_cstring(&self) -> Option<CString> {
        CString::new(self.path.join("cgroup.procs").as_os_str().as_bytes()).ok()
    }

    /// Moves `pid` into the cgroup. A pid already in it is left where it is.
    pub async fn add(&self, pid: u32) -> io::Result<()> {
        write_cgroup_file(&self.path, "cgroup.procs", &pid.to_string()).await
    }

    /// Kills every process still in the cgroup and removes it.
    pub async fn remove(self) {
        if let Err(e) = kill_cgroup(&self.path).await {
            tracing::debug!(path = %self.path.display(), error = %e, "cgroup.kill not available");
        }

        for attempt in 1..=REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path).await {
                Ok(()) => return,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                Err(e) if attempt == REMOVE_ATTEMPTS => {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to remove cgroup");
                }
                Err(_) => tokio::time::sleep(REMOVE_RETRY_DELAY).await,
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks for a unified (v2) hierarchy above `cgroup_root`.
pub async fn is_cgroup_v2_available(cgroup_root: &Path) -> bool {
    let mount = cgroup_root.parent().unwrap_or(cgroup_root);
    fs::metadata(mount.join("cgroup.controllers")).await.is_ok()
}

/// Creates an empty cgroup for `instance_id` and writes its CPU and memory limits.
///
/// Processes join it before they exec, so nothing they fork can escape. Returns `None` when
/// the cgroup cannot be created.
pub async fn create_cgroup(
    cgroup_root: &Path,
    instance_id: &str,
    constraint: &SandboxConstraint,
) -> Option<CgroupHandle> {
    if !is_cgroup_v2_available(cgroup_root).await {
        tracing::warn!(instance_id, "cgroup v2 not available, running with rlimits only");
        return None;
    }

    let path = cgroup_root.join(instance_id);
    if let Err(e) = fs::create_dir_all(&path).await {
        tracing::warn!(
            instance_id,
            error = %e,
            "failed to create cgroup, running with rlimits only"
        );
        return None;
    }

    if let Some(memory_max) = constraint.get_memory_max_bytes() {
        if let Err(e) = write_cgroup_file(&path, "memory.max", &memory_max.to_string()).await {
            tracing::warn!(instance_id, error = %e, memory_max, "failed to set cgroup memory.max");
        }
    }

    if let Some(cpu) = constraint.get_cpu() {
        if let Err(e) = write_cgroup_file(&path, "cpu.max", &cpu.to_string()).await {
            tracing::warn!(instance_id, error = %e, cpu_max = %cpu, "failed to set cgroup cpu.max");
        }
    }

    tracing::debug!(instance_id, path = %path.display(), "created cgroup");
    Some(CgroupHandle { path })
}

/// Moves the calling process into the cgroup whose `cgroup.procs` is `procs`.
///
/// Only async-signal-safe calls are made, so this may run between fork and exec.
pub fn join_cgroup(procs: &CStr) -> io::Result<()> {
    unsafe {
        let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let written = libc::write(fd, b"0".as_ptr().cast(), 1);
        let error = io::Error::last_os_error();
        libc::close(fd);

        if written != 1 {
            return Err(error);
        }
    }

    Ok(())
}

/// Confines the calling process before it execs: joins the cgroup, if any, and applies the
/// rlimits.
///
/// A failed join is not fatal here. The parent moves the pid again after spawning and logs
/// the failure there.
pub fn confine_before_exec(rlimits: &[Rlimit], cgroup_procs: Option<&CStr>) -> io::Result<()> {
    if let Some(procs) = cgroup_procs {
        let _ = join_cgroup(procs);
    }
    apply_rlimits(rlimits)
}

async fn write_cgroup_file(dir: &Path, name: &str, value: &str) -> io::Result<()> {
    fs::write(dir.join(name), value).await
}

/// Writes `cgroup.kill`, which only exists on kernels that support it.
async fn kill_cgroup(dir: &Path) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(dir.join("cgroup.kill"))
        .await?;
    file.write_all(b"1").await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{limiter::build_constraint, models::ServerResource};

    #[tokio::test]
    async fn test_create_without_cgroup_v2_is_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("nexusnode");
        let constraint = build_constraint(&ServerResource::new(1.0, 128, 0.0));

        assert!(!is_cgroup_v2_available(&root).await);
        assert_eq!(create_cgroup(&root, "srv-x", &constraint).await, None);
        assert!(!root.join("srv-x").exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_create_writes_limit_files_and_add_writes_pid() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory")?;
        let root = dir.path().join("nexusnode");
        let constraint = build_constraint(&ServerResource::new(0.5, 128, 0.0));

        let handle = create_cgroup(&root, "srv-x", &constraint)
            .await
            .expect("cgroup handle");

        let read = |name: &str| std::fs::read_to_string(handle.path().join(name)).unwrap();
        assert_eq!(read("memory.max"), (128 * 1024 * 1024).to_string());
        assert_eq!(read("cpu.max"), "50000 100000");
        assert!(!handle.path().join("cgroup.procs").exists());

        handle.add(4242).await?;
        assert_eq!(read("cgroup.procs"), "4242");

        Ok(())
    }

    #[test]
    fn test_join_cgroup_writes_own_pid_marker() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let procs = dir.path().join("cgroup.procs");
        std::fs::write(&procs, "")?;

        let procs_c = CString::new(procs.as_os_str().as_bytes())?;
        join_cgroup(&procs_c)?;
        assert_eq!(std::fs::read_to_string(&procs)?, "0");

        let missing = CString::new(dir.path().join("missing/cgroup.procs").as_os_str().as_bytes())?;
        assert!(join_cgroup(&missing).is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_remove_deletes_empty_cgroup() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("srv-x");
        std::fs::create_dir(&path)?;

        CgroupHandle { path: path.clone() }.remove().await;
        assert!(!path.exists());

        Ok(())
    }
}
