use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use nexusutils::signal_process;
use nix::sys::signal::Signal;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

use crate::{
    models::{ServerResource, UsageSample},
    workspace::disk_usage_blocking,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const MIB: u64 = 1024 * 1024;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Rounds of kill in [`kill_session`], which catch processes forked while a round runs.
const KILL_ROUNDS: usize = 5;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Identifies what to measure for a running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    /// The instance id.
    pub instance_id: String,

    /// Pid of the sandbox process. Its descendants are measured too, as are the trees of any
    /// process adopted for the instance.
    pub pid: u32,

    /// The workspace directory whose size counts as disk usage.
    pub workspace_dir: PathBuf,
}

/// Takes bounded-time usage readings of sandboxes.
///
/// The process table is kept between readings, which is what makes CPU usage meaningful.
#[derive(Clone)]
pub struct UsageSampler {
    system: Arc<Mutex<System>>,
    last_known: Arc<Mutex<HashMap<String, UsageSample>>>,
    adopted: Arc<Mutex<HashMap<String, HashSet<u32>>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UsageSampler {
    /// Creates a sampler with an empty process table.
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            last_known: Arc::new(Mutex::new(HashMap::new())),
            adopted: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Counts `pid` and its descendants towards the usage of `instance_id` from now on.
    pub fn adopt(&self, instance_id: &str, pid: u32) {
        if let Ok(mut adopted) = self.adopted.lock() {
            adopted
                .entry(instance_id.to_string())
                .or_default()
                .insert(pid);
        }
    }

    /// Measures CPU, memory and disk usage of a sandbox.
    ///
    /// Never takes longer than `timeout`. When it would, the previous reading is returned with
    /// `stale` set, or a zero reading if there is none.
    pub async fn sample(&self, handle: &InstanceHandle, timeout: Duration) -> UsageSample {
        let system = Arc::clone(&self.system);
        let target = handle.clone();
        let extra_roots = self.adopted_roots(&handle.instance_id);
        let measure =
            tokio::task::spawn_blocking(move || measure(&system, &target, &extra_roots));

        match tokio::time::timeout(timeout, measure).await {
            Ok(Ok(resource)) => {
                let sample = UsageSample {
                    resource,
                    sampled_at: Utc::now(),
                    stale: false,
                };
                if let Ok(mut last_known) = self.last_known.lock() {
                    last_known.insert(handle.instance_id.clone(), sample);
                }
                sample
            }
            Ok(Err(e)) => {
                tracing::warn!(instance_id = %handle.instance_id, error = %e, "usage sampling failed");
                self.stale(&handle.instance_id)
            }
            Err(_) => {
                tracing::debug!(instance_id = %handle.instance_id, "usage sampling timed out");
                self.stale(&handle.instance_id)
            }
        }
    }

    /// Drops the last known reading and the adopted processes of an instance.
    pub fn forget(&self, instance_id: &str) {
        if let Ok(mut last_known) = self.last_known.lock() {
            last_known.remove(instance_id);
        }
        if let Ok(mut adopted) = self.adopted.lock() {
            adopted.remove(instance_id);
        }
    }

    fn adopted_roots(&self, instance_id: &str) -> Vec<u32> {
        self.adopted
            .lock()
            .ok()
            .and_then(|adopted| adopted.get(instance_id).cloned())
            .map(|pids| pids.into_iter().collect())
            .unwrap_or_default()
    }

    fn stale(&self, instance_id: &str) -> UsageSample {
        let last = self
            .last_known
            .lock()
            .ok()
            .and_then(|last_known| last_known.get(instance_id).copied());

        match last {
            Some(sample) => UsageSample {
                stale: true,
                ..sample
            },
            None => UsageSample {
                resource: ServerResource::default(),
                sampled_at: Utc::now(),
                stale: true,
            },
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for UsageSampler {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// SIGKILLs a session leader, every process of its session and every descendant of it.
///
/// Job control gives each background job of an interactive shell its own process group, so
/// signalling the leader's group is not enough.
pub async fn kill_session(leader: u32) {
    let killed = tokio::task::spawn_blocking(move || {
        let mut system = System::new();
        let mut killed = 0;

        for _ in 0..KILL_ROUNDS {
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing(),
            );

            let targets = session_members(&system, Pid::from_u32(leader));
            if targets.is_empty() {
                break;
            }

            for pid in targets {
                if let Ok(true) = signal_process(pid.as_u32(), Signal::SIGKILL) {
                    killed += 1;
                }
            }
        }

        killed
    })
    .await;

    match killed {
        Ok(killed) => tracing::debug!(leader, killed, "killed session"),
        Err(e) => tracing::error!(leader, error = %e, "failed to kill session"),
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn measure(system: &Mutex<System>, handle: &InstanceHandle, extra_roots: &[u32]) -> ServerResource {
    let (cpu_percent, memory_bytes) = {
        let mut system = match system.lock() {
            Ok(system) => system,
            Err(poisoned) => poisoned.into_inner(),
        };

        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );

        let mut members = process_tree(&system, Pid::from_u32(handle.pid));
        for root in extra_roots {
            members.extend(process_tree(&system, Pid::from_u32(*root)));
        }

        members
            .iter()
            .filter_map(|pid| system.process(*pid))
            .fold((0.0f64, 0u64), |(cpu, mem), process| {
                (cpu + process.cpu_usage() as f64, mem + process.memory())
            })
    };

    let disk_bytes = disk_usage_blocking(&handle.workspace_dir);

    ServerResource {
        cpu_cores: cpu_percent / 100.0,
        ram_mb: memory_bytes / MIB,
        disk_gb: disk_bytes as f64 / GIB,
    }
}

/// The pid and every live descendant of it.
fn process_tree(system: &System, root: Pid) -> HashSet<Pid> {
    let mut members = HashSet::new();
    if system.process(root).is_none() {
        return members;
    }
    members.insert(root);

    let mut grew = true;
    while grew {
        grew = false;
        for (pid, process) in system.processes() {
            if members.contains(pid) {
                continue;
            }
            if process.parent().is_some_and(|parent| members.contains(&parent)) {
                members.insert(*pid);
                grew = true;
            }
        }
    }

    members
}

/// Live processes in the session led by `leader`, plus the leader's descendants.
///
/// Members that were reparented after their parent died are found through the session id.
fn session_members(system: &System, leader: Pid) -> HashSet<Pid> {
    let mut members = process_tree(system, leader);
    members.extend(
        system
            .processes()
            .iter()
            .filter(|(_, process)| process.session_id() == Some(leader))
            .map(|(pid, _)| *pid),
    );

    members.retain(|pid| {
        system
            .process(*pid)
            .is_some_and(|process| process.status() != ProcessStatus::Zombie)
    });
    members
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_sample_measures_process_tree_and_workspace() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("blob"), vec![1u8; 8192])?;

        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30 & wait")
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().expect("child pid");

        let sampler = UsageSampler::new();
        let handle = InstanceHandle {
            instance_id: "srv-sample".to_string(),
            pid,
            workspace_dir: dir.path().to_path_buf(),
        };

        let sample = sampler.sample(&handle, Duration::from_secs(5)).await;
        assert!(!sample.stale);
        assert!(sample.resource.disk_gb > 0.0);

        child.kill().await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_adopted_process_counts_towards_usage() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sandbox = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30")
            .kill_on_drop(true)
            .spawn()?;
        let mut hog = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("(head -c 67108864 /dev/zero; sleep 30) | tail > /dev/null")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        let hog_pid = hog.id().expect("hog pid");

        let sampler = UsageSampler::new();
        let handle = InstanceHandle {
            instance_id: "srv-adopt".to_string(),
            pid: sandbox.id().expect("sandbox pid"),
            workspace_dir: dir.path().to_path_buf(),
        };
        sampler.adopt("srv-adopt", hog_pid);

        let mut peak = 0;
        for _ in 0..50 {
            peak = peak.max(sampler.sample(&handle, Duration::from_secs(5)).await.resource.ram_mb);
            if peak >= 32 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(peak >= 32, "peak usage {} MB", peak);

        sampler.forget("srv-adopt");
        assert!(sampler.adopted_roots("srv-adopt").is_empty());

        sandbox.kill().await?;
        nexusutils::signal_group(hog_pid, Signal::SIGKILL)?;
        hog.wait().await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_kill_session_reaches_jobs_in_other_groups() -> anyhow::Result<()> {
        use std::os::unix::process::CommandExt;

        let mut leader = std::process::Command::new("/bin/sh");
        leader
            .arg("-c")
            .arg("set -m; sleep 4243 & echo $!; wait")
            .stdout(std::process::Stdio::piped());
        unsafe {
            leader.pre_exec(|| nix::unistd::setsid().map(|_| ()).map_err(std::io::Error::from));
        }
        let mut leader = leader.spawn()?;

        let mut line = String::new();
        std::io::BufRead::read_line(
            &mut std::io::BufReader::new(leader.stdout.take().expect("stdout")),
            &mut line,
        )?;
        let job: u32 = line.trim().parse()?;
        assert!(nexusutils::is_process_running(job));

        kill_session(leader.id()).await;
        leader.wait()?;

        let mut system = System::new();
        let mut gone = false;
        for _ in 0..50 {
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing(),
            );
            gone = system
                .process(Pid::from_u32(job))
                .map_or(true, |process| process.status() == ProcessStatus::Zombie);
            if gone {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "background job {} survived", job);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_timeout_returns_last_known_as_stale() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sampler = UsageSampler::new();
        let handle = InstanceHandle {
            instance_id: "srv-stale".to_string(),
            pid: std::process::id(),
            workspace_dir: dir.path().to_path_buf(),
        };

        let zero = sampler.sample(&handle, Duration::ZERO).await;
        assert!(zero.stale);
        assert_eq!(zero.resource, ServerResource::default());

        let fresh = sampler.sample(&handle, Duration::from_secs(5)).await;
        assert!(!fresh.stale);

        let stale = sampler.sample(&handle, Duration::ZERO).await;
        assert!(stale.stale);
        assert_eq!(stale.resource, fresh.resource);
        assert_eq!(stale.sampled_at, fresh.sampled_at);

        Ok(())
    }
}
