use std::{
    ffi::CString,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;

use crate::{
    limiter::{confine_before_exec, Rlimit},
    models::{Instance, LogEvent, LogSource, Severity},
    session::SessionMultiplexer,
    NexusError, NexusResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Port the instance should listen on.
pub const ENV_PORT: &str = "PORT";

/// Id of the instance.
pub const ENV_INSTANCE_ID: &str = "NEXUS_INSTANCE_ID";

/// Absolute host path of the entrypoint.
pub const ENV_ENTRYPOINT: &str = "NEXUS_ENTRYPOINT";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What to launch for an instance.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Shell that interprets the startup command.
    pub shell: String,

    /// The startup command.
    pub command: String,

    /// Working directory, the instance's workspace.
    pub cwd: PathBuf,

    /// Extra environment.
    pub env: Vec<(String, String)>,

    /// Limits applied before exec.
    pub rlimits: Vec<Rlimit>,

    /// `cgroup.procs` of the instance's cgroup, joined before exec so that every child is
    /// born inside it.
    pub cgroup_procs: Option<CString>,
}

/// A launched sandbox. Its process group id equals its pid.
#[derive(Debug)]
pub struct Sandbox {
    /// Pid of the shell running the startup command.
    pub pid: u32,

    /// The child, with stdout and stderr piped.
    pub child: Child,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The environment every process of an instance gets.
pub fn sandbox_env(instance: &Instance, workspace_dir: &Path) -> Vec<(String, String)> {
    let entrypoint = workspace_dir.join(instance.entrypoint.trim_start_matches('/'));

    vec![
        (ENV_PORT.to_string(), instance.network.port.to_string()),
        (ENV_INSTANCE_ID.to_string(), instance.id.clone()),
        (
            ENV_ENTRYPOINT.to_string(),
            entrypoint.to_string_lossy().into_owned(),
        ),
    ]
}

/// Launches `shell -c command` in a new process group.
pub fn spawn_sandbox(spec: SandboxSpec) -> NexusResult<Sandbox> {
    let mut command = Command::new(&spec.shell);
    command
        .arg("-c")
        .arg(&spec.command)
        .current_dir(&spec.cwd)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let rlimits = spec.rlimits;
    let cgroup_procs = spec.cgroup_procs;
    unsafe {
        command.pre_exec(move || confine_before_exec(&rlimits, cgroup_procs.as_deref()));
    }

    let child = command.spawn().map_err(|e| {
        NexusError::SandboxFailure(format!("failed to launch {}: {}", spec.shell, e))
    })?;

    let pid = child.id().ok_or_else(|| {
        NexusError::SandboxFailure("sandbox exited before its pid was known".to_string())
    })?;

    tracing::debug!(pid, cwd = %spec.cwd.display(), "spawned sandbox");
    Ok(Sandbox { pid, child })
}

/// Turns one output pipe of a sandbox into console events.
///
/// `first_output` is cancelled as soon as anything is read.
pub async fn pump_output<R>(
    reader: R,
    source: LogSource,
    mux: SessionMultiplexer,
    instance_id: String,
    first_output: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let severity = match source {
        LogSource::Stderr => Severity::Error,
        _ => Severity::Info,
    };

    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                first_output.cancel();
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                mux.publish(&instance_id, LogEvent::new(severity, source, text));
            }
            Err(e) => {
                tracing::debug!(%instance_id, ?source, error = %e, "sandbox output closed");
                break;
            }
        }
    }
}

/// Describes how a process ended.
pub fn describe_exit(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("killed by signal {}", signal),
        _ => "unknown exit status".to_string(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        limiter::RlimitResource,
        models::{InstanceStatus, NetworkBinding, ServerResource},
    };

    fn instance() -> Instance {
        Instance {
            id: "srv-test".to_string(),
            owner: "alice".to_string(),
            name: "bot".to_string(),
            status: InstanceStatus::Stopped,
            limits: ServerResource::default(),
            usage: ServerResource::default(),
            startup_command: "true".to_string(),
            entrypoint: "/src/index.js".to_string(),
            network: NetworkBinding {
                port: 20007,
                url: "http://127.0.0.1:20007".to_string(),
            },
            workspace_ref: "srv-test".to_string(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    #[test]
    fn test_sandbox_env_points_at_the_workspace() {
        let env = sandbox_env(&instance(), Path::new("/data/workspaces/srv-test"));

        assert!(env.contains(&(ENV_PORT.to_string(), "20007".to_string())));
        assert!(env.contains(&(ENV_INSTANCE_ID.to_string(), "srv-test".to_string())));
        assert!(env.contains(&(
            ENV_ENTRYPOINT.to_string(),
            "/data/workspaces/srv-test/src/index.js".to_string()
        )));
    }

    #[tokio::test]
    async fn test_spawned_sandbox_runs_in_workspace_with_env() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let spec = SandboxSpec {
            shell: "/bin/sh".to_string(),
            command: "pwd > where.txt; echo \"$PORT\" > port.txt; ulimit -c > core.txt".to_string(),
            cwd: dir.path().to_path_buf(),
            env: sandbox_env(&instance(), dir.path()),
            rlimits: vec![Rlimit::fixed(RlimitResource::RLIMIT_CORE, 0)],
            cgroup_procs: None,
        };

        let Sandbox { pid, mut child } = spawn_sandbox(spec)?;
        assert!(pid > 0);
        assert!(child.wait().await?.success());

        let port = tokio::fs::read_to_string(dir.path().join("port.txt")).await?;
        assert_eq!(port.trim(), "20007");
        let core = tokio::fs::read_to_string(dir.path().join("core.txt")).await?;
        assert_eq!(core.trim(), "0");
        assert!(dir.path().join("where.txt").exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_sandbox_joins_cgroup_before_exec() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let procs = dir.path().join("cgroup.procs");
        std::fs::write(&procs, "")?;

        let spec = SandboxSpec {
            shell: "/bin/sh".to_string(),
            command: "cat cgroup.procs > seen.txt".to_string(),
            cwd: dir.path().to_path_buf(),
            env: Vec::new(),
            rlimits: Vec::new(),
            cgroup_procs: Some(CString::new(procs.as_os_str().as_encoded_bytes())?),
        };

        let Sandbox { mut child, .. } = spawn_sandbox(spec)?;
        assert!(child.wait().await?.success());

        // The join happened in the child, before the startup command could run.
        let seen = tokio::fs::read_to_string(dir.path().join("seen.txt")).await?;
        assert_eq!(seen, "0");

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_shell_is_a_sandbox_failure() {
        let spec = SandboxSpec {
            shell: "/nonexistent/shell".to_string(),
            command: "true".to_string(),
            cwd: std::env::temp_dir(),
            env: Vec::new(),
            rlimits: Vec::new(),
            cgroup_procs: None,
        };

        assert!(matches!(
            spawn_sandbox(spec),
            Err(NexusError::SandboxFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_describe_exit() -> anyhow::Result<()> {
        let status = Command::new("/bin/sh").arg("-c").arg("exit 3").status().await?;
        assert_eq!(describe_exit(&status), "exit code 3");

        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg("kill -9 $$")
            .status()
            .await?;
        assert_eq!(describe_exit(&status), "killed by signal 9");

        Ok(())
    }
}
