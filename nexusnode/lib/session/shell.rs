use std::{
    ffi::CString,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use nexusutils::spawn_with_pty;
use tokio::{io::AsyncWriteExt, process::Command, sync::mpsc};

use super::Hub;
use crate::{
    limiter::{confine_before_exec, kill_session, Rlimit},
    NexusError, NexusResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Written to viewers when the shell process goes away.
pub const SHELL_TERMINATED_NOTICE: &str = "\r\n[SYSTEM] Shell session terminated.\r\n";

const READ_CHUNK_SIZE: usize = 4096;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One shell on a pseudo terminal, shared by every viewer of an instance's shell.
pub struct ShellProcess {
    pid: u32,
    hub: Arc<Hub<Bytes>>,
    input: mpsc::UnboundedSender<Bytes>,
    alive: Arc<AtomicBool>,
}

/// Everything needed to launch an instance's shell.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    /// The instance the shell belongs to.
    pub instance_id: String,

    /// The shell binary.
    pub shell: String,

    /// Working directory, the instance's workspace.
    pub cwd: PathBuf,

    /// Extra environment.
    pub env: Vec<(String, String)>,

    /// Limits applied before exec.
    pub rlimits: Vec<Rlimit>,

    /// `cgroup.procs` of the instance's cgroup, joined before exec.
    pub cgroup_procs: Option<CString>,

    /// Output chunks a viewer may fall behind by.
    pub buffer: usize,
}

/// The write side of a shell, handed to every attached session.
///
/// Writes from all sessions go through one queue, so they reach the terminal in arrival order.
#[derive(Clone)]
pub struct ShellInput {
    tx: mpsc::UnboundedSender<Bytes>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ShellProcess {
    /// Starts the shell and the tasks that pump its terminal.
    pub fn spawn(spec: ShellSpec) -> NexusResult<Arc<Self>> {
        let mut command = Command::new(&spec.shell);
        command
            .current_dir(&spec.cwd)
            .env("TERM", "xterm")
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let rlimits = spec.rlimits.clone();
        let cgroup_procs = spec.cgroup_procs.clone();
        unsafe {
            command.pre_exec(move || confine_before_exec(&rlimits, cgroup_procs.as_deref()));
        }

        let (mut child, master) = spawn_with_pty(command)
            .map_err(|e| NexusError::SandboxFailure(format!("failed to start shell: {}", e)))?;
        let pid = child
            .id()
            .ok_or_else(|| NexusError::SandboxFailure("shell exited immediately".to_string()))?;

        let hub = Arc::new(Hub::new(spec.buffer));
        let alive = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let mut writer = master.writer;
        let instance_id = spec.instance_id.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    tracing::debug!(instance_id, error = %e, "shell input closed");
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        let reader = master.reader;
        let reader_hub = Arc::clone(&hub);
        let reader_alive = Arc::clone(&alive);
        let instance_id = spec.instance_id.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read_chunk(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => reader_hub.publish(Bytes::copy_from_slice(&buf[..n])),
                    Err(e) => {
                        tracing::debug!(instance_id, error = %e, "shell output closed");
                        break;
                    }
                }
            }

            reader_alive.store(false, Ordering::SeqCst);
            let status = child.wait().await;
            tracing::info!(instance_id, pid, ?status, "shell exited");

            reader_hub.publish(Bytes::from_static(SHELL_TERMINATED_NOTICE.as_bytes()));
            reader_hub.close();
        });

        tracing::info!(instance_id = %spec.instance_id, pid, "started shell");
        Ok(Arc::new(Self {
            pid,
            hub,
            input: tx,
            alive,
        }))
    }

    /// Pid of the shell, which leads its own session.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The output fan-out.
    pub fn hub(&self) -> &Arc<Hub<Bytes>> {
        &self.hub
    }

    /// A handle for writing to the terminal.
    pub fn input(&self) -> ShellInput {
        ShellInput {
            tx: self.input.clone(),
        }
    }

    /// Whether the shell is still running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Kills the shell and everything started from it, background jobs included.
    pub async fn kill(&self) {
        kill_session(self.pid).await;
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl ShellInput {
    /// Writes raw bytes to the terminal.
    pub fn send(&self, data: impl Into<Bytes>) -> NexusResult<()> {
        self.tx
            .send(data.into())
            .map_err(|_| NexusError::SandboxFailure("shell is no longer running".to_string()))
    }

    /// Writes a line followed by a newline.
    pub fn send_line(&self, line: &str) -> NexusResult<()> {
        self.send(format!("{}\n", line))
    }
}
