use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use bytes::Bytes;
use chrono::Utc;
use nexusutils::RotatingLog;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{FrameStream, Hub, ShellInput, ShellProcess, ShellSpec, Subscription};
use crate::{
    limiter::{CgroupHandle, ResourceLimiter},
    models::{Instance, InstanceStatus, LogEvent, SessionInfo, SessionMode},
    registry::Registry,
    supervisor::sandbox_env,
    NexusError, NexusResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Fans instance output out to attached log and shell sessions.
#[derive(Clone)]
pub struct SessionMultiplexer {
    inner: Arc<MultiplexerInner>,
}

struct MultiplexerInner {
    registry: Arc<Registry>,
    limiter: ResourceLimiter,
    consoles: Mutex<HashMap<String, Arc<Console>>>,
    shells: tokio::sync::Mutex<HashMap<String, Arc<ShellProcess>>>,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
}

/// The log channel of one running instance.
struct Console {
    hub: Hub<LogEvent>,
    log: RotatingLog,
}

struct SessionEntry {
    info: SessionInfo,
    cancel: CancellationToken,
}

/// Unregisters a session when its stream is dropped.
struct SessionGuard {
    mux: Weak<MultiplexerInner>,
    session_id: Uuid,
}

/// An attached log tail.
pub struct LogTail {
    /// The session, or `None` when the instance was not running and the stream is already over.
    pub info: Option<SessionInfo>,

    /// Backlog and live log events, ending with the end marker.
    pub events: FrameStream<LogEvent>,
}

/// An attached shell viewer.
pub struct ShellAttachment {
    /// The session.
    pub info: SessionInfo,

    /// Terminal output, ending with the end marker.
    pub output: FrameStream<Bytes>,

    /// Terminal input, shared with every other viewer.
    pub input: ShellInput,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SessionMultiplexer {
    /// Creates a multiplexer with no open consoles.
    ///
    /// Shells are put under the same limits as the sandbox through `limiter`.
    pub fn new(registry: Arc<Registry>, limiter: ResourceLimiter) -> Self {
        Self {
            inner: Arc::new(MultiplexerInner {
                registry,
                limiter,
                consoles: Mutex::new(HashMap::new()),
                shells: tokio::sync::Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Opens a fresh console for an instance that is starting. Any previous console is closed.
    pub(crate) async fn open_console(&self, instance_id: &str) -> NexusResult<()> {
        let config = self.inner.registry.config();
        let log = RotatingLog::with_max_size(
            config.console_log_path(instance_id),
            *config.get_console_log_max_size(),
        )
        .await?;

        let console = Arc::new(Console {
            hub: Hub::new(*config.get_session_buffer()),
            log,
        });

        if let Some(previous) = self
            .inner
            .lock_consoles()
            .insert(instance_id.to_string(), console)
        {
            previous.hub.close();
        }

        Ok(())
    }

    /// Appends an event to an instance's console. Dropped if the console is not open.
    pub fn publish(&self, instance_id: &str, event: LogEvent) {
        let console = self.inner.lock_consoles().get(instance_id).cloned();
        if let Some(console) = console {
            console.log.append(format_log_line(&event).as_bytes());
            console.hub.publish(event);
        }
    }

    /// Closes every session of a stopping instance.
    ///
    /// Log tails receive the end marker after the events already published. The shell is
    /// killed together with its background jobs and its viewers are ended right away.
    pub(crate) async fn close_instance(&self, instance_id: &str) {
        let console = self.inner.lock_consoles().remove(instance_id);
        if let Some(console) = console {
            let _ = console.log.flush().await;
            console.hub.close();
        }

        let shell = self.inner.shells.lock().await.remove(instance_id);
        if let Some(shell) = shell {
            shell.kill().await;
            shell.hub().close();
        }
        self.inner.limiter.forget(instance_id);

        // Log tails drain on their own once the console hub closes.
        self.inner.lock_sessions().retain(|_, entry| {
            if entry.info.instance_id != instance_id {
                return true;
            }
            if entry.info.mode == SessionMode::InteractiveShell {
                entry.cancel.cancel();
            }
            false
        });
    }

    /// Attaches a log tail.
    ///
    /// If the instance is not running the stream holds only the end marker.
    pub fn attach_log_tail(&self, instance_id: &str) -> NexusResult<LogTail> {
        let instance = self.inner.registry.get(instance_id)?;
        let console = self.inner.lock_consoles().get(instance_id).cloned();

        let console = match console {
            Some(console) if instance.status.has_sandbox() => console,
            _ => {
                return Ok(LogTail {
                    info: None,
                    events: Subscription::ended().into_frames(CancellationToken::new(), ()),
                })
            }
        };

        let (info, cancel, guard) = self.register(instance_id, SessionMode::LogTail);
        let events = console.hub.subscribe().into_frames(cancel, guard);

        tracing::debug!(instance_id, session_id = %info.session_id, "attached log tail");
        Ok(LogTail {
            info: Some(info),
            events,
        })
    }

    /// Attaches a viewer to the instance's shell, starting the shell if there is none.
    ///
    /// A new shell joins the instance's cgroup and counts towards its usage.
    pub async fn attach_shell(&self, instance_id: &str) -> NexusResult<ShellAttachment> {
        ensure_running(&self.inner.registry, instance_id)?;

        let shell = {
            let mut shells = self.inner.shells.lock().await;

            // A stop that finished while waiting for the lock has already emptied `shells`.
            let instance = ensure_running(&self.inner.registry, instance_id)?;
            match shells.get(instance_id) {
                Some(shell) if shell.is_alive() => Arc::clone(shell),
                _ => {
                    let config = self.inner.registry.config();
                    let workspace_dir = self.inner.registry.workspaces().dir(instance_id);
                    let constraint = self.inner.limiter.build_constraint(&instance.limits);
                    let cgroup = self.inner.limiter.cgroup_for(instance_id);

                    let shell = ShellProcess::spawn(ShellSpec {
                        instance_id: instance_id.to_string(),
                        shell: config.get_shell().clone(),
                        env: sandbox_env(&instance, &workspace_dir),
                        cwd: workspace_dir,
                        rlimits: constraint.get_rlimits().clone(),
                        cgroup_procs: cgroup.as_ref().and_then(CgroupHandle::procs_cstring),
                        buffer: *config.get_session_buffer(),
                    })?;
                    self.inner.limiter.adopt(instance_id, shell.pid()).await;
                    shells.insert(instance_id.to_string(), Arc::clone(&shell));
                    shell
                }
            }
        };

        let (info, cancel, guard) = self.register(instance_id, SessionMode::InteractiveShell);
        let output = shell.hub().subscribe().into_frames(cancel, guard);

        tracing::debug!(instance_id, session_id = %info.session_id, "attached shell");
        Ok(ShellAttachment {
            info,
            output,
            input: shell.input(),
        })
    }

    /// Detaches a session. The instance and other sessions are unaffected.
    pub fn detach(&self, session_id: Uuid) -> NexusResult<SessionInfo> {
        let entry = self
            .inner
            .lock_sessions()
            .remove(&session_id)
            .ok_or_else(|| NexusError::SessionNotFound(session_id.to_string()))?;

        entry.cancel.cancel();
        tracing::debug!(%session_id, instance_id = %entry.info.instance_id, "detached session");
        Ok(entry.info)
    }

    /// Lists the sessions attached to an instance, oldest first.
    pub fn sessions(&self, instance_id: &str) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .lock_sessions()
            .values()
            .filter(|entry| entry.info.instance_id == instance_id)
            .map(|entry| entry.info.clone())
            .collect();

        sessions.sort_by_key(|info| info.attached_at);
        sessions
    }

    /// Looks up a single session.
    pub fn session(&self, session_id: Uuid) -> Option<SessionInfo> {
        self.inner
            .lock_sessions()
            .get(&session_id)
            .map(|entry| entry.info.clone())
    }

    fn register(
        &self,
        instance_id: &str,
        mode: SessionMode,
    ) -> (SessionInfo, CancellationToken, SessionGuard) {
        let info = SessionInfo {
            session_id: Uuid::new_v4(),
            instance_id: instance_id.to_string(),
            mode,
            attached_at: Utc::now(),
        };
        let cancel = CancellationToken::new();

        self.inner.lock_sessions().insert(
            info.session_id,
            SessionEntry {
                info: info.clone(),
                cancel: cancel.clone(),
            },
        );

        let guard = SessionGuard {
            mux: Arc::downgrade(&self.inner),
            session_id: info.session_id,
        };

        (info, cancel, guard)
    }
}

impl MultiplexerInner {
    fn lock_consoles(&self) -> MutexGuard<'_, HashMap<String, Arc<Console>>> {
        match self.consoles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<Uuid, SessionEntry>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.lock_sessions().remove(&self.session_id);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn ensure_running(registry: &Registry, instance_id: &str) -> NexusResult<Instance> {
    let instance = registry.get(instance_id)?;
    if instance.status != InstanceStatus::Running {
        return Err(NexusError::invalid_state(
            "attach a shell to",
            instance.status,
        ));
    }
    Ok(instance)
}

fn format_log_line(event: &LogEvent) -> String {
    format!(
        "{} {:?} {:?} {}\n",
        event.timestamp.to_rfc3339(),
        event.severity,
        event.source,
        event.text
    )
}
