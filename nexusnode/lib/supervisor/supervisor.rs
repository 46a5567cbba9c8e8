use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use nexusutils::signal_group;
use nix::sys::signal::Signal;
use tokio::{process::Child, sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{
    describe_exit, pump_output, sandbox_env, spawn_sandbox, watch_entrypoint, watch_usage,
    Sandbox, SandboxSpec,
};
use crate::{
    limiter::{CgroupHandle, InstanceHandle, ResourceLimiter},
    models::{Instance, InstanceStatus, LogEvent, LogSource},
    registry::Registry,
    session::SessionMultiplexer,
    NexusError, NexusResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long to wait for buffered output of an exited sandbox before reporting the exit.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives instances through their lifecycle and owns their sandboxes.
///
/// Every transition holds the instance's operation lock, so at most one start, stop, restart or
/// suspend is in flight per instance. A transition that finds the lock taken fails with
/// [`NexusError::ConflictingOperation`].
#[derive(Clone)]
pub struct InstanceSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    registry: Arc<Registry>,
    limiter: ResourceLimiter,
    mux: SessionMultiplexer,
    running: Mutex<HashMap<String, RunningSandbox>>,
    next_run_id: AtomicU64,
}

/// Book-keeping for a live sandbox.
struct RunningSandbox {
    run_id: u64,
    pid: u32,
    watchers: CancellationToken,
    exit: watch::Receiver<Option<String>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl InstanceSupervisor {
    /// Creates a supervisor with no running sandboxes.
    pub fn new(registry: Arc<Registry>, limiter: ResourceLimiter, mux: SessionMultiplexer) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                registry,
                limiter,
                mux,
                running: Mutex::new(HashMap::new()),
                next_run_id: AtomicU64::new(1),
            }),
        }
    }

    /// Launches the instance's sandbox and waits until it is ready.
    ///
    /// The sandbox counts as ready at its first line of output or after the ready grace period,
    /// whichever comes first. Starting an instance that is already running does nothing.
    pub async fn start(&self, instance_id: &str) -> NexusResult<Instance> {
        let _guard = self.inner.registry.locks().try_acquire(instance_id)?;
        self.inner.start_locked(instance_id).await
    }

    /// Stops the instance's sandbox. Stopping a stopped instance does nothing.
    ///
    /// The process group gets SIGTERM, then SIGKILL if it is still alive after the stop grace
    /// period.
    pub async fn stop(&self, instance_id: &str) -> NexusResult<Instance> {
        let _guard = self.inner.registry.locks().try_acquire(instance_id)?;
        self.inner.stop_locked(instance_id).await
    }

    /// Stops the instance if it is running, then starts it.
    pub async fn restart(&self, instance_id: &str) -> NexusResult<Instance> {
        let _guard = self.inner.registry.locks().try_acquire(instance_id)?;

        let instance = self.inner.registry.get(instance_id)?;
        match instance.status {
            InstanceStatus::Stopped => {}
            InstanceStatus::Starting | InstanceStatus::Running => {
                self.inner.stop_locked(instance_id).await?;
            }
            status => return Err(NexusError::invalid_state("restart", status)),
        }

        self.inner.start_locked(instance_id).await
    }

    /// Forcibly stops the instance and keeps it from being started until it is unsuspended.
    pub async fn suspend(&self, instance_id: &str) -> NexusResult<Instance> {
        let _guard = self.inner.registry.locks().try_acquire(instance_id)?;
        let inner = &self.inner;

        let instance = inner.registry.get(instance_id)?;
        match instance.status {
            InstanceStatus::Suspended => Ok(instance),
            InstanceStatus::Stopped => {
                let instance = inner
                    .registry
                    .transition(instance_id, InstanceStatus::Suspended)
                    .await?;
                tracing::info!(instance_id, "suspended instance");
                Ok(instance)
            }
            InstanceStatus::Starting | InstanceStatus::Running => {
                inner.mux.publish(
                    instance_id,
                    LogEvent::warn("Instance suspended by an administrator"),
                );
                inner.teardown(instance_id).await;

                let instance = inner
                    .registry
                    .transition(instance_id, InstanceStatus::Suspended)
                    .await;
                inner.mux.close_instance(instance_id).await;
                tracing::info!(instance_id, "suspended running instance");
                instance
            }
            status => Err(NexusError::invalid_state("suspend", status)),
        }
    }

    /// Moves a suspended instance back to stopped. It still has to be started explicitly.
    pub async fn unsuspend(&self, instance_id: &str) -> NexusResult<Instance> {
        let _guard = self.inner.registry.locks().try_acquire(instance_id)?;

        let instance = self.inner.registry.get(instance_id)?;
        match instance.status {
            InstanceStatus::Stopped => Ok(instance),
            InstanceStatus::Suspended => {
                let instance = self
                    .inner
                    .registry
                    .transition(instance_id, InstanceStatus::Stopped)
                    .await?;
                tracing::info!(instance_id, "unsuspended instance");
                Ok(instance)
            }
            status => Err(NexusError::invalid_state("unsuspend", status)),
        }
    }

    /// Stops every running sandbox. Waits for operations already in flight.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.inner.lock_running().keys().cloned().collect();
        tracing::info!(count = ids.len(), "stopping all sandboxes");

        let stops = ids.into_iter().map(|instance_id| {
            let inner = Arc::clone(&self.inner);
            async move {
                let _guard = inner.registry.locks().acquire(&instance_id).await;
                if let Err(e) = inner.stop_locked(&instance_id).await {
                    tracing::error!(%instance_id, error = %e, "failed to stop sandbox");
                }
            }
        });

        futures::future::join_all(stops).await;
    }

    /// The pid of the instance's sandbox, if one is running.
    pub fn running_pid(&self, instance_id: &str) -> Option<u32> {
        self.inner
            .lock_running()
            .get(instance_id)
            .map(|sandbox| sandbox.pid)
    }
}

impl SupervisorInner {
    async fn start_locked(self: &Arc<Self>, instance_id: &str) -> NexusResult<Instance> {
        let instance = self.registry.get(instance_id)?;
        match instance.status {
            InstanceStatus::Stopped => {}
            InstanceStatus::Starting | InstanceStatus::Running => return Ok(instance),
            status => return Err(NexusError::invalid_state("start", status)),
        }

        let workspaces = self.registry.workspaces();
        if !workspaces.exists(instance_id, &instance.entrypoint).await? {
            tracing::warn!(instance_id, entrypoint = %instance.entrypoint, "refusing to start without entrypoint");
            return Err(NexusError::EntrypointMissing(instance.entrypoint.clone()));
        }

        instance.limits.validate()?;
        let config = self.registry.config();
        let workspace_dir = workspaces.dir(instance_id);
        let constraint = self.limiter.build_constraint(&instance.limits);

        self.mux.open_console(instance_id).await?;
        self.registry
            .transition(instance_id, InstanceStatus::Starting)
            .await?;
        self.mux.publish(
            instance_id,
            LogEvent::info(format!(
                "Starting instance {} with entrypoint {}",
                instance_id, instance.entrypoint
            )),
        );

        let cgroup = self.limiter.prepare(instance_id, &constraint).await;
        let spec = SandboxSpec {
            shell: config.get_shell().clone(),
            command: instance.startup_command.clone(),
            env: sandbox_env(&instance, &workspace_dir),
            cwd: workspace_dir.clone(),
            rlimits: constraint.get_rlimits().clone(),
            cgroup_procs: cgroup.as_ref().and_then(CgroupHandle::procs_cstring),
        };

        let Sandbox { pid, mut child } = match spawn_sandbox(spec) {
            Ok(sandbox) => sandbox,
            Err(e) => {
                self.limiter.release(instance_id).await;
                self.abort_start(instance_id, &e.to_string()).await;
                return Err(e);
            }
        };

        self.limiter.place(instance_id, pid).await;
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let first_output = CancellationToken::new();
        let watchers = CancellationToken::new();
        let (exit_tx, mut exit_rx) = watch::channel(None);

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_output(
                stdout,
                LogSource::Stdout,
                self.mux.clone(),
                instance_id.to_string(),
                first_output.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_output(
                stderr,
                LogSource::Stderr,
                self.mux.clone(),
                instance_id.to_string(),
                first_output.clone(),
            )));
        }

        self.lock_running().insert(
            instance_id.to_string(),
            RunningSandbox {
                run_id,
                pid,
                watchers: watchers.clone(),
                exit: exit_rx.clone(),
            },
        );
        tokio::spawn(Arc::clone(self).watch_exit(
            instance_id.to_string(),
            run_id,
            child,
            pumps,
            exit_tx,
        ));

        let exited_early = tokio::select! {
            biased;
            _ = first_output.cancelled() => false,
            _ = exit_rx.changed() => true,
            _ = tokio::time::sleep(config.ready_grace()) => false,
        };

        if exited_early {
            let status = wait_exit(&mut exit_rx).await;
            let sandbox = self.lock_running().remove(instance_id);
            if let Some(sandbox) = sandbox {
                sandbox.release(&self.limiter, instance_id).await;
            }

            let message = format!("sandbox exited before becoming ready ({})", status);
            self.abort_start(instance_id, &message).await;
            return Err(NexusError::SandboxFailure(message));
        }

        let instance = match self
            .registry
            .transition(instance_id, InstanceStatus::Running)
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                self.teardown(instance_id).await;
                self.abort_start(instance_id, &e.to_string()).await;
                return Err(e);
            }
        };

        tokio::spawn(watch_usage(
            Arc::clone(&self.registry),
            self.limiter.clone(),
            self.mux.clone(),
            InstanceHandle {
                instance_id: instance_id.to_string(),
                pid,
                workspace_dir,
            },
            constraint,
            config.sample_interval(),
            watchers.clone(),
        ));
        tokio::spawn(watch_entrypoint(
            Arc::clone(&self.registry),
            self.mux.clone(),
            instance_id.to_string(),
            instance.entrypoint.clone(),
            config.entrypoint_check_interval(),
            watchers,
        ));

        self.mux.publish(
            instance_id,
            LogEvent::info(format!(
                "Instance {} is running on port {}",
                instance_id, instance.network.port
            )),
        );
        tracing::info!(instance_id, pid, port = instance.network.port, "instance running");

        Ok(instance)
    }

    async fn stop_locked(&self, instance_id: &str) -> NexusResult<Instance> {
        let instance = self.registry.get(instance_id)?;
        match instance.status {
            InstanceStatus::Stopped => return Ok(instance),
            InstanceStatus::Starting | InstanceStatus::Running => {}
            status => return Err(NexusError::invalid_state("stop", status)),
        }

        self.mux
            .publish(instance_id, LogEvent::info(format!("Stopping instance {}", instance_id)));
        self.teardown(instance_id).await;
        self.mux
            .publish(instance_id, LogEvent::info(format!("Instance {} stopped", instance_id)));

        let instance = self
            .registry
            .transition(instance_id, InstanceStatus::Stopped)
            .await;
        self.mux.close_instance(instance_id).await;
        tracing::info!(instance_id, "stopped instance");

        instance
    }

    /// Kills the sandbox of an instance, if any, and releases what it held.
    async fn teardown(&self, instance_id: &str) {
        let Some(sandbox) = self.lock_running().remove(instance_id) else {
            return;
        };

        sandbox.watchers.cancel();
        let grace = self.registry.config().stop_grace();
        let mut exit = sandbox.exit.clone();

        match signal_group(sandbox.pid, Signal::SIGTERM) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(instance_id, pid = sandbox.pid, "sandbox already gone"),
            Err(e) => tracing::warn!(instance_id, error = %e, "failed to send SIGTERM"),
        }

        if tokio::time::timeout(grace, wait_exit(&mut exit)).await.is_err() {
            tracing::warn!(instance_id, pid = sandbox.pid, "sandbox ignored SIGTERM, killing it");
            if let Err(e) = signal_group(sandbox.pid, Signal::SIGKILL) {
                tracing::error!(instance_id, error = %e, "failed to send SIGKILL");
            }
            let _ = tokio::time::timeout(grace, wait_exit(&mut exit)).await;
        }

        sandbox.release(&self.limiter, instance_id).await;
    }

    /// Reports a failed start and puts the instance back to stopped.
    async fn abort_start(&self, instance_id: &str, reason: &str) {
        tracing::error!(instance_id, reason, "failed to start instance");
        self.mux.publish(
            instance_id,
            LogEvent::error(format!("Failed to start instance: {}", reason)),
        );

        if let Err(e) = self
            .registry
            .transition(instance_id, InstanceStatus::Stopped)
            .await
        {
            tracing::error!(instance_id, error = %e, "failed to reset instance status");
        }
        self.mux.close_instance(instance_id).await;
    }

    /// Waits for a sandbox to exit and, unless it was stopped on purpose, reports the crash and
    /// stops the instance.
    async fn watch_exit(
        self: Arc<Self>,
        instance_id: String,
        run_id: u64,
        mut child: Child,
        pumps: Vec<JoinHandle<()>>,
        exit_tx: watch::Sender<Option<String>>,
    ) {
        let status = match child.wait().await {
            Ok(status) => describe_exit(&status),
            Err(e) => format!("wait failed: {}", e),
        };
        exit_tx.send_replace(Some(status.clone()));

        let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, futures::future::join_all(pumps)).await;

        let _guard = self.registry.locks().acquire(&instance_id).await;
        let sandbox = {
            let mut running = self.lock_running();
            match running.get(&instance_id) {
                Some(sandbox) if sandbox.run_id == run_id => running.remove(&instance_id),
                _ => None,
            }
        };
        let Some(sandbox) = sandbox else {
            return;
        };

        sandbox.release(&self.limiter, &instance_id).await;
        tracing::warn!(%instance_id, %status, "sandbox exited unexpectedly");
        self.mux.publish(
            &instance_id,
            LogEvent::error(format!("Process exited unexpectedly ({})", status)),
        );

        if let Err(e) = self
            .registry
            .transition(&instance_id, InstanceStatus::Stopped)
            .await
        {
            tracing::error!(%instance_id, error = %e, "failed to mark crashed instance stopped");
        }
        self.mux.close_instance(&instance_id).await;
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<String, RunningSandbox>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl RunningSandbox {
    /// Stops the watchers and kills whatever the sandbox left in its cgroup.
    async fn release(self, limiter: &ResourceLimiter, instance_id: &str) {
        self.watchers.cancel();
        limiter.release(instance_id).await;
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn wait_exit(exit: &mut watch::Receiver<Option<String>>) -> String {
    match exit.wait_for(Option::is_some).await {
        Ok(status) => status.clone().unwrap_or_default(),
        Err(_) => "unknown exit status".to_string(),
    }
}
