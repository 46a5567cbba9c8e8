use std::{sync::Arc, time::Duration};

use nexusutils::{is_within, rebase_path, signal_group};
use nix::sys::signal::Signal;
use tokio::{sync::broadcast::error::RecvError, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    limiter::{InstanceHandle, ResourceLimiter, SandboxConstraint},
    models::{LogEvent, WorkspaceChange},
    registry::Registry,
    session::SessionMultiplexer,
    NexusError,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a workspace change took an entrypoint away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrypointLoss {
    /// The entrypoint or a directory above it was deleted.
    Removed,

    /// The entrypoint now lives at another path.
    Moved(String),
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Samples a running sandbox until cancelled, killing it when it breaches its memory ceiling
/// or outgrows its disk quota.
///
/// CPU is never a reason to kill; the cgroup throttles it.
pub async fn watch_usage(
    registry: Arc<Registry>,
    limiter: ResourceLimiter,
    mux: SessionMultiplexer,
    handle: InstanceHandle,
    constraint: SandboxConstraint,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let sample = limiter.sample(&handle).await;
        if !sample.stale {
            registry.record_usage(&handle.instance_id, sample.resource);
        }

        if let Some(breach) = limiter.check(&sample.resource, &constraint) {
            tracing::warn!(instance_id = %handle.instance_id, pid = handle.pid, %breach, "killing sandbox");
            mux.publish(
                &handle.instance_id,
                LogEvent::error(format!("Instance terminated: {}", breach)),
            );

            if let Err(e) = signal_group(handle.pid, Signal::SIGKILL) {
                tracing::error!(instance_id = %handle.instance_id, error = %e, "failed to kill sandbox");
            }
            break;
        }
    }
}

/// Warns once per loss when a running instance's entrypoint disappears from its workspace.
///
/// Reacts to deletes and renames immediately and rechecks existence every `interval` to catch
/// changes made by the instance itself. The running process is left alone.
pub async fn watch_entrypoint(
    registry: Arc<Registry>,
    mux: SessionMultiplexer,
    instance_id: String,
    entrypoint: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let workspaces = registry.workspaces().clone();
    let mut changes = workspaces.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut lost = false;

    loop {
        let (present, loss) = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => match change {
                Ok(change) => match entrypoint_loss(&change, &instance_id, &entrypoint) {
                    Some(loss) => (false, Some(loss)),
                    None => continue,
                },
                Err(RecvError::Lagged(_)) => (
                    workspaces
                        .exists(&instance_id, &entrypoint)
                        .await
                        .unwrap_or(false),
                    None,
                ),
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => (
                workspaces
                    .exists(&instance_id, &entrypoint)
                    .await
                    .unwrap_or(false),
                None,
            ),
        };

        if present {
            lost = false;
        } else if !lost {
            lost = true;
            let mut message = NexusError::EntrypointLost(entrypoint.clone()).to_string();
            if let Some(EntrypointLoss::Moved(to)) = &loss {
                message = format!("{} (moved to {})", message, to);
            }

            tracing::warn!(%instance_id, %entrypoint, ?loss, "entrypoint lost while running");
            mux.publish(&instance_id, LogEvent::warn(message));
        }
    }
}

/// Whether, and how, a workspace change takes the entrypoint of `instance_id` away.
pub fn entrypoint_loss(
    change: &WorkspaceChange,
    instance_id: &str,
    entrypoint: &str,
) -> Option<EntrypointLoss> {
    match change {
        WorkspaceChange::Removed {
            instance_id: id,
            path,
        } if id == instance_id && is_within(entrypoint, path) => Some(EntrypointLoss::Removed),
        WorkspaceChange::Renamed {
            instance_id: id,
            from,
            to,
        } if id == instance_id => {
            rebase_path(entrypoint, from, to).map(EntrypointLoss::Moved)
        }
        _ => None,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
