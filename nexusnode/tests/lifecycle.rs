use std::{path::Path, time::Duration};

use axum::{
    body::{to_bytes, Body, Bytes},
    http::{Request, StatusCode},
    Router,
};
use futures::{Stream, StreamExt};
use nexusnode::{
    config::{HostConfig, PortRange},
    host::NodeHost,
    models::{InstanceStatus, LogEvent, LogSource, ServerResource, SessionFrame, Severity},
    registry::NewInstance,
    server::{create_router, ServerState, ADMIN_HEADER, CALLER_HEADER},
    NexusError,
};
use serde_json::Value;
use tempfile::{tempdir, TempDir};
use tower::ServiceExt;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

//--------------------------------------------------------------------------------------------------
// Tests: Lifecycle
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_start_requires_entrypoint() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create(&host, "echo hello; sleep 30").await?;
    let supervisor = host.get_supervisor();

    let err = supervisor.start(&id).await.unwrap_err();
    assert!(matches!(err, NexusError::EntrypointMissing(ref path) if path == "/index.js"));
    assert_eq!(
        *host.get_registry().get(&id)?.get_status(),
        InstanceStatus::Stopped
    );

    host.get_registry()
        .update_limits(&id, ServerResource::new(1.0, 512, 5.0))
        .await?;
    host.workspaces()
        .write(&id, "index.js", "console.log('hello')")
        .await?;
    let instance = supervisor.start(&id).await?;
    assert_eq!(instance.get_limits().ram_mb, 512);
    assert_eq!(*instance.get_status(), InstanceStatus::Running);
    assert!(supervisor.running_pid(&id).is_some());

    let tail = host.get_multiplexer().attach_log_tail(&id)?;
    assert!(tail.info.is_some());
    assert_eq!(host.get_multiplexer().sessions(&id).len(), 1);

    supervisor.stop(&id).await?;
    let events = collect_events(tail.events).await?;

    assert!(events.iter().any(|event| event.severity == Severity::Info
        && event.source == LogSource::System
        && event.text == format!("Starting instance {} with entrypoint /index.js", id)));
    assert!(events
        .iter()
        .any(|event| event.source == LogSource::Stdout && event.text == "hello"));
    assert_eq!(
        events.last().map(|event| event.text.clone()),
        Some(format!("Instance {} stopped", id))
    );

    assert_eq!(
        *host.get_registry().get(&id)?.get_status(),
        InstanceStatus::Stopped
    );
    assert!(supervisor.running_pid(&id).is_none());
    assert!(host.get_multiplexer().sessions(&id).is_empty());

    host.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_suspended_instance_cannot_start() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create_with_entrypoint(&host, "echo ready; sleep 30").await?;
    let supervisor = host.get_supervisor();

    supervisor.start(&id).await?;
    let instance = supervisor.suspend(&id).await?;
    assert_eq!(*instance.get_status(), InstanceStatus::Suspended);
    assert!(supervisor.running_pid(&id).is_none());

    let err = supervisor.start(&id).await.unwrap_err();
    assert!(matches!(
        err,
        NexusError::InvalidState {
            status: InstanceStatus::Suspended,
            ..
        }
    ));

    let instance = supervisor.unsuspend(&id).await?;
    assert_eq!(*instance.get_status(), InstanceStatus::Stopped);

    let instance = supervisor.start(&id).await?;
    assert_eq!(*instance.get_status(), InstanceStatus::Running);

    host.shutdown().await;
    assert_eq!(
        *host.get_registry().get(&id)?.get_status(),
        InstanceStatus::Stopped
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_concurrent_starts_launch_one_sandbox() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create_with_entrypoint(&host, "echo ready; sleep 30").await?;
    let supervisor = host.get_supervisor();

    let (first, second) = tokio::join!(supervisor.start(&id), supervisor.start(&id));
    let results = [first, second];

    assert!(results.iter().any(|result| result.is_ok()));
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, NexusError::ConflictingOperation(_)), "{}", e);
        }
    }

    let pid = supervisor.running_pid(&id);
    assert!(pid.is_some());

    // A second start after the first has finished changes nothing.
    supervisor.start(&id).await?;
    assert_eq!(supervisor.running_pid(&id), pid);

    supervisor.stop(&id).await?;
    assert!(supervisor.running_pid(&id).is_none());

    host.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_crash_moves_instance_to_stopped() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create_with_entrypoint(&host, "echo up; sleep 1; exit 3").await?;

    host.get_supervisor().start(&id).await?;
    let tail = host.get_multiplexer().attach_log_tail(&id)?;
    let events = collect_events(tail.events).await?;

    assert!(events.iter().any(|event| event.severity == Severity::Error
        && event.text == "Process exited unexpectedly (exit code 3)"));
    assert_eq!(
        *host.get_registry().get(&id)?.get_status(),
        InstanceStatus::Stopped
    );
    assert!(host.get_supervisor().running_pid(&id).is_none());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_exit_before_ready_fails_start() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create_with_entrypoint(&host, "exit 7").await?;

    let err = host.get_supervisor().start(&id).await.unwrap_err();
    assert!(matches!(
        err,
        NexusError::SandboxFailure(ref message) if message.contains("exit code 7")
    ));
    assert_eq!(
        *host.get_registry().get(&id)?.get_status(),
        InstanceStatus::Stopped
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_lost_entrypoint_is_reported() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create_with_entrypoint(&host, "echo ready; sleep 30").await?;

    host.get_supervisor().start(&id).await?;
    let mut tail = host.get_multiplexer().attach_log_tail(&id)?;
    host.workspaces().delete(&id, "/index.js").await?;

    let warning = next_event_matching(&mut tail.events, |event| {
        event.severity == Severity::Warn && event.text.contains("/index.js")
    })
    .await?;
    assert_eq!(warning.source, LogSource::System);
    assert_eq!(
        *host.get_registry().get(&id)?.get_status(),
        InstanceStatus::Running
    );

    host.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_restart_force_kills_sandbox_ignoring_sigterm() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create_with_entrypoint(
        &host,
        "trap '' TERM; echo ready; while true; do sleep 0.1; done",
    )
    .await?;
    let supervisor = host.get_supervisor();

    supervisor.start(&id).await?;
    let old_pid = supervisor.running_pid(&id).expect("sandbox pid");

    let instance = supervisor.restart(&id).await?;
    assert_eq!(*instance.get_status(), InstanceStatus::Running);

    let new_pid = supervisor.running_pid(&id).expect("sandbox pid");
    assert_ne!(new_pid, old_pid);
    assert!(wait_until_gone(old_pid).await);

    host.shutdown().await;
    assert!(wait_until_gone(new_pid).await);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_memory_breach_kills_and_stops_instance() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create_with_entrypoint(
        &host,
        "echo ready; (head -c 300000000 /dev/zero; sleep 30) | tail > /dev/null",
    )
    .await?;
    host.get_registry()
        .update_limits(&id, ServerResource::new(0.0, 64, 0.0))
        .await?;

    host.get_supervisor().start(&id).await?;
    let tail = host.get_multiplexer().attach_log_tail(&id)?;
    let events = collect_events(tail.events).await?;

    assert!(events.iter().any(|event| event.severity == Severity::Error
        && event.source == LogSource::System
        && event.text.starts_with("Instance terminated: memory limit exceeded")));
    assert_eq!(
        *host.get_registry().get(&id)?.get_status(),
        InstanceStatus::Stopped
    );
    assert!(host.get_supervisor().running_pid(&id).is_none());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_renamed_entrypoint_reports_new_path() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create_with_entrypoint(&host, "echo ready; sleep 30").await?;

    host.get_supervisor().start(&id).await?;
    let mut tail = host.get_multiplexer().attach_log_tail(&id)?;
    host.workspaces().create_dir(&id, "/old").await?;
    host.workspaces()
        .rename(&id, "/index.js", "/old/index.js")
        .await?;

    let warning = next_event_matching(&mut tail.events, |event| {
        event.severity == Severity::Warn && event.text.contains("/index.js")
    })
    .await?;
    assert!(
        warning.text.ends_with("(moved to /old/index.js)"),
        "{}",
        warning.text
    );

    host.shutdown().await;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests: Sessions
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_log_tail_of_stopped_instance_ends_immediately() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create(&host, "sleep 30").await?;

    let tail = host.get_multiplexer().attach_log_tail(&id)?;
    assert!(tail.info.is_none());

    let frames: Vec<_> = tail.events.collect().await;
    assert_eq!(frames, vec![SessionFrame::End]);
    assert!(host.get_multiplexer().sessions(&id).is_empty());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_shell_requires_running_instance() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create(&host, "sleep 30").await?;

    let err = host.get_multiplexer().attach_shell(&id).await.err();
    assert!(matches!(
        err,
        Some(NexusError::InvalidState {
            status: InstanceStatus::Stopped,
            ..
        })
    ));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_detaching_one_shell_viewer_keeps_the_other() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create_with_entrypoint(&host, "echo ready; sleep 30").await?;
    host.get_supervisor().start(&id).await?;

    let mux = host.get_multiplexer();
    let first = mux.attach_shell(&id).await?;
    let mut second = mux.attach_shell(&id).await?;
    assert_eq!(mux.sessions(&id).len(), 2);

    mux.detach(first.info.session_id)?;
    let first_frames: Vec<_> =
        tokio::time::timeout(FRAME_TIMEOUT, first.output.collect()).await?;
    assert_eq!(first_frames.last(), Some(&SessionFrame::End));
    assert_eq!(mux.sessions(&id), vec![second.info.clone()]);

    // Input from a detached viewer's handle still reaches the shared terminal.
    first.input.send_line("echo marker-$((40 + 2))")?;

    let output =
        shell_output_until(&mut second.output, |output| output.contains("marker-42")).await?;
    assert!(output.contains("marker-42"));

    assert!(matches!(
        mux.detach(first.info.session_id),
        Err(NexusError::SessionNotFound(_))
    ));

    host.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_stop_kills_shell_background_jobs_and_ends_viewers() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create_with_entrypoint(&host, "echo ready; sleep 30").await?;
    host.get_supervisor().start(&id).await?;

    let mux = host.get_multiplexer();
    let mut shell = mux.attach_shell(&id).await?;
    shell.input.send_line("sleep 4242 & echo bg-pid=$!")?;

    let output = shell_output_until(&mut shell.output, |output| {
        background_pid(output).is_some()
    })
    .await?;
    let job = background_pid(&output).expect("background job pid");
    assert!(!is_gone(job));

    host.get_supervisor().stop(&id).await?;

    let rest: Vec<_> =
        tokio::time::timeout(Duration::from_secs(3), shell.output.collect()).await?;
    assert_eq!(rest.last(), Some(&SessionFrame::End));
    assert!(wait_until_gone(job).await, "background job {} survived", job);
    assert!(mux.sessions(&id).is_empty());

    // The shell does not come back for a stopped instance.
    assert!(matches!(
        mux.attach_shell(&id).await.err(),
        Some(NexusError::InvalidState {
            status: InstanceStatus::Stopped,
            ..
        })
    ));
    assert!(mux.sessions(&id).is_empty());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_shell_counts_towards_memory_limit() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create_with_entrypoint(&host, "echo ready; sleep 30").await?;
    host.get_registry()
        .update_limits(&id, ServerResource::new(0.0, 64, 0.0))
        .await?;
    host.get_supervisor().start(&id).await?;

    let mux = host.get_multiplexer();
    let tail = mux.attach_log_tail(&id)?;
    let shell = mux.attach_shell(&id).await?;
    shell
        .input
        .send_line("(head -c 300000000 /dev/zero; sleep 30) | tail > /dev/null")?;

    let events = collect_events(tail.events).await?;
    assert!(events
        .iter()
        .any(|event| event.text.starts_with("Instance terminated: memory limit exceeded")));
    assert_eq!(
        *host.get_registry().get(&id)?.get_status(),
        InstanceStatus::Stopped
    );

    let frames: Vec<_> =
        tokio::time::timeout(FRAME_TIMEOUT, shell.output.collect()).await?;
    assert_eq!(frames.last(), Some(&SessionFrame::End));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_suspending_running_instance_ends_every_session() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let id = create_with_entrypoint(&host, "echo ready; sleep 30").await?;
    host.get_supervisor().start(&id).await?;

    let mux = host.get_multiplexer();
    let tail = mux.attach_log_tail(&id)?;
    let shell = mux.attach_shell(&id).await?;
    assert_eq!(mux.sessions(&id).len(), 2);

    let instance = host.get_supervisor().suspend(&id).await?;
    assert_eq!(*instance.get_status(), InstanceStatus::Suspended);

    let events = collect_events(tail.events).await?;
    assert!(events.iter().any(|event| event.severity == Severity::Warn
        && event.text == "Instance suspended by an administrator"));

    let frames: Vec<_> =
        tokio::time::timeout(FRAME_TIMEOUT, shell.output.collect()).await?;
    assert_eq!(frames.last(), Some(&SessionFrame::End));
    assert!(mux.sessions(&id).is_empty());

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests: API
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_api_instance_and_workspace_flow() -> anyhow::Result<()> {
    let (_home, host) = open_host().await?;
    let router = create_router(ServerState::new(host.clone()));

    let (status, _) = call(&router, "GET", "/instances", None, Body::empty()).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let body = serde_json::json!({
        "name": "echo",
        "startupCommand": "echo hi; sleep 30",
        "entrypoint": "index.js",
    });
    let (status, created) = call(
        &router,
        "POST",
        "/instances",
        Some(("alice", false)),
        Body::from(body.to_string()),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let created: Value = serde_json::from_slice(&created)?;
    let id = created["id"].as_str().unwrap_or_default().to_string();
    assert_eq!(created["status"], "STOPPED");
    assert_eq!(created["entrypoint"], "/index.js");

    let alice = Some(("alice", false));
    let ops = Some(("ops", true));
    let instance_uri = format!("/instances/{}", id);
    let action_uri = format!("/instances/{}/action", id);

    let (status, _) = call(
        &router,
        "GET",
        &instance_uri,
        Some(("bob", false)),
        Body::empty(),
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let start = Body::from(r#"{"action":"start"}"#);
    let (status, error) = call(&router, "POST", &action_uri, alice, start).await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let error: Value = serde_json::from_slice(&error)?;
    assert_eq!(error["error_type"], "entrypoint_error");

    let suspend = Body::from(r#"{"action":"suspend"}"#);
    let (status, _) = call(&router, "POST", &action_uri, alice, suspend).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let file_uri = format!("/workspace/{}/src/main.js", id);
    let (status, _) = call(&router, "PUT", &file_uri, alice, Body::from("x")).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &router,
        "PUT",
        &format!("/workspace/{}/src?kind=directory", id),
        alice,
        Body::empty(),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(
        &router,
        "PUT",
        &file_uri,
        alice,
        Body::from("console.log(1)"),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, content) = call(&router, "GET", &file_uri, alice, Body::empty()).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&content[..], b"console.log(1)");

    let (status, stat) = call(
        &router,
        "GET",
        &format!("{}?stat=true", file_uri),
        alice,
        Body::empty(),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let stat: Value = serde_json::from_slice(&stat)?;
    assert_eq!(stat["kind"], "file");
    assert_eq!(stat["size"], 14);

    let rename = Body::from(r#"{"to":"/index.js"}"#);
    let (status, renamed) = call(
        &router,
        "POST",
        &format!("{}/rename", file_uri),
        alice,
        rename,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let renamed: Value = serde_json::from_slice(&renamed)?;
    assert_eq!(renamed["path"], "/index.js");

    let (status, _) = call(
        &router,
        "GET",
        &format!("/workspace/{}/../etc/passwd", id),
        alice,
        Body::empty(),
    )
    .await?;
    assert!(status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND);

    let suspend = Body::from(r#"{"action":"suspend"}"#);
    let (status, suspended) = call(&router, "POST", &action_uri, ops, suspend).await?;
    assert_eq!(status, StatusCode::OK);
    let suspended: Value = serde_json::from_slice(&suspended)?;
    assert_eq!(suspended["status"], "SUSPENDED");

    let (status, listed) = call(&router, "GET", "/instances", ops, Body::empty()).await?;
    assert_eq!(status, StatusCode::OK);
    let listed: Value = serde_json::from_slice(&listed)?;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let (status, deleted) = call(&router, "DELETE", &instance_uri, alice, Body::empty()).await?;
    assert_eq!(status, StatusCode::OK);
    let deleted: Value = serde_json::from_slice(&deleted)?;
    assert_eq!(deleted["status"], "DELETED");

    let (status, _) = call(&router, "GET", &instance_uri, alice, Body::empty()).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn open_host() -> anyhow::Result<(TempDir, NodeHost)> {
    let home = tempdir()?;
    let host = NodeHost::open(test_config(home.path())).await?;
    Ok((home, host))
}

fn test_config(home: &Path) -> HostConfig {
    HostConfig::builder()
        .home_dir(home)
        .port_range(PortRange::new(41000, 41009))
        .stop_grace_ms(500)
        .ready_grace_ms(500)
        .sample_interval_ms(200)
        .entrypoint_check_ms(100)
        .enable_cgroups(false)
        .build()
}

async fn create(host: &NodeHost, startup_command: &str) -> anyhow::Result<String> {
    let instance = host
        .get_registry()
        .create(
            "alice",
            NewInstance::builder()
                .name("test-bot")
                .startup_command(startup_command)
                .entrypoint("index.js")
                .build(),
        )
        .await?;

    Ok(instance.get_id().clone())
}

async fn create_with_entrypoint(host: &NodeHost, startup_command: &str) -> anyhow::Result<String> {
    let id = create(host, startup_command).await?;
    host.workspaces()
        .write(&id, "/index.js", "console.log('ready')")
        .await?;
    Ok(id)
}

async fn collect_events<S>(frames: S) -> anyhow::Result<Vec<LogEvent>>
where
    S: Stream<Item = SessionFrame<LogEvent>>,
{
    let frames: Vec<_> = tokio::time::timeout(FRAME_TIMEOUT, frames.collect()).await?;
    assert_eq!(frames.last(), Some(&SessionFrame::End));

    Ok(frames
        .into_iter()
        .filter_map(|frame| match frame {
            SessionFrame::Event(event) => Some(event),
            _ => None,
        })
        .collect())
}

async fn next_event_matching<S>(
    frames: &mut S,
    predicate: impl Fn(&LogEvent) -> bool,
) -> anyhow::Result<LogEvent>
where
    S: Stream<Item = SessionFrame<LogEvent>> + Unpin,
{
    let found = tokio::time::timeout(FRAME_TIMEOUT, async {
        while let Some(frame) = frames.next().await {
            match frame {
                SessionFrame::Event(event) if predicate(&event) => return Some(event),
                SessionFrame::End => return None,
                _ => {}
            }
        }
        None
    })
    .await?;

    found.ok_or_else(|| anyhow::anyhow!("stream ended without a matching event"))
}

async fn shell_output_until<S>(
    frames: &mut S,
    done: impl Fn(&str) -> bool,
) -> anyhow::Result<String>
where
    S: Stream<Item = SessionFrame<Bytes>> + Unpin,
{
    let mut output = String::new();
    tokio::time::timeout(FRAME_TIMEOUT, async {
        while let Some(frame) = frames.next().await {
            if let SessionFrame::Event(chunk) = frame {
                output.push_str(&String::from_utf8_lossy(&chunk));
                if done(&output) {
                    break;
                }
            }
        }
    })
    .await?;

    Ok(output)
}

/// The pid printed by `echo bg-pid=$!`. The echoed command line itself has no digits there.
fn background_pid(output: &str) -> Option<u32> {
    output.split("bg-pid=").skip(1).find_map(|rest| {
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    })
}

/// Whether a process has exited. Zombies count as exited.
fn is_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

async fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..50 {
        if is_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn call(
    router: &Router,
    method: &str,
    uri: &str,
    caller: Option<(&str, bool)>,
    body: Body,
) -> anyhow::Result<(StatusCode, axum::body::Bytes)> {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some((identity, is_admin)) = caller {
        request = request.header(CALLER_HEADER, identity);
        if is_admin {
            request = request.header(ADMIN_HEADER, "true");
        }
    }

    let response = router.clone().oneshot(request.body(body)?).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, bytes))
}
