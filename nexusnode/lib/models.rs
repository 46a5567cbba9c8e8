//! Data types shared by the registry, supervisor, workspace store and session multiplexer.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{NexusError, NexusResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Largest CPU quota an instance may declare, in cores.
pub const MAX_CPU_CORES: f64 = 1024.0;

/// Largest memory quota an instance may declare, in MiB (16 TiB).
pub const MAX_RAM_MB: u64 = 16 * 1024 * 1024;

/// Largest disk quota an instance may declare, in GiB (1 PiB).
pub const MAX_DISK_GB: f64 = 1024.0 * 1024.0;

const MIB: u64 = 1024 * 1024;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

//--------------------------------------------------------------------------------------------------
// Types: Instance
//--------------------------------------------------------------------------------------------------

/// One hosted, isolated execution unit.
#[derive(Debug, Clone, PartialEq, Getters, Serialize, Deserialize)]
#[getset(get = "pub with_prefix")]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Unique identifier, assigned at creation.
    pub(crate) id: String,

    /// Identity of the controlling user.
    pub(crate) owner: String,

    /// Display name.
    pub(crate) name: String,

    /// Current lifecycle state.
    pub(crate) status: InstanceStatus,

    /// Declared quota.
    pub(crate) limits: ServerResource,

    /// Live sampled consumption. Zero unless running.
    pub(crate) usage: ServerResource,

    /// Command run by the sandbox shell.
    pub(crate) startup_command: String,

    /// Workspace file the startup command is expected to execute.
    pub(crate) entrypoint: String,

    /// Assigned port and the URL it is reachable on.
    pub(crate) network: NetworkBinding,

    /// Identifier of the workspace owned by this instance.
    pub(crate) workspace_ref: String,

    /// When the instance was created.
    pub(crate) created_at: DateTime<Utc>,

    /// When the instance record was last changed.
    pub(crate) modified_at: DateTime<Utc>,
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// No sandbox exists.
    Stopped,

    /// A sandbox has been launched but has not reported readiness.
    Starting,

    /// The sandbox is running.
    Running,

    /// Forcibly stopped by an admin. Cannot be started until unsuspended.
    Suspended,

    /// Terminal state.
    Deleted,
}

/// CPU, memory and disk amounts. Used both for quotas and for sampled usage.
///
/// A zero quota means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerResource {
    /// CPU cores (fractional).
    pub cpu_cores: f64,

    /// Memory in MiB.
    #[serde(rename = "ramMB")]
    pub ram_mb: u64,

    /// Disk in GiB (fractional).
    #[serde(rename = "diskGB")]
    pub disk_gb: f64,
}

/// A point-in-time usage reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSample {
    /// The measured consumption.
    pub resource: ServerResource,

    /// When the measurement was taken.
    pub sampled_at: DateTime<Utc>,

    /// Whether the reading is a previous value returned because sampling timed out.
    pub stale: bool,
}

/// The network port assigned to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBinding {
    /// Port on the host.
    pub port: u16,

    /// Externally reachable URL.
    pub url: String,
}

//--------------------------------------------------------------------------------------------------
// Types: Workspace
//--------------------------------------------------------------------------------------------------

/// A file or directory within an instance's workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceNode {
    /// Canonical absolute path.
    pub path: String,

    /// Last path segment.
    pub name: String,

    /// File or directory.
    pub kind: NodeKind,

    /// Size in bytes. Zero for directories.
    pub size: u64,

    /// Last content or metadata change.
    pub modified_at: DateTime<Utc>,
}

/// The kind of a workspace node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A regular file.
    File,

    /// A directory.
    Directory,
}

/// A change to a workspace that other components may need to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceChange {
    /// The node at `path` and all its descendants were removed.
    Removed {
        /// The owning instance.
        instance_id: String,

        /// The removed path.
        path: String,
    },

    /// The node at `from` and all its descendants now live under `to`.
    Renamed {
        /// The owning instance.
        instance_id: String,

        /// The old path.
        from: String,

        /// The new path.
        to: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Types: Sessions
//--------------------------------------------------------------------------------------------------

/// An attached log or shell channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Unique session id.
    pub session_id: Uuid,

    /// The instance this session is attached to.
    pub instance_id: String,

    /// What the session is viewing.
    pub mode: SessionMode,

    /// When the session was attached.
    pub attached_at: DateTime<Utc>,
}

/// The kind of session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionMode {
    /// Read-only console output.
    LogTail,

    /// Shared pseudo-terminal.
    InteractiveShell,
}

/// One structured console line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// When the line was produced.
    pub timestamp: DateTime<Utc>,

    /// Severity.
    pub severity: Severity,

    /// Where the line came from.
    pub source: LogSource,

    /// The text, without a trailing newline.
    pub text: String,
}

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,

    /// Something the owner should look at.
    Warn,

    /// A failure.
    Error,
}

/// Origin of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Emitted by the host about the instance.
    System,

    /// The sandbox's standard output.
    Stdout,

    /// The sandbox's standard error.
    Stderr,
}

/// An item delivered to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum SessionFrame<T> {
    /// A log event or a chunk of terminal output.
    Event(T),

    /// The session fell behind and this many items were skipped for it.
    Dropped {
        /// Number of skipped items.
        count: u64,
    },

    /// The stream is over. Nothing follows.
    End,
}

/// A frame delivered to a log tail.
pub type LogFrame = SessionFrame<LogEvent>;

/// A frame delivered to a shell viewer.
pub type ShellFrame = SessionFrame<Bytes>;

//--------------------------------------------------------------------------------------------------
// Types: Callers
//--------------------------------------------------------------------------------------------------

/// The identity a request is made under. Supplied by an external authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// The user's identity.
    pub identity: String,

    /// Whether the user may see and manage every instance.
    pub is_admin: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl InstanceStatus {
    /// Whether the lifecycle state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;

        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Stopped, Starting) | (Stopped, Suspended) => true,
            (Starting, Running) | (Starting, Stopped) | (Starting, Suspended) => true,
            (Running, Stopped) | (Running, Suspended) => true,
            (Suspended, Stopped) => true,
            _ => false,
        }
    }

    /// Whether a sandbox process exists in this state.
    pub fn has_sandbox(self) -> bool {
        matches!(self, InstanceStatus::Starting | InstanceStatus::Running)
    }

    /// The stored representation of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Stopped => "STOPPED",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Suspended => "SUSPENDED",
            InstanceStatus::Deleted => "DELETED",
        }
    }
}

impl ServerResource {
    /// Creates a new resource triple.
    pub fn new(cpu_cores: f64, ram_mb: u64, disk_gb: f64) -> Self {
        Self {
            cpu_cores,
            ram_mb,
            disk_gb,
        }
    }

    /// Checks that every amount is finite, non-negative and below the host-wide ceiling.
    pub fn validate(&self) -> NexusResult<()> {
        if !self.cpu_cores.is_finite() || !(0.0..=MAX_CPU_CORES).contains(&self.cpu_cores) {
            return Err(NexusError::InvalidArgument(format!(
                "invalid cpu limit: {} (at most {} cores)",
                self.cpu_cores, MAX_CPU_CORES
            )));
        }

        if self.ram_mb > MAX_RAM_MB {
            return Err(NexusError::InvalidArgument(format!(
                "invalid ram limit: {} MB (at most {} MB)",
                self.ram_mb, MAX_RAM_MB
            )));
        }

        if !self.disk_gb.is_finite() || !(0.0..=MAX_DISK_GB).contains(&self.disk_gb) {
            return Err(NexusError::InvalidArgument(format!(
                "invalid disk limit: {} GB (at most {} GB)",
                self.disk_gb, MAX_DISK_GB
            )));
        }

        Ok(())
    }

    /// The memory amount in bytes, or `None` when unlimited.
    pub fn ram_bytes(&self) -> Option<u64> {
        (self.ram_mb > 0).then(|| self.ram_mb.saturating_mul(MIB))
    }

    /// The disk amount in bytes, or `None` when unlimited.
    pub fn disk_bytes(&self) -> Option<u64> {
        // Float to int casts saturate, so an oversized amount cannot wrap.
        (self.disk_gb > 0.0).then(|| (self.disk_gb * GIB) as u64)
    }
}

impl LogEvent {
    /// Creates an event stamped with the current time.
    pub fn new(severity: Severity, source: LogSource, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            source,
            text: text.into(),
        }
    }

    /// An informational event from the host.
    pub fn info(text: impl Into<String>) -> Self {
        Self::new(Severity::Info, LogSource::System, text)
    }

    /// A warning from the host.
    pub fn warn(text: impl Into<String>) -> Self {
        Self::new(Severity::Warn, LogSource::System, text)
    }

    /// An error from the host.
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(Severity::Error, LogSource::System, text)
    }
}

impl<T> SessionFrame<T> {
    /// Whether this is the terminal frame.
    pub fn is_end(&self) -> bool {
        matches!(self, SessionFrame::End)
    }
}

impl Caller {
    /// A caller with admin rights.
    pub fn admin(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            is_admin: true,
        }
    }

    /// A regular user.
    pub fn user(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            is_admin: false,
        }
    }

    /// Whether the caller may see and act on `instance`.
    pub fn can_access(&self, instance: &Instance) -> bool {
        self.is_admin || instance.owner == self.identity
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for InstanceStatus {
    type Err = NexusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOPPED" => Ok(InstanceStatus::Stopped),
            "STARTING" => Ok(InstanceStatus::Starting),
            "RUNNING" => Ok(InstanceStatus::Running),
            "SUSPENDED" => Ok(InstanceStatus::Suspended),
            "DELETED" => Ok(InstanceStatus::Deleted),
            _ => Err(NexusError::custom(anyhow::anyhow!(
                "unknown instance status: {}",
                s
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transition_table() {
        use InstanceStatus::*;

        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Stopped));
        assert!(Suspended.can_transition_to(Deleted));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Suspended.can_transition_to(Running));
        assert!(!Suspended.can_transition_to(Starting));
        assert!(!Deleted.can_transition_to(Stopped));
        assert!(!Deleted.can_transition_to(Deleted));
    }

    #[test]
    fn test_status_round_trips_through_storage_form() {
        for status in [
            InstanceStatus::Stopped,
            InstanceStatus::Starting,
            InstanceStatus::Running,
            InstanceStatus::Suspended,
            InstanceStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<InstanceStatus>().unwrap(), status);
        }
        assert!("PAUSED".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_server_resource_serializes_like_the_panel() {
        let limits = ServerResource::new(1.0, 512, 5.0);
        let json = serde_json::to_value(limits).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "cpuCores": 1.0, "ramMB": 512, "diskGB": 5.0 })
        );

        assert!(ServerResource::new(-1.0, 0, 0.0).validate().is_err());
        assert!(ServerResource::new(0.0, 0, f64::NAN).validate().is_err());
        assert!(ServerResource::default().validate().is_ok());
    }

    #[test]
    fn test_oversized_limits_are_rejected() {
        assert!(matches!(
            ServerResource::new(1.0, 1 << 50, 1.0).validate(),
            Err(NexusError::InvalidArgument(_))
        ));
        assert!(ServerResource::new(MAX_CPU_CORES + 1.0, 0, 0.0)
            .validate()
            .is_err());
        assert!(ServerResource::new(0.0, 0, f64::INFINITY).validate().is_err());
        assert!(ServerResource::new(MAX_CPU_CORES, MAX_RAM_MB, MAX_DISK_GB)
            .validate()
            .is_ok());

        let huge = ServerResource::new(0.0, u64::MAX, f64::MAX);
        assert_eq!(huge.ram_bytes(), Some(u64::MAX));
        assert_eq!(huge.disk_bytes(), Some(u64::MAX));
        assert_eq!(ServerResource::default().ram_bytes(), None);
    }

    #[test]
    fn test_session_frame_wire_format() {
        let frame: LogFrame = SessionFrame::Dropped { count: 3 };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            serde_json::json!({ "type": "dropped", "data": { "count": 3 } })
        );

        let end: LogFrame = SessionFrame::End;
        assert_eq!(
            serde_json::to_value(&end).unwrap(),
            serde_json::json!({ "type": "end" })
        );
    }
}
